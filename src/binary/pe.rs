//! PE (Portable Executable) layout.

use object::pe::{
    ImageCor20Header, ImageDosHeader, ImageNtHeaders32, ImageNtHeaders64,
    IMAGE_DIRECTORY_ENTRY_COM_DESCRIPTOR,
};
use object::read::pe::ImageNtHeaders;
use object::{BinaryFormat, Bytes, FileKind, Object, ObjectSection, LittleEndian as LE};
use tracing::debug;

use super::{Machine, SectionInfo};
use crate::error::{R2rError, Result};

/// Export that marks the R2R header of a composite image.
const RTR_HEADER_EXPORT: &[u8] = b"RTR_HEADER";

/// CLI header (IMAGE_COR20_HEADER), the fields the reader uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cor20Header {
    pub cb: u32,
    pub major_runtime_version: u16,
    pub minor_runtime_version: u16,
    pub metadata_rva: u32,
    pub metadata_size: u32,
    pub flags: u32,
    pub managed_native_header_rva: u32,
    pub managed_native_header_size: u32,
}

impl From<&ImageCor20Header> for Cor20Header {
    fn from(raw: &ImageCor20Header) -> Self {
        Self {
            cb: raw.cb.get(LE),
            major_runtime_version: raw.major_runtime_version.get(LE),
            minor_runtime_version: raw.minor_runtime_version.get(LE),
            metadata_rva: raw.meta_data.virtual_address.get(LE),
            metadata_size: raw.meta_data.size.get(LE),
            flags: raw.flags.get(LE),
            managed_native_header_rva: raw.managed_native_header.virtual_address.get(LE),
            managed_native_header_size: raw.managed_native_header.size.get(LE),
        }
    }
}

/// Section table and header fields of a PE image.
#[derive(Debug, Clone)]
pub struct PeLayout {
    pub machine: Machine,
    pub image_base: u64,
    pub sections: Vec<SectionInfo>,
    pub cor20: Option<Cor20Header>,
    /// RVA of the `RTR_HEADER` export, present on composite images.
    pub rtr_header_export: Option<u32>,
}

impl PeLayout {
    /// Parses the container. Anything but a PE image is a format error.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let obj = object::File::parse(data)?;
        if obj.format() != BinaryFormat::Pe {
            return Err(R2rError::format(format!(
                "Unsupported binary format: {:?}",
                obj.format()
            )));
        }

        let image_base = obj.relative_address_base();
        let sections = collect_pe_sections(&obj, image_base);
        if sections.is_empty() {
            return Err(R2rError::format("No sections found in PE file"));
        }

        let rtr_header_export = obj
            .exports()?
            .iter()
            .find(|e| e.name() == RTR_HEADER_EXPORT)
            .map(|e| e.address().wrapping_sub(image_base) as u32);

        let (machine, cor20) = match FileKind::parse(data)? {
            FileKind::Pe32 => read_nt_headers::<ImageNtHeaders32>(data)?,
            FileKind::Pe64 => read_nt_headers::<ImageNtHeaders64>(data)?,
            kind => return Err(R2rError::format(format!("Unsupported binary format: {kind:?}"))),
        };

        Ok(Self {
            machine: Machine::decode(machine),
            image_base,
            sections,
            cor20,
            rtr_header_export,
        })
    }

    /// Converts an RVA to a file offset.
    pub fn rva_to_offset(&self, rva: u32) -> Result<usize> {
        self.sections
            .iter()
            .find(|s| s.contains_rva(rva))
            .map(|s| (u64::from(rva - s.rva) + s.file_offset) as usize)
            .ok_or_else(|| R2rError::format(format!("RVA {:#X} not found in any section", rva)))
    }

    /// Returns the section containing `rva`.
    pub fn section_for_rva(&self, rva: u32) -> Option<&SectionInfo> {
        self.sections.iter().find(|s| s.contains_rva(rva))
    }

    /// Borrows `len` file bytes starting at `rva` from `data`.
    pub fn bytes_at<'a>(&self, data: &'a [u8], rva: u32, len: usize) -> Result<&'a [u8]> {
        let offset = self.rva_to_offset(rva)?;
        data.get(offset..offset.saturating_add(len)).ok_or_else(|| {
            R2rError::malformed(offset, format!("{len} bytes at RVA {rva:#X} exceed file bounds"))
        })
    }
}

/// Reads the machine field and the CLI header from the NT headers.
fn read_nt_headers<Pe: ImageNtHeaders>(data: &[u8]) -> Result<(u16, Option<Cor20Header>)> {
    let dos_header = ImageDosHeader::parse(data)?;
    let mut offset = dos_header.nt_headers_offset().into();
    let (nt_headers, data_dirs) = Pe::parse(data, &mut offset)?;
    let machine = nt_headers.file_header().machine.get(LE);

    let Some(dir) = data_dirs
        .get(IMAGE_DIRECTORY_ENTRY_COM_DESCRIPTOR)
        .filter(|d| d.virtual_address.get(LE) != 0 && d.size.get(LE) != 0)
    else {
        return Ok((machine, None));
    };

    let sections = nt_headers.sections(data, offset)?;
    let cli_data = Bytes(dir.data(data, &sections)?);
    let raw = cli_data
        .read_at::<ImageCor20Header>(0)
        .map_err(|()| R2rError::format(format!("CLI header truncated: {} bytes", cli_data.len())))?;
    debug!(rva = dir.virtual_address.get(LE), size = dir.size.get(LE), "found CLI header");

    Ok((machine, Some(Cor20Header::from(raw))))
}

fn collect_pe_sections(obj: &object::File<'_>, image_base: u64) -> Vec<SectionInfo> {
    obj.sections()
        .filter_map(|s| {
            let (file_offset, raw_size) = s.file_range()?;
            Some(SectionInfo {
                name: s.name().unwrap_or_default().to_string(),
                rva: s.address().wrapping_sub(image_base) as u32,
                virtual_size: s.size() as u32,
                file_offset,
                raw_size,
            })
        })
        .collect()
}
