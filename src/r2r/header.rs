//! R2R header and section directory.

use std::fmt;

use tracing::debug;

use crate::binary::{read_u16, read_u32, read_u64, read_u8, Machine};
use crate::error::{R2rError, Result};

/// "RTR" in little-endian.
pub const READYTORUN_SIGNATURE: u32 = 0x0052_5452;

/// Major versions the reader understands.
pub const SUPPORTED_MAJOR_VERSIONS: std::ops::RangeInclusive<u16> = 1..=17;

const HEADER_SIZE: usize = 16;
const SECTION_ENTRY_SIZE: usize = 12;

/// `READYTORUN_FLAG_*` values.
pub const HEADER_FLAGS: [(u32, &str); 8] = [
    (0x0000_0001, "PLATFORM_NEUTRAL_SOURCE"),
    (0x0000_0002, "SKIP_TYPE_VALIDATION"),
    (0x0000_0004, "PARTIAL"),
    (0x0000_0008, "NONSHARED_PINVOKE_STUBS"),
    (0x0000_0010, "EMBEDDED_MSIL"),
    (0x0000_0020, "COMPONENT"),
    (0x0000_0040, "MULTIMODULE_VERSION_BUBBLE"),
    (0x0000_0080, "UNRELATED_R2R_CODE"),
];

macro_rules! section_types {
    ($($name:ident = $value:literal,)*) => {
        /// R2R section type (`ReadyToRunSectionType`).
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum SectionType {
            $($name,)*
            Unknown(u32),
        }

        impl SectionType {
            pub fn from_u32(value: u32) -> Self {
                match value {
                    $($value => SectionType::$name,)*
                    other => SectionType::Unknown(other),
                }
            }

            pub fn value(self) -> u32 {
                match self {
                    $(SectionType::$name => $value,)*
                    SectionType::Unknown(other) => other,
                }
            }

            pub fn name(self) -> String {
                match self {
                    $(SectionType::$name => stringify!($name).to_string(),)*
                    SectionType::Unknown(other) => format!("Unknown({other})"),
                }
            }
        }
    };
}

section_types! {
    CompilerIdentifier = 100,
    ImportSections = 101,
    RuntimeFunctions = 102,
    MethodDefEntryPoints = 103,
    ExceptionInfo = 104,
    DebugInfo = 105,
    DelayLoadMethodCallThunks = 106,
    AvailableTypesOld = 107,
    AvailableTypes = 108,
    InstanceMethodEntryPoints = 109,
    InliningInfo = 110,
    ProfileDataInfo = 111,
    ManifestMetadata = 112,
    AttributePresence = 113,
    InliningInfo2 = 114,
    ComponentAssemblies = 115,
    OwnerCompositeExecutable = 116,
    PgoInstrumentationData = 117,
    ManifestAssemblyMvids = 118,
    CrossModuleInlineInfo = 119,
    HotColdMap = 120,
    MethodIsGenericMap = 121,
    EnclosingTypeMap = 122,
    TypeGenericInfoMap = 123,
}

impl fmt::Display for SectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

/// One entry of the import section table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportSection {
    pub index: usize,
    pub rva: u32,
    pub size: u32,
    pub flags: u16,
    pub kind: u8,
    pub entry_size: u8,
    pub signature_rva: u32,
    pub aux_data_rva: u32,
    pub entries: Vec<ImportEntry>,
}

/// One slot of an import section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportEntry {
    pub index: usize,
    pub rva: u32,
    /// Slot contents as stored in the file.
    pub value: u64,
    /// RVA of the fixup signature; zero when the section has none.
    pub signature_rva: u32,
    /// First signature byte (`READYTORUN_FIXUP_*`).
    pub fixup_kind: Option<u8>,
}

impl ImportSection {
    pub const SIZE: usize = 20;

    pub fn flag_names(&self) -> Vec<&'static str> {
        [(0x0001, "EAGER"), (0x0002, "PCODE")]
            .iter()
            .filter(|(bit, _)| self.flags & bit != 0)
            .map(|&(_, name)| name)
            .collect()
    }

    pub fn kind_name(&self) -> &'static str {
        match self.kind & 0x7F {
            0 => "UNKNOWN",
            1 => "EXTERNAL_METHOD",
            2 => "STUB_DISPATCH",
            3 => "STRING_HANDLE",
            7 => "ILBODYFIXUPS",
            _ => "OTHER",
        }
    }
}

/// Method start → exception clause table, from the ExceptionInfo section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExceptionLookup {
    pub method_start_rva: u32,
    pub eh_info_rva: u32,
    pub clause_count: u32,
}

/// An entry of the MethodDefEntryPoints table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryPointRef {
    pub rid: u32,
    pub runtime_function: u32,
    pub fixup_offset: Option<usize>,
}

/// An entry of the AvailableTypes table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AvailableType {
    pub rid: u32,
    pub exported: bool,
}

/// Decoded contents of a section, for the types the reader understands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SectionContents {
    CompilerIdentifier(String),
    ImportSections(Vec<ImportSection>),
    RuntimeFunctions { count: u32 },
    MethodEntryPoints(Vec<EntryPointRef>),
    InstanceEntryPoints { count: u32 },
    ExceptionInfo(Vec<ExceptionLookup>),
    AvailableTypes(Vec<AvailableType>),
    Opaque,
}

/// A section directory entry.
#[derive(Debug, Clone)]
pub struct Section {
    pub kind: SectionType,
    pub rva: u32,
    pub size: u32,
    pub file_offset: usize,
    pub contents: SectionContents,
}

/// The R2R header.
#[derive(Debug, Clone)]
pub struct R2rHeader {
    pub rva: u32,
    pub signature: u32,
    pub major_version: u16,
    pub minor_version: u16,
    pub flags: u32,
    pub machine: Machine,
    /// Sections in file order.
    pub sections: Vec<Section>,
}

impl R2rHeader {
    /// Parses the header and its section directory at `offset`.
    ///
    /// Section contents are left `Opaque`; the image reader fills them in.
    pub fn parse(data: &[u8], offset: usize, rva: u32, machine: Machine) -> Result<Self> {
        let signature = read_u32(data, offset)?;
        if signature != READYTORUN_SIGNATURE {
            return Err(R2rError::format(format!(
                "Invalid R2R signature {signature:#010x}"
            )));
        }

        let major_version = read_u16(data, offset + 4)?;
        let minor_version = read_u16(data, offset + 6)?;
        if !SUPPORTED_MAJOR_VERSIONS.contains(&major_version) {
            return Err(R2rError::format(format!(
                "Unsupported R2R version {major_version}.{minor_version}"
            )));
        }

        let flags = read_u32(data, offset + 8)?;
        let count = read_u32(data, offset + 12)? as usize;
        debug!(major_version, minor_version, flags, count, "parsed R2R header");

        let mut sections: Vec<Section> = Vec::with_capacity(count.min(64));
        for i in 0..count {
            let entry = offset + HEADER_SIZE + i * SECTION_ENTRY_SIZE;
            let kind = SectionType::from_u32(read_u32(data, entry)?);
            if sections.iter().any(|s| s.kind == kind) {
                return Err(R2rError::format(format!("Duplicate section {kind}")));
            }
            sections.push(Section {
                kind,
                rva: read_u32(data, entry + 4)?,
                size: read_u32(data, entry + 8)?,
                file_offset: 0,
                contents: SectionContents::Opaque,
            });
        }

        Ok(Self {
            rva,
            signature,
            major_version,
            minor_version,
            flags,
            machine,
            sections,
        })
    }

    /// Size of the header and section directory in bytes.
    pub fn size(&self) -> usize {
        HEADER_SIZE + self.sections.len() * SECTION_ENTRY_SIZE
    }

    pub fn section(&self, kind: SectionType) -> Option<&Section> {
        self.sections.iter().find(|s| s.kind == kind)
    }

    /// Names of the set `READYTORUN_FLAG_*` bits; unknown bits as hex.
    pub fn flag_names(&self) -> Vec<String> {
        let mut names: Vec<String> = HEADER_FLAGS
            .iter()
            .filter(|(bit, _)| self.flags & bit != 0)
            .map(|(_, name)| format!("READYTORUN_FLAG_{name}"))
            .collect();
        let known = HEADER_FLAGS.iter().fold(0, |acc, (bit, _)| acc | bit);
        if self.flags & !known != 0 {
            names.push(format!("{:#x}", self.flags & !known));
        }
        names
    }
}

/// Reads the import section table spanning `data[offset..offset + size]`.
pub(crate) fn read_import_sections(
    data: &[u8],
    offset: usize,
    size: usize,
    pointer_size: usize,
    rva_to_offset: impl Fn(u32) -> Result<usize>,
) -> Result<Vec<ImportSection>> {
    let mut sections = Vec::with_capacity(size / ImportSection::SIZE);
    for index in 0..size / ImportSection::SIZE {
        let at = offset + index * ImportSection::SIZE;
        let mut section = ImportSection {
            index,
            rva: read_u32(data, at)?,
            size: read_u32(data, at + 4)?,
            flags: read_u16(data, at + 8)?,
            kind: read_u8(data, at + 10)?,
            entry_size: read_u8(data, at + 11)?,
            signature_rva: read_u32(data, at + 12)?,
            aux_data_rva: read_u32(data, at + 16)?,
            entries: Vec::new(),
        };

        let entry_size = match section.entry_size {
            0 => pointer_size,
            n => n as usize,
        };
        let count = section.size as usize / entry_size;
        let slots = if count > 0 { Some(rva_to_offset(section.rva)?) } else { None };
        let signatures = match section.signature_rva {
            0 => None,
            rva => Some(rva_to_offset(rva)?),
        };

        for slot in 0..count {
            let slot_offset = slots.map_or(0, |base| base + slot * entry_size);
            let value = match entry_size {
                4 => u64::from(read_u32(data, slot_offset)?),
                _ => read_u64(data, slot_offset)?,
            };
            let (signature_rva, fixup_kind) = match signatures {
                Some(base) => {
                    let sig_rva = read_u32(data, base + slot * 4)?;
                    let kind = rva_to_offset(sig_rva)
                        .ok()
                        .and_then(|o| data.get(o).copied());
                    (sig_rva, kind)
                }
                None => (0, None),
            };
            section.entries.push(ImportEntry {
                index: slot,
                rva: section.rva + (slot * entry_size) as u32,
                value,
                signature_rva,
                fixup_kind,
            });
        }
        sections.push(section);
    }
    Ok(sections)
}
