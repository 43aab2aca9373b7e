//! ReadyToRun image reader.
//!
//! Opens a PE file, locates the R2R header, decodes the section directory
//! and every table the dumper needs, and binds each native code body to
//! the managed method it was compiled from. Parsing is eager: once
//! [`R2rImage::open`] returns, lookups never touch the file again.

pub mod header;
pub mod method;
pub mod native;
pub mod unwind;

use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use memmap2::Mmap;
use tracing::{debug, warn};

use crate::binary::{read_cstr, read_u32, Architecture, PeLayout};
use crate::error::{R2rError, Result};
use crate::metadata::signature::{GenericContext, ModuleResolver, SignatureDecoder};
use crate::metadata::tables::table;
use crate::metadata::EcmaMetadata;
use crate::options::{AssemblyResolver, DumpOptions};

use header::{
    read_import_sections, AvailableType, EntryPointRef, ExceptionLookup, R2rHeader,
    SectionContents, SectionType,
};
use method::{describe_method, ByteSpan, EntryPointKind, Method, OwnerType, RuntimeFunction};
use native::{decode_unsigned, read_entry_point, read_fixups, NativeArray, NativeHashtable};
use unwind::{Amd64UnwindInfo, Arm64UnwindInfo, EhClause, UnwindInfo};

// READYTORUN_METHOD_SIG_* flags of instance entry point signatures.
const SIG_METHOD_INSTANTIATION: u32 = 0x04;
const SIG_SLOT_INSTEAD_OF_TOKEN: u32 = 0x08;
const SIG_MEMBER_REF_TOKEN: u32 = 0x10;
const SIG_CONSTRAINED: u32 = 0x20;
const SIG_OWNER_TYPE: u32 = 0x40;

/// A parsed ReadyToRun image.
pub struct R2rImage {
    path: PathBuf,
    data: Mmap,
    layout: PeLayout,
    metadata: Option<Rc<EcmaMetadata>>,
    pub header: R2rHeader,
    /// Methods in entry point table order: MethodDef entries, then instance entries.
    pub methods: Vec<Method>,
    /// Number of entries in the runtime function table.
    pub runtime_function_count: u32,
    /// True when the header was found through the `RTR_HEADER` export.
    pub is_composite: bool,
}

/// A raw runtime function table entry.
#[derive(Debug, Clone, Copy)]
struct RawRuntimeFunction {
    start_rva: u32,
    end_rva: Option<u32>,
    unwind_rva: u32,
}

/// A method entry point before it is bound to metadata.
struct PendingMethod {
    token: u32,
    kind: EntryPointKind,
    runtime_function: u32,
    fixup_offset: Option<usize>,
    owner: Option<OwnerType>,
    method_args: Vec<String>,
}

/// A decoded instance entry point.
enum InstanceEntry {
    Method(PendingMethod),
    /// Names its method by vtable slot; only its code is accounted for.
    Slot { slot: u32, runtime_function: u32 },
}

impl R2rImage {
    /// Opens and fully parses the image at `path`.
    pub fn open(path: &Path, options: &DumpOptions) -> Result<Self> {
        let file = File::open(path)?;
        let data = unsafe { Mmap::map(&file)? };
        let layout = PeLayout::parse(&data)?;

        let (header_rva, is_composite) = match (&layout.cor20, layout.rtr_header_export) {
            (Some(cor20), _) if cor20.managed_native_header_rva != 0 => {
                (cor20.managed_native_header_rva, false)
            }
            (_, Some(rva)) => (rva, true),
            _ => return Err(R2rError::format("Image is not a ReadyToRun image")),
        };

        let header_offset = layout.rva_to_offset(header_rva)?;
        let mut header = R2rHeader::parse(&data, header_offset, header_rva, layout.machine)?;
        for section in &mut header.sections {
            if section.size != 0 {
                section.file_offset = layout.rva_to_offset(section.rva)?;
                layout.bytes_at(&data, section.rva, section.size as usize)?;
            }
        }

        let metadata = match &layout.cor20 {
            Some(cor20) if cor20.metadata_rva != 0 => {
                let bytes =
                    layout.bytes_at(&data, cor20.metadata_rva, cor20.metadata_size as usize)?;
                Some(Rc::new(EcmaMetadata::parse(bytes.to_vec())?))
            }
            _ => None,
        };

        debug!(
            path = %path.display(),
            machine = %layout.machine,
            sections = header.sections.len(),
            composite = is_composite,
            "opened R2R image"
        );

        let mut image = Self {
            path: path.to_path_buf(),
            data,
            layout,
            metadata,
            header,
            methods: Vec::new(),
            runtime_function_count: 0,
            is_composite,
        };
        image.parse_tables(options)?;
        Ok(image)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The whole file.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn layout(&self) -> &PeLayout {
        &self.layout
    }

    pub fn metadata(&self) -> Option<&Rc<EcmaMetadata>> {
        self.metadata.as_ref()
    }

    /// The compiler identifier string, if the image carries one.
    pub fn compiler_identifier(&self) -> Option<&str> {
        self.header
            .section(SectionType::CompilerIdentifier)
            .and_then(|s| match &s.contents {
                SectionContents::CompilerIdentifier(id) => Some(id.as_str()),
                _ => None,
            })
    }

    /// File bytes of `[rva, rva + len)`.
    pub fn bytes(&self, rva: u32, len: usize) -> Result<&[u8]> {
        self.layout.bytes_at(&self.data, rva, len)
    }

    /// Iterates every runtime function of every method.
    pub fn runtime_functions(&self) -> impl Iterator<Item = &RuntimeFunction> {
        self.methods.iter().flat_map(|m| m.runtime_functions.iter())
    }

    fn parse_tables(&mut self, options: &DumpOptions) -> Result<()> {
        let data: &[u8] = &self.data;
        let arch = self.layout.machine.architecture;

        let compiler_identifier = match self.header.section(SectionType::CompilerIdentifier) {
            Some(s) => {
                let bytes = self.layout.bytes_at(data, s.rva, s.size as usize)?;
                Some(read_cstr(bytes, 0)?)
            }
            None => None,
        };

        let import_sections = match self.header.section(SectionType::ImportSections) {
            Some(s) => Some(read_import_sections(
                data,
                s.file_offset,
                s.size as usize,
                self.layout.machine.pointer_size(),
                |rva| self.layout.rva_to_offset(rva),
            )?),
            None => None,
        };

        let exception_lookups = match self.header.section(SectionType::ExceptionInfo) {
            Some(s) => read_exception_lookups(data, s.file_offset, s.size as usize)?,
            None => Vec::new(),
        };

        let raw_functions = match self.header.section(SectionType::RuntimeFunctions) {
            Some(s) => read_runtime_function_table(data, s.file_offset, s.size as usize, arch)?,
            None => Vec::new(),
        };
        let rtf_count = raw_functions.len() as u32;

        let entry_points = match self
            .header
            .section(SectionType::MethodDefEntryPoints)
            .filter(|s| s.size != 0)
        {
            Some(s) => read_method_def_entry_points(data, s.file_offset)?,
            None => Vec::new(),
        };

        let available_types = match self
            .header
            .section(SectionType::AvailableTypes)
            .filter(|s| s.size != 0)
        {
            Some(s) => Some(read_available_types(data, s.file_offset)?),
            None => None,
        };

        let instance_offsets = match self
            .header
            .section(SectionType::InstanceMethodEntryPoints)
            .filter(|s| s.size != 0)
        {
            Some(s) => NativeHashtable::parse(data, s.file_offset)?.entries(data)?,
            None => Vec::new(),
        };

        let methods = match &self.metadata {
            Some(metadata) => {
                let mut resolver = AssemblyResolver::new(Rc::clone(metadata), &self.path, options);
                let mut pending: Vec<PendingMethod> = entry_points
                    .iter()
                    .map(|ep| PendingMethod {
                        token: 0x0600_0000 | ep.rid,
                        kind: EntryPointKind::MethodDef,
                        runtime_function: ep.runtime_function,
                        fixup_offset: ep.fixup_offset,
                        owner: None,
                        method_args: Vec::new(),
                    })
                    .collect();
                let mut slot_functions = Vec::new();
                for &offset in &instance_offsets {
                    match read_instance_entry(data, offset, metadata, &mut resolver)? {
                        InstanceEntry::Method(entry) => pending.push(entry),
                        InstanceEntry::Slot {
                            slot,
                            runtime_function,
                        } => {
                            warn!(
                                offset,
                                slot,
                                runtime_function,
                                "skipping slot-based instance entry point"
                            );
                            slot_functions.push(runtime_function);
                        }
                    }
                }

                let context = FunctionContext {
                    data,
                    layout: &self.layout,
                    raw: &raw_functions,
                    exception_lookups: &exception_lookups,
                    arch,
                };
                build_methods(pending, &slot_functions, metadata, &mut resolver, &context)?
            }
            None => {
                warn!(
                    path = %self.path.display(),
                    "image has no component metadata; method list is empty"
                );
                Vec::new()
            }
        };

        debug!(
            runtime_functions = rtf_count,
            methods = methods.len(),
            "decoded R2R tables"
        );

        let instance_count = instance_offsets.len() as u32;
        for section in &mut self.header.sections {
            section.contents = match section.kind {
                SectionType::CompilerIdentifier => compiler_identifier
                    .clone()
                    .map_or(SectionContents::Opaque, SectionContents::CompilerIdentifier),
                SectionType::ImportSections => import_sections
                    .clone()
                    .map_or(SectionContents::Opaque, SectionContents::ImportSections),
                SectionType::RuntimeFunctions => {
                    SectionContents::RuntimeFunctions { count: rtf_count }
                }
                SectionType::MethodDefEntryPoints => {
                    SectionContents::MethodEntryPoints(entry_points.clone())
                }
                SectionType::InstanceMethodEntryPoints => {
                    SectionContents::InstanceEntryPoints { count: instance_count }
                }
                SectionType::ExceptionInfo => {
                    SectionContents::ExceptionInfo(exception_lookups.clone())
                }
                SectionType::AvailableTypes => available_types
                    .clone()
                    .map_or(SectionContents::Opaque, SectionContents::AvailableTypes),
                _ => SectionContents::Opaque,
            };
        }

        self.methods = methods;
        self.runtime_function_count = rtf_count;
        Ok(())
    }
}

/// Inputs shared by every runtime function of the image.
struct FunctionContext<'a> {
    data: &'a [u8],
    layout: &'a PeLayout,
    raw: &'a [RawRuntimeFunction],
    exception_lookups: &'a [ExceptionLookup],
    arch: Architecture,
}

fn read_runtime_function_table(
    data: &[u8],
    offset: usize,
    size: usize,
    arch: Architecture,
) -> Result<Vec<RawRuntimeFunction>> {
    let entry_size = if arch == Architecture::Amd64 { 12 } else { 8 };
    (0..size / entry_size)
        .map(|i| -> Result<RawRuntimeFunction> {
            let at = offset + i * entry_size;
            Ok(if entry_size == 12 {
                RawRuntimeFunction {
                    start_rva: read_u32(data, at)?,
                    end_rva: Some(read_u32(data, at + 4)?),
                    unwind_rva: read_u32(data, at + 8)?,
                }
            } else {
                RawRuntimeFunction {
                    start_rva: read_u32(data, at)?,
                    end_rva: None,
                    unwind_rva: read_u32(data, at + 4)?,
                }
            })
        })
        .collect()
}

fn read_exception_lookups(data: &[u8], offset: usize, size: usize) -> Result<Vec<ExceptionLookup>> {
    let count = size / 8;
    let mut lookups = Vec::with_capacity(count.saturating_sub(1));
    // The last entry is a sentinel bounding the final clause list.
    for i in 0..count.saturating_sub(1) {
        let at = offset + i * 8;
        let eh_info_rva = read_u32(data, at + 4)?;
        let next = read_u32(data, at + 12)?;
        lookups.push(ExceptionLookup {
            method_start_rva: read_u32(data, at)?,
            eh_info_rva,
            clause_count: next.saturating_sub(eh_info_rva) / EhClause::SIZE as u32,
        });
    }
    Ok(lookups)
}

fn read_method_def_entry_points(data: &[u8], offset: usize) -> Result<Vec<EntryPointRef>> {
    let array = NativeArray::parse(data, offset)?;
    let mut entries = Vec::new();
    for rid in 1..=array.len() {
        if let Some(at) = array.get(data, rid - 1)? {
            let (runtime_function, fixup_offset) = read_entry_point(data, at)?;
            entries.push(EntryPointRef {
                rid,
                runtime_function,
                fixup_offset,
            });
        }
    }
    Ok(entries)
}

fn read_available_types(data: &[u8], offset: usize) -> Result<Vec<AvailableType>> {
    NativeHashtable::parse(data, offset)?
        .entries(data)?
        .into_iter()
        .map(|mut at| -> Result<AvailableType> {
            let value = decode_unsigned(data, &mut at)?;
            Ok(AvailableType {
                rid: value >> 1,
                exported: value & 1 != 0,
            })
        })
        .collect()
}

/// Decodes one instance entry point signature and its entry record.
fn read_instance_entry(
    data: &[u8],
    offset: usize,
    metadata: &Rc<EcmaMetadata>,
    modules: &mut dyn ModuleResolver,
) -> Result<InstanceEntry> {
    let context = GenericContext::default();
    let mut decoder = SignatureDecoder::new(Rc::clone(metadata), &data[offset..], &context)
        .with_modules(modules);

    let flags = decoder.read_compressed()?;
    let owner = if flags & SIG_OWNER_TYPE != 0 {
        let (name, args) = decoder.read_type_with_args()?;
        Some(OwnerType { name, args })
    } else {
        None
    };

    // Either a vtable slot or a MethodDef/MemberRef row follows.
    let rid_or_slot = decoder.read_compressed()?;
    let token = if flags & SIG_SLOT_INSTEAD_OF_TOKEN != 0 {
        None
    } else if flags & SIG_MEMBER_REF_TOKEN != 0 {
        Some((u32::from(table::MEMBER_REF) << 24) | rid_or_slot)
    } else {
        Some((u32::from(table::METHOD_DEF) << 24) | rid_or_slot)
    };

    let mut method_args = Vec::new();
    if flags & SIG_METHOD_INSTANTIATION != 0 {
        let count = decoder.read_compressed()?;
        for _ in 0..count {
            method_args.push(decoder.read_type()?);
        }
    }
    if flags & SIG_CONSTRAINED != 0 {
        let constrained = decoder.read_type()?;
        debug!(constrained = %constrained, "constrained instance entry point");
    }

    let (runtime_function, fixup_offset) = read_entry_point(data, offset + decoder.offset())?;
    let Some(token) = token else {
        return Ok(InstanceEntry::Slot {
            slot: rid_or_slot,
            runtime_function,
        });
    };
    Ok(InstanceEntry::Method(PendingMethod {
        token,
        kind: EntryPointKind::Instance,
        runtime_function,
        fixup_offset,
        owner,
        method_args,
    }))
}

/// Binds entry points to metadata and groups funclets under their method.
///
/// `slot_functions` are main bodies with no method of their own; they only
/// end the funclet run of the preceding method.
fn build_methods(
    pending: Vec<PendingMethod>,
    slot_functions: &[u32],
    metadata: &Rc<EcmaMetadata>,
    modules: &mut dyn ModuleResolver,
    ctx: &FunctionContext<'_>,
) -> Result<Vec<Method>> {
    let count = ctx.raw.len();
    let mut is_entry_point = vec![false; count];
    let starts = pending.iter().map(|p| p.runtime_function);
    for id in starts.chain(slot_functions.iter().copied()) {
        if let Some(flag) = is_entry_point.get_mut(id as usize) {
            *flag = true;
        }
    }

    let eh: HashMap<u32, &ExceptionLookup> = ctx
        .exception_lookups
        .iter()
        .map(|l| (l.method_start_rva, l))
        .collect();

    let mut unwind_offsets: Vec<usize> = ctx
        .raw
        .iter()
        .filter_map(|r| ctx.layout.rva_to_offset(r.unwind_rva).ok())
        .collect();
    unwind_offsets.sort_unstable();
    unwind_offsets.dedup();

    let mut methods = Vec::with_capacity(pending.len());
    for p in pending {
        let first = p.runtime_function as usize;
        if first >= count {
            warn!(
                token = p.token,
                runtime_function = p.runtime_function,
                "entry point refers to a missing runtime function"
            );
            continue;
        }

        let description = describe_method(metadata, p.token, p.owner, p.method_args, modules)?;
        let fixups = match p.fixup_offset {
            Some(offset) => read_fixups(ctx.data, offset)?,
            None => Vec::new(),
        };

        let mut runtime_functions = Vec::new();
        let mut id = first;
        loop {
            let main_body = id == first;
            let rtf = read_runtime_function(ctx, id, main_body, &eh, &unwind_offsets)?;
            runtime_functions.push(rtf);
            id += 1;
            if id >= count || is_entry_point[id] {
                break;
            }
        }

        methods.push(Method {
            rid: p.token & 0x00FF_FFFF,
            token: p.token,
            name: description.name,
            owning_type: description.owning_type,
            return_type: description.return_type,
            parameters: description.parameters,
            method_args: description.method_args,
            signature: description.signature,
            signature_bytes: description.signature_bytes,
            fixups,
            entry_point: p.kind,
            runtime_functions,
        });
    }
    Ok(methods)
}

fn read_runtime_function(
    ctx: &FunctionContext<'_>,
    id: usize,
    main_body: bool,
    eh: &HashMap<u32, &ExceptionLookup>,
    unwind_offsets: &[usize],
) -> Result<RuntimeFunction> {
    let raw = ctx.raw[id];
    let unwind_offset = ctx.layout.rva_to_offset(raw.unwind_rva)?;
    let unwind = match ctx.arch {
        Architecture::Amd64 => UnwindInfo::Amd64(Amd64UnwindInfo::parse(ctx.data, unwind_offset)?),
        Architecture::Arm64 => UnwindInfo::Arm64(Arm64UnwindInfo::parse(ctx.data, unwind_offset)?),
        _ => UnwindInfo::Undecoded,
    };

    let size = match (raw.end_rva, &unwind) {
        (Some(end), _) => end.saturating_sub(raw.start_rva),
        (None, UnwindInfo::Arm64(info)) if info.function_length != 0 => info.function_length,
        _ => match ctx.raw.get(id + 1) {
            Some(next) => next.start_rva.saturating_sub(raw.start_rva),
            None => ctx
                .layout
                .section_for_rva(raw.start_rva)
                .map_or(0, |s| s.end_rva().saturating_sub(raw.start_rva)),
        },
    };

    let gc_info = if main_body {
        unwind.size().and_then(|unwind_size| {
            let start = unwind_offset + unwind_size;
            let limit = unwind_offsets
                .iter()
                .copied()
                .find(|&o| o > unwind_offset)
                .or_else(|| {
                    ctx.layout
                        .section_for_rva(raw.unwind_rva)
                        .map(|s| (s.file_offset + s.raw_size) as usize)
                })?;
            (limit > start).then_some(ByteSpan {
                rva: raw.unwind_rva + unwind_size as u32,
                offset: start,
                len: limit - start,
            })
        })
    } else {
        None
    };

    let eh_clauses = match eh.get(&raw.start_rva) {
        Some(lookup) => {
            let base = ctx.layout.rva_to_offset(lookup.eh_info_rva)?;
            (0..lookup.clause_count as usize)
                .map(|i| EhClause::parse(ctx.data, base + i * EhClause::SIZE))
                .collect::<Result<Vec<_>>>()?
        }
        None => Vec::new(),
    };

    Ok(RuntimeFunction {
        id: id as u32,
        start_rva: raw.start_rva,
        size,
        unwind_rva: raw.unwind_rva,
        unwind,
        gc_info,
        eh_clauses,
    })
}
