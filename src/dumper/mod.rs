//! Text and XML rendering of a parsed image.
//!
//! Both renderers implement [`Dumper`]. The field lists they print come
//! from the builders in this module, so the two formats always agree on
//! what is shown and what `naked` / `ignore_sensitive` hide.

mod text;
mod xml;

use tracing::warn;

use crate::disasm::Disassembler;
use crate::error::Result;
use crate::options::{parse_number, DumpOptions};
use crate::r2r::header::{Section, SectionContents};
use crate::r2r::method::{EntryPointKind, Method, RuntimeFunction};
use crate::r2r::unwind::UnwindInfo;
use crate::r2r::R2rImage;

pub use text::TextDumper;
pub use xml::{write_xml_error, XmlDumper};

/// A named value printed by a renderer.
pub type Field = (&'static str, String);

/// A named group of fields: one line of text, one XML element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub name: &'static str,
    pub fields: Vec<Field>,
}

impl Record {
    fn new(name: &'static str, fields: Vec<Field>) -> Self {
        Self { name, fields }
    }
}

/// Output operations shared by the text and XML renderers.
///
/// Every operation can be called any number of times between `begin`
/// and `end`.
pub trait Dumper {
    fn begin(&mut self) -> Result<()>;
    fn end(&mut self) -> Result<()>;
    fn write_divider(&mut self, title: &str) -> Result<()>;
    fn write_sub_divider(&mut self) -> Result<()>;
    fn skip_line(&mut self) -> Result<()>;
    fn dump_header(&mut self, dump_sections: bool) -> Result<()>;
    fn dump_section(&mut self, section: &Section) -> Result<()>;
    fn dump_entry_points(&mut self) -> Result<()>;
    fn dump_all_methods(&mut self) -> Result<()>;
    fn dump_method(&mut self, method: &Method) -> Result<()>;
    fn dump_runtime_function(&mut self, rtf: &RuntimeFunction) -> Result<()>;
    fn dump_disasm(&mut self, rtf: &RuntimeFunction) -> Result<()>;
    fn dump_bytes(&mut self, rva: u32, size: usize, name: &str) -> Result<()>;
    fn dump_section_contents(&mut self, section: &Section) -> Result<()>;
    fn dump_query_count(&mut self, query: &str, title: &str, count: usize) -> Result<()>;
}

/// Creates the renderer `options` select.
pub fn create_dumper<'a>(
    image: &'a R2rImage,
    options: &'a DumpOptions,
    disassembler: Option<&'a Disassembler>,
    out: &'a mut dyn std::io::Write,
) -> Box<dyn Dumper + 'a> {
    if options.xml {
        Box::new(XmlDumper::new(image, options, disassembler, out))
    } else {
        Box::new(TextDumper::new(image, options, disassembler, out))
    }
}

/// Dumps one image, either everything or only what the queries select.
pub fn dump_image(dumper: &mut dyn Dumper, image: &R2rImage, options: &DumpOptions) -> Result<()> {
    dumper.begin()?;

    if !options.has_queries() {
        if options.header || !options.entrypoints {
            dumper.write_divider("R2R Header")?;
            dumper.dump_header(true)?;
        }
        if options.entrypoints {
            dumper.dump_entry_points()?;
        }
        if !options.header && !options.entrypoints {
            dumper.dump_all_methods()?;
        }
    } else {
        if options.header {
            dumper.dump_header(false)?;
        }
        query_sections(dumper, image, &options.sections)?;
        query_runtime_functions(dumper, image, &options.runtime_functions)?;
        query_methods(dumper, image, "R2R Methods by Query", &options.queries, true)?;
        query_methods(dumper, image, "R2R Methods by Keyword", &options.keywords, false)?;
    }

    dumper.end()
}

fn query_sections(dumper: &mut dyn Dumper, image: &R2rImage, queries: &[String]) -> Result<()> {
    if !queries.is_empty() {
        dumper.write_divider("R2R Section")?;
    }
    for q in queries {
        let found = find_section(image, q);
        dumper.dump_query_count(q, "Sections", found.len())?;
        for section in found {
            dumper.dump_section(section)?;
        }
    }
    Ok(())
}

fn query_runtime_functions(
    dumper: &mut dyn Dumper,
    image: &R2rImage,
    queries: &[u32],
) -> Result<()> {
    if !queries.is_empty() {
        dumper.write_divider("Runtime Functions")?;
    }
    for &q in queries {
        let Some(rtf) = find_runtime_function(image, q) else {
            warn!("Unable to find runtime function by id or address {q}");
            continue;
        };
        dumper.dump_query_count(&q.to_string(), "Runtime Function", 1)?;
        dumper.dump_runtime_function(rtf)?;
    }
    Ok(())
}

fn query_methods(
    dumper: &mut dyn Dumper,
    image: &R2rImage,
    title: &str,
    queries: &[String],
    exact: bool,
) -> Result<()> {
    if !queries.is_empty() {
        dumper.write_divider(title)?;
    }
    for q in queries {
        let found = find_method(image, q, exact);
        dumper.dump_query_count(q, "Methods", found.len())?;
        for method in found {
            dumper.dump_method(method)?;
        }
    }
    Ok(())
}

/// Methods matching `query` by name, signature, row id or token.
pub fn find_method<'a>(image: &'a R2rImage, query: &str, exact: bool) -> Vec<&'a Method> {
    image.methods.iter().filter(|m| m.matches(query, exact)).collect()
}

/// Sections whose type value equals `query`, or whose type name contains it.
pub fn find_section<'a>(image: &'a R2rImage, query: &str) -> Vec<&'a Section> {
    let number = parse_number(query);
    let needle = query.to_lowercase();
    image
        .header
        .sections
        .iter()
        .filter(|s| {
            number == Some(s.kind.value()) || s.kind.name().to_lowercase().contains(&needle)
        })
        .collect()
}

/// The runtime function with id `query`, or the one whose code contains it.
pub fn find_runtime_function(image: &R2rImage, query: u32) -> Option<&RuntimeFunction> {
    image
        .runtime_functions()
        .find(|rtf| rtf.id == query || rtf.contains(query))
}

/// Sections in file order, or by type value when normalizing.
pub fn normalized_sections<'a>(image: &'a R2rImage, options: &DumpOptions) -> Vec<&'a Section> {
    let mut sections: Vec<&Section> = image.header.sections.iter().collect();
    if options.normalize {
        sections.sort_by_key(|s| s.kind.value());
    }
    sections
}

/// Methods in table order, or by signature when normalizing.
pub fn normalized_methods<'a>(image: &'a R2rImage, options: &DumpOptions) -> Vec<&'a Method> {
    let mut methods: Vec<&Method> = image.methods.iter().collect();
    if options.normalize {
        methods.sort_by(|a, b| a.signature.cmp(&b.signature));
    }
    methods
}

/// Which environment dependent values a renderer prints.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Visibility {
    /// RVAs, file offsets, image base.
    pub addresses: bool,
    /// File path, compiler identifier.
    pub environment: bool,
}

impl Visibility {
    pub(crate) fn new(options: &DumpOptions) -> Self {
        let sensitive = options.xml && options.ignore_sensitive;
        Self {
            addresses: !options.naked && !sensitive,
            environment: !sensitive,
        }
    }
}

/// Bytes as `01-02-03`.
pub fn hex_dashed(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join("-")
}

fn hex(value: impl Into<u64>) -> String {
    format!("0x{:08X}", value.into())
}

/// Signature text, with the blob embedded when `inline_signature_binary` is set.
pub fn signature_text(method: &Method, options: &DumpOptions) -> String {
    if options.inline_signature_binary {
        format!("{} [{}]", method.signature, hex_dashed(&method.signature_bytes))
    } else {
        method.signature.clone()
    }
}

pub(crate) fn header_fields(image: &R2rImage, vis: Visibility) -> Vec<Field> {
    let h = &image.header;
    let mut fields = vec![
        ("Signature", format!("0x{:08X} (RTR)", h.signature)),
        ("MajorVersion", h.major_version.to_string()),
        ("MinorVersion", h.minor_version.to_string()),
        ("Flags", format!("0x{:08X}", h.flags)),
    ];
    for name in h.flag_names() {
        fields.push(("Flag", name));
    }
    fields.push(("Machine", h.machine.to_string()));
    if vis.addresses {
        fields.push(("ImageBase", format!("0x{:X}", image.layout().image_base)));
        fields.push(("HeaderRVA", hex(h.rva)));
    }
    fields.push(("NumberOfSections", h.sections.len().to_string()));
    if image.is_composite {
        fields.push(("Composite", "true".to_string()));
    }
    if vis.environment {
        if let Some(id) = image.compiler_identifier() {
            fields.push(("CompilerIdentifier", id.to_string()));
        }
    }
    fields
}

pub(crate) fn section_fields(section: &Section, vis: Visibility) -> Vec<Field> {
    let mut fields = vec![
        ("Type", format!("{} ({})", section.kind, section.kind.value())),
        ("Size", format!("{} bytes", section.size)),
    ];
    if vis.addresses {
        fields.insert(1, ("RelativeVirtualAddress", hex(section.rva)));
    }
    fields
}

pub(crate) fn method_fields(method: &Method, options: &DumpOptions) -> Vec<Field> {
    let mut fields = vec![("Signature", signature_text(method, options))];
    if options.signature_binary {
        fields.push(("SignatureBytes", hex_dashed(&method.signature_bytes)));
    }
    fields.extend([
        ("ReturnType", method.return_type.clone()),
        ("Handle", hex(method.token)),
        ("Rid", method.rid.to_string()),
    ]);
    if method.entry_point == EntryPointKind::Instance {
        fields.push(("EntryPoint", "Instance".to_string()));
    }
    if let Some(id) = method.entry_point_id() {
        fields.push(("EntryPointRuntimeFunctionId", id.to_string()));
    }
    fields.push(("NumberOfRuntimeFunctions", method.runtime_functions.len().to_string()));
    fields.push(("NumberOfFixups", method.fixups.len().to_string()));
    fields
}

pub(crate) fn fixup_records(method: &Method) -> Vec<Record> {
    method
        .fixups
        .iter()
        .map(|cell| {
            Record::new(
                "Fixup",
                vec![
                    ("ImportSection", cell.import_section.to_string()),
                    ("Slot", cell.slot.to_string()),
                ],
            )
        })
        .collect()
}

pub(crate) fn runtime_function_fields(rtf: &RuntimeFunction, vis: Visibility) -> Vec<Field> {
    let mut fields = vec![("Id", rtf.id.to_string())];
    if vis.addresses {
        fields.push(("StartAddress", hex(rtf.start_rva)));
        fields.push(("EndAddress", hex(rtf.end_rva())));
    }
    fields.push(("Size", format!("{} bytes", rtf.size)));
    if vis.addresses {
        fields.push(("UnwindRVA", hex(rtf.unwind_rva)));
    }
    fields
}

pub(crate) fn unwind_records(rtf: &RuntimeFunction, vis: Visibility) -> Vec<Record> {
    match &rtf.unwind {
        UnwindInfo::Amd64(info) => {
            let mut fields = vec![
                ("Version", info.version.to_string()),
                ("Flags", info.flag_names().join(" | ")),
                ("SizeOfProlog", info.prolog_size.to_string()),
                ("CountOfUnwindCodes", info.code_count.to_string()),
                (
                    "FrameRegister",
                    info.frame_register_name().unwrap_or("None").to_string(),
                ),
                ("FrameOffset", info.frame_offset.to_string()),
            ];
            if vis.addresses {
                fields.push(("PersonalityRoutineRVA", hex(info.personality_rva)));
            }
            fields.push(("Size", format!("{} bytes", info.size)));

            let mut records = vec![Record::new("UnwindInfo", fields)];
            records.extend(
                info.codes
                    .iter()
                    .map(|code| Record::new("UnwindCode", vec![("Code", code.to_string())])),
            );
            records
        }
        UnwindInfo::Arm64(info) => vec![Record::new(
            "UnwindInfo",
            vec![
                ("FunctionLength", info.function_length.to_string()),
                ("Version", info.version.to_string()),
                ("XBit", info.x_bit.to_string()),
                ("EBit", info.e_bit.to_string()),
                ("EpilogCount", info.epilog_count.to_string()),
                ("CodeWords", info.code_words.to_string()),
                ("Size", format!("{} bytes", info.size)),
            ],
        )],
        UnwindInfo::Undecoded => Vec::new(),
    }
}

pub(crate) fn eh_records(rtf: &RuntimeFunction) -> Vec<Record> {
    rtf.eh_clauses
        .iter()
        .map(|clause| Record::new("EHClause", vec![("Clause", clause.to_string())]))
        .collect()
}

/// Records describing the decoded contents of `section`.
pub(crate) fn section_content_records(
    image: &R2rImage,
    section: &Section,
    vis: Visibility,
) -> Vec<Record> {
    let signature_of = |token: u32| {
        image
            .methods
            .iter()
            .find(|m| m.token == token)
            .map(|m| m.signature.clone())
            .unwrap_or_default()
    };

    match &section.contents {
        SectionContents::CompilerIdentifier(id) if vis.environment => {
            vec![Record::new("CompilerIdentifier", vec![("Value", id.clone())])]
        }
        SectionContents::CompilerIdentifier(_) | SectionContents::Opaque => Vec::new(),
        SectionContents::ImportSections(sections) => {
            let mut records = Vec::new();
            for s in sections {
                let mut fields = vec![("Index", s.index.to_string())];
                if vis.addresses {
                    fields.push(("SectionRVA", hex(s.rva)));
                }
                let flags = format!("0x{:04X} {}", s.flags, s.flag_names().join(" | "));
                fields.extend([
                    ("Size", format!("{} bytes", s.size)),
                    ("Flags", flags.trim_end().to_string()),
                    ("Type", format!("{} ({})", s.kind_name(), s.kind)),
                    ("EntrySize", s.entry_size.to_string()),
                    ("Entries", s.entries.len().to_string()),
                ]);
                if vis.addresses {
                    fields.push(("SignatureRVA", hex(s.signature_rva)));
                    fields.push(("AuxiliaryDataRVA", hex(s.aux_data_rva)));
                }
                records.push(Record::new("ImportSection", fields));

                for e in &s.entries {
                    let mut fields = vec![("Index", e.index.to_string())];
                    if vis.addresses {
                        fields.push(("RVA", hex(e.rva)));
                        fields.push(("Value", format!("0x{:016X}", e.value)));
                        fields.push(("SignatureRVA", hex(e.signature_rva)));
                    }
                    if let Some(kind) = e.fixup_kind {
                        fields.push(("FixupKind", format!("0x{kind:02X}")));
                    }
                    records.push(Record::new("ImportEntry", fields));
                }
            }
            records
        }
        SectionContents::RuntimeFunctions { .. } => {
            let mut functions: Vec<(&RuntimeFunction, &Method)> = image
                .methods
                .iter()
                .flat_map(|m| m.runtime_functions.iter().map(move |rtf| (rtf, m)))
                .collect();
            functions.sort_by_key(|(rtf, _)| rtf.id);
            functions
                .into_iter()
                .map(|(rtf, method)| {
                    let mut fields = runtime_function_fields(rtf, vis);
                    fields.push(("Method", method.signature.clone()));
                    Record::new("RuntimeFunction", fields)
                })
                .collect()
        }
        SectionContents::MethodEntryPoints(entries) => entries
            .iter()
            .map(|ep| {
                let mut fields = vec![
                    ("Rid", ep.rid.to_string()),
                    ("RuntimeFunction", ep.runtime_function.to_string()),
                    ("HasFixups", ep.fixup_offset.is_some().to_string()),
                ];
                fields.push(("Method", signature_of(0x0600_0000 | ep.rid)));
                Record::new("EntryPoint", fields)
            })
            .collect(),
        SectionContents::InstanceEntryPoints { .. } => image
            .methods
            .iter()
            .filter(|m| m.entry_point == EntryPointKind::Instance)
            .map(|m| {
                Record::new(
                    "InstanceEntryPoint",
                    vec![
                        ("Method", m.signature.clone()),
                        (
                            "RuntimeFunction",
                            m.entry_point_id().map(|id| id.to_string()).unwrap_or_default(),
                        ),
                    ],
                )
            })
            .collect(),
        SectionContents::ExceptionInfo(lookups) => lookups
            .iter()
            .map(|l| {
                let mut fields = Vec::new();
                if vis.addresses {
                    fields.push(("MethodStartRVA", hex(l.method_start_rva)));
                    fields.push(("EHInfoRVA", hex(l.eh_info_rva)));
                }
                fields.push(("Clauses", l.clause_count.to_string()));
                Record::new("ExceptionInfo", fields)
            })
            .collect(),
        SectionContents::AvailableTypes(types) => types
            .iter()
            .map(|t| {
                let name = if t.exported {
                    format!("ExportedType {}", t.rid)
                } else {
                    image
                        .metadata()
                        .and_then(|md| md.type_def_name(t.rid).ok())
                        .unwrap_or_else(|| format!("0x{:08X}", 0x0200_0000 | t.rid))
                };
                Record::new(
                    "AvailableType",
                    vec![("Rid", t.rid.to_string()), ("Name", name)],
                )
            })
            .collect(),
    }
}
