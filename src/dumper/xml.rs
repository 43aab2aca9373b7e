//! XML renderer.
//!
//! The document is built in memory and written out by `end`, so an error
//! part way through never leaves half a document in the output.

use std::io::Write;

use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;

use super::{
    eh_records, fixup_records, header_fields, hex_dashed, method_fields, normalized_methods,
    normalized_sections, runtime_function_fields, section_content_records, section_fields,
    signature_text, unwind_records, Dumper, Field, Record, Visibility,
};
use crate::disasm::Disassembler;
use crate::error::Result;
use crate::options::DumpOptions;
use crate::r2r::header::Section;
use crate::r2r::method::{Method, RuntimeFunction};
use crate::r2r::R2rImage;

const ROOT: &str = "R2RDump";

/// Writes one XML document per image.
pub struct XmlDumper<'a> {
    image: &'a R2rImage,
    options: &'a DumpOptions,
    disassembler: Option<&'a Disassembler>,
    out: &'a mut dyn Write,
    writer: Writer<Vec<u8>>,
    vis: Visibility,
}

fn new_writer() -> Writer<Vec<u8>> {
    Writer::new_with_indent(Vec::new(), b' ', 2)
}

impl<'a> XmlDumper<'a> {
    pub fn new(
        image: &'a R2rImage,
        options: &'a DumpOptions,
        disassembler: Option<&'a Disassembler>,
        out: &'a mut dyn Write,
    ) -> Self {
        Self {
            image,
            options,
            disassembler,
            out,
            writer: new_writer(),
            vis: Visibility::new(options),
        }
    }

    fn start(&mut self, name: &str, attrs: &[(&str, &str)]) -> Result<()> {
        let elem = BytesStart::new(name).with_attributes(attrs.iter().copied());
        self.writer.write_event(Event::Start(elem))?;
        Ok(())
    }

    fn finish(&mut self, name: &str) -> Result<()> {
        self.writer.write_event(Event::End(BytesEnd::new(name)))?;
        Ok(())
    }

    fn element(&mut self, name: &str, text: &str) -> Result<()> {
        self.start(name, &[])?;
        self.writer.write_event(Event::Text(BytesText::new(text)))?;
        self.finish(name)
    }

    fn write_fields(&mut self, fields: &[Field]) -> Result<()> {
        for (name, value) in fields {
            self.element(name, value)?;
        }
        Ok(())
    }

    fn write_records(&mut self, records: &[Record]) -> Result<()> {
        for record in records {
            let elem = BytesStart::new(record.name)
                .with_attributes(record.fields.iter().map(|(k, v)| (*k, v.as_str())));
            self.writer.write_event(Event::Empty(elem))?;
        }
        Ok(())
    }
}

impl Dumper for XmlDumper<'_> {
    fn begin(&mut self) -> Result<()> {
        self.writer = new_writer();
        self.writer
            .write_event(Event::Decl(BytesDecl::new("1.0", Some("utf-8"), None)))?;
        let path = self.image.path().display().to_string();
        if self.vis.environment {
            self.start(ROOT, &[("Filename", path.as_str())])
        } else {
            self.start(ROOT, &[])
        }
    }

    fn end(&mut self) -> Result<()> {
        self.finish(ROOT)?;
        let document = std::mem::replace(&mut self.writer, new_writer()).into_inner();
        self.out.write_all(&document)?;
        self.out.write_all(b"\n")?;
        self.out.flush()?;
        Ok(())
    }

    fn write_divider(&mut self, _title: &str) -> Result<()> {
        Ok(())
    }

    fn write_sub_divider(&mut self) -> Result<()> {
        Ok(())
    }

    fn skip_line(&mut self) -> Result<()> {
        Ok(())
    }

    fn dump_header(&mut self, dump_sections: bool) -> Result<()> {
        self.start("Header", &[])?;
        let fields = header_fields(self.image, self.vis);
        self.write_fields(&fields)?;
        if self.options.raw {
            let h = &self.image.header;
            self.dump_bytes(h.rva, h.size(), "Raw")?;
        }
        if dump_sections {
            self.start("Sections", &[])?;
            for section in normalized_sections(self.image, self.options) {
                self.dump_section(section)?;
            }
            self.finish("Sections")?;
        }
        self.finish("Header")
    }

    fn dump_section(&mut self, section: &Section) -> Result<()> {
        let index = section.kind.value().to_string();
        self.start("Section", &[("Index", index.as_str())])?;
        self.write_fields(&section_fields(section, self.vis))?;
        if self.options.raw && section.size != 0 {
            self.dump_bytes(section.rva, section.size as usize, "Raw")?;
        }
        if self.options.section_contents {
            self.dump_section_contents(section)?;
        }
        self.finish("Section")
    }

    fn dump_entry_points(&mut self) -> Result<()> {
        self.start("EntryPoints", &[])?;
        for method in normalized_methods(self.image, self.options) {
            self.element("MethodEntryPoint", &signature_text(method, self.options))?;
        }
        self.finish("EntryPoints")
    }

    fn dump_all_methods(&mut self) -> Result<()> {
        let count = self.image.methods.len().to_string();
        self.start("Methods", &[("Count", count.as_str())])?;
        for method in normalized_methods(self.image, self.options) {
            self.dump_method(method)?;
        }
        self.finish("Methods")
    }

    fn dump_method(&mut self, method: &Method) -> Result<()> {
        let rid = method.rid.to_string();
        self.start("Method", &[("Index", rid.as_str())])?;
        self.write_fields(&method_fields(method, self.options))?;

        let fixups = fixup_records(method);
        if !fixups.is_empty() {
            self.start("Fixups", &[])?;
            self.write_records(&fixups)?;
            self.finish("Fixups")?;
        }

        self.start("RuntimeFunctions", &[])?;
        for rtf in &method.runtime_functions {
            self.dump_runtime_function(rtf)?;
        }
        self.finish("RuntimeFunctions")?;
        self.finish("Method")
    }

    fn dump_runtime_function(&mut self, rtf: &RuntimeFunction) -> Result<()> {
        let id = rtf.id.to_string();
        self.start("RuntimeFunction", &[("Index", id.as_str())])?;
        self.write_fields(&runtime_function_fields(rtf, self.vis))?;

        if self.options.unwind {
            self.write_records(&unwind_records(rtf, self.vis))?;
            if let (true, Some(size)) = (self.options.raw, rtf.unwind.size()) {
                self.dump_bytes(rtf.unwind_rva, size, "UnwindInfoBytes")?;
            }
        }

        if self.options.gc {
            if let Some(gc) = rtf.gc_info {
                self.dump_bytes(gc.rva, gc.len, "GcInfo")?;
            }
        }

        let clauses = eh_records(rtf);
        if !clauses.is_empty() {
            self.start("EHInfo", &[])?;
            self.write_records(&clauses)?;
            self.finish("EHInfo")?;
        }

        if self.options.disasm {
            self.dump_disasm(rtf)?;
        }
        if self.options.raw {
            self.dump_bytes(rtf.start_rva, rtf.size as usize, "Raw")?;
        }
        self.finish("RuntimeFunction")
    }

    fn dump_disasm(&mut self, rtf: &RuntimeFunction) -> Result<()> {
        let Some(disassembler) = self.disassembler else {
            return Ok(());
        };
        let code = self.image.bytes(rtf.start_rva, rtf.size as usize)?;
        let base = if self.vis.addresses { u64::from(rtf.start_rva) } else { 0 };

        self.start("Disassembly", &[])?;
        for instr in disassembler.disassemble(code, base) {
            let address = format!("0x{:X}", instr.address);
            self.start("Instruction", &[("Address", address.as_str())])?;
            self.writer
                .write_event(Event::Text(BytesText::new(&instr.text)))?;
            self.finish("Instruction")?;
        }
        self.finish("Disassembly")
    }

    fn dump_bytes(&mut self, rva: u32, size: usize, name: &str) -> Result<()> {
        let bytes = hex_dashed(self.image.bytes(rva, size)?);
        if self.vis.addresses {
            let rva = format!("0x{rva:08X}");
            self.start(name, &[("RVA", rva.as_str())])?;
        } else {
            self.start(name, &[])?;
        }
        self.writer.write_event(Event::Text(BytesText::new(&bytes)))?;
        self.finish(name)
    }

    fn dump_section_contents(&mut self, section: &Section) -> Result<()> {
        let records = section_content_records(self.image, section, self.vis);
        self.start("Contents", &[])?;
        self.write_records(&records)?;
        self.finish("Contents")
    }

    fn dump_query_count(&mut self, query: &str, title: &str, count: usize) -> Result<()> {
        let count = count.to_string();
        let elem = BytesStart::new("QueryCount").with_attributes([
            ("Query", query),
            ("Title", title),
            ("Count", count.as_str()),
        ]);
        self.writer.write_event(Event::Empty(elem))?;
        Ok(())
    }
}

/// Writes a standalone `<Error>` document.
pub fn write_xml_error(out: &mut dyn Write, message: &str) -> Result<()> {
    let mut writer = new_writer();
    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("utf-8"), None)))?;
    writer.write_event(Event::Start(BytesStart::new("Error")))?;
    writer.write_event(Event::Text(BytesText::new(message)))?;
    writer.write_event(Event::End(BytesEnd::new("Error")))?;
    out.write_all(&writer.into_inner())?;
    out.write_all(b"\n")?;
    out.flush()?;
    Ok(())
}
