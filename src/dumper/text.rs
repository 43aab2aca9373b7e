//! Plain text renderer.

use std::io::Write;

use super::{
    eh_records, fixup_records, header_fields, method_fields, normalized_methods,
    normalized_sections, runtime_function_fields, section_content_records, section_fields,
    signature_text, unwind_records, Dumper, Field, Record, Visibility,
};
use crate::disasm::Disassembler;
use crate::error::Result;
use crate::options::DumpOptions;
use crate::r2r::header::Section;
use crate::r2r::method::{Method, RuntimeFunction};
use crate::r2r::R2rImage;

const DIVIDER_WIDTH: usize = 61;

/// Writes human readable text straight to the output stream.
pub struct TextDumper<'a> {
    image: &'a R2rImage,
    options: &'a DumpOptions,
    disassembler: Option<&'a Disassembler>,
    out: &'a mut dyn Write,
    vis: Visibility,
}

impl<'a> TextDumper<'a> {
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
            vis: Visibility::new(options),
        }
    }

    fn write_fields(&mut self, fields: &[Field]) -> Result<()> {
        for (name, value) in fields {
            writeln!(self.out, "{name}: {value}")?;
        }
        Ok(())
    }

    fn write_records(&mut self, records: &[Record]) -> Result<()> {
        for record in records {
            match record.fields.as_slice() {
                [(_, value)] => writeln!(self.out, "  {}: {}", record.name, value)?,
                fields => {
                    let joined = fields
                        .iter()
                        .map(|(k, v)| format!("{k}: {v}"))
                        .collect::<Vec<_>>()
                        .join(", ");
                    writeln!(self.out, "  {}: {}", record.name, joined)?;
                }
            }
        }
        Ok(())
    }
}

impl Dumper for TextDumper<'_> {
    fn begin(&mut self) -> Result<()> {
        if !self.options.normalize {
            if self.vis.environment {
                writeln!(self.out, "Filename: {}", self.image.path().display())?;
            }
            writeln!(self.out, "Machine: {}", self.image.header.machine)?;
            if self.vis.addresses {
                writeln!(self.out, "ImageBase: 0x{:08X}", self.image.layout().image_base)?;
            }
            self.skip_line()?;
        }
        Ok(())
    }

    fn end(&mut self) -> Result<()> {
        writeln!(self.out, "=============================================================")?;
        self.skip_line()?;
        self.out.flush()?;
        Ok(())
    }

    fn write_divider(&mut self, title: &str) -> Result<()> {
        let len = DIVIDER_WIDTH.saturating_sub(title.len() + 2);
        writeln!(
            self.out,
            "{} {} {}",
            "=".repeat(len / 2),
            title,
            "=".repeat(len - len / 2)
        )?;
        self.skip_line()
    }

    fn write_sub_divider(&mut self) -> Result<()> {
        writeln!(self.out, "_______________________________________________")?;
        self.skip_line()
    }

    fn skip_line(&mut self) -> Result<()> {
        writeln!(self.out)?;
        Ok(())
    }

    fn dump_header(&mut self, dump_sections: bool) -> Result<()> {
        let fields = header_fields(self.image, self.vis);
        self.write_fields(&fields)?;
        if self.options.raw {
            let h = &self.image.header;
            self.dump_bytes(h.rva, h.size(), "Raw")?;
        }
        self.skip_line()?;

        if dump_sections {
            self.write_divider("R2R Sections")?;
            for section in normalized_sections(self.image, self.options) {
                self.dump_section(section)?;
            }
        }
        Ok(())
    }

    fn dump_section(&mut self, section: &Section) -> Result<()> {
        self.write_sub_divider()?;
        self.write_fields(&section_fields(section, self.vis))?;
        if self.options.raw && section.size != 0 {
            self.dump_bytes(section.rva, section.size as usize, "Raw")?;
        }
        self.skip_line()?;
        if self.options.section_contents {
            self.dump_section_contents(section)?;
            self.skip_line()?;
        }
        Ok(())
    }

    fn dump_entry_points(&mut self) -> Result<()> {
        self.write_divider("R2R Entry Points")?;
        for method in normalized_methods(self.image, self.options) {
            writeln!(self.out, "{}", signature_text(method, self.options))?;
        }
        self.skip_line()
    }

    fn dump_all_methods(&mut self) -> Result<()> {
        self.write_divider("R2R Methods")?;
        writeln!(self.out, "{} methods", self.image.methods.len())?;
        self.skip_line()?;
        for method in normalized_methods(self.image, self.options) {
            self.dump_method(method)?;
        }
        Ok(())
    }

    fn dump_method(&mut self, method: &Method) -> Result<()> {
        self.write_sub_divider()?;
        self.write_fields(&method_fields(method, self.options))?;
        self.write_records(&fixup_records(method))?;
        self.skip_line()?;
        for rtf in &method.runtime_functions {
            self.dump_runtime_function(rtf)?;
        }
        Ok(())
    }

    fn dump_runtime_function(&mut self, rtf: &RuntimeFunction) -> Result<()> {
        self.write_fields(&runtime_function_fields(rtf, self.vis))?;

        if self.options.unwind {
            self.write_records(&unwind_records(rtf, self.vis))?;
            if let (true, Some(size)) = (self.options.raw, rtf.unwind.size()) {
                self.dump_bytes(rtf.unwind_rva, size, "UnwindInfo")?;
            }
        }

        if self.options.gc {
            if let Some(gc) = rtf.gc_info {
                writeln!(self.out, "GcInfo: {} bytes", gc.len)?;
                self.dump_bytes(gc.rva, gc.len, "GcInfo")?;
            }
        }

        self.write_records(&eh_records(rtf))?;

        if self.options.disasm {
            self.dump_disasm(rtf)?;
        }
        if self.options.raw {
            self.dump_bytes(rtf.start_rva, rtf.size as usize, "Raw")?;
        }
        self.skip_line()
    }

    fn dump_disasm(&mut self, rtf: &RuntimeFunction) -> Result<()> {
        let Some(disassembler) = self.disassembler else {
            return Ok(());
        };
        let code = self.image.bytes(rtf.start_rva, rtf.size as usize)?;
        let base = if self.vis.addresses { u64::from(rtf.start_rva) } else { 0 };
        for instr in disassembler.disassemble(code, base) {
            if self.vis.addresses {
                writeln!(self.out, "  {:08X}: {}", instr.address, instr.text)?;
            } else {
                writeln!(self.out, "  {:04X}: {}", instr.address, instr.text)?;
            }
        }
        Ok(())
    }

    fn dump_bytes(&mut self, rva: u32, size: usize, name: &str) -> Result<()> {
        let bytes = self.image.bytes(rva, size)?;
        writeln!(self.out, "{name}:")?;
        for (i, chunk) in bytes.chunks(16).enumerate() {
            let at = if self.vis.addresses {
                u64::from(rva) + (i * 16) as u64
            } else {
                (i * 16) as u64
            };
            let hex = chunk
                .iter()
                .map(|b| format!("{b:02X}"))
                .collect::<Vec<_>>()
                .join(" ");
            writeln!(self.out, "    {at:08X}: {hex}")?;
        }
        Ok(())
    }

    fn dump_section_contents(&mut self, section: &Section) -> Result<()> {
        let records = section_content_records(self.image, section, self.vis);
        self.write_records(&records)
    }

    fn dump_query_count(&mut self, query: &str, title: &str, count: usize) -> Result<()> {
        writeln!(self.out, "{count} matches for {title} \"{query}\"")?;
        self.skip_line()
    }
}
