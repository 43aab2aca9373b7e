//! Top level processing of one invocation.

use std::fs::File;
use std::io::{BufWriter, Write};

use tracing::{debug, warn};

use crate::diff::diff_images;
use crate::disasm::Disassembler;
use crate::dumper::{create_dumper, dump_image, write_xml_error};
use crate::error::Result;
use crate::options::DumpOptions;
use crate::r2r::R2rImage;

/// Dumps or diffs every input, writing to `options.output` or `stdout`.
///
/// Options are validated before the output file is created. When XML
/// output is selected, a failure is also reported as an `<Error>` element:
/// validation failures go to `stdout` even when `options.output` is set,
/// since no output file exists yet, and later failures go to the selected
/// output.
pub fn run(options: &DumpOptions, stdout: &mut dyn Write) -> Result<()> {
    if let Err(e) = options.validate() {
        if options.xml {
            report_xml_error(stdout, &e.to_string());
        }
        return Err(e);
    }

    let mut file;
    let out: &mut dyn Write = match &options.output {
        Some(path) => {
            file = BufWriter::new(File::create(path)?);
            &mut file
        }
        None => stdout,
    };

    let result = process(options, out);
    if let Err(e) = &result {
        if options.xml {
            report_xml_error(out, &e.to_string());
        }
    }
    out.flush()?;
    result
}

fn process(options: &DumpOptions, out: &mut dyn Write) -> Result<()> {
    let mut previous: Option<R2rImage> = None;

    for input in &options.inputs {
        let image = R2rImage::open(input, options)?;
        debug!(path = %input.display(), methods = image.methods.len(), "parsed image");

        let disassembler = if options.disasm {
            Some(Disassembler::new(image.header.machine)?)
        } else {
            None
        };

        if !options.diff {
            let mut dumper = create_dumper(&image, options, disassembler.as_ref(), &mut *out);
            dump_image(dumper.as_mut(), &image, options)?;
        } else if let Some(prev) = &previous {
            diff_images(prev, &image).write(&mut *out)?;
        }

        previous = Some(image);
    }
    Ok(())
}

fn report_xml_error(out: &mut dyn Write, message: &str) {
    if let Err(e) = write_xml_error(out, message) {
        warn!(error = %e, "failed to write XML error element");
    }
}
