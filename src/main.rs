use std::io;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::error::ErrorKind;
use clap::Parser;
use r2rdump::logging::init_tracing;
use r2rdump::options::parse_number;
use r2rdump::DumpOptions;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Input R2R images
    #[arg(short = 'i', long = "in", num_args = 1..)]
    inputs: Vec<PathBuf>,

    /// Output file path; stdout when omitted
    #[arg(short, long = "out")]
    output: Option<PathBuf>,

    /// Output in XML format
    #[arg(short, long)]
    xml: bool,

    /// Dump the raw bytes of each section or runtime function
    #[arg(long)]
    raw: bool,

    /// Don't include addresses
    #[arg(long)]
    naked: bool,

    /// Dump R2R header and sections only
    #[arg(long)]
    header: bool,

    /// Show disassembly of methods or runtime functions
    #[arg(short, long)]
    disasm: bool,

    /// Dump unwindInfo
    #[arg(long)]
    unwind: bool,

    /// Dump gcInfo and slot table
    #[arg(long)]
    gc: bool,

    /// Dump section contents
    #[arg(long = "sc")]
    section_contents: bool,

    /// Dump R2R method entry points only
    #[arg(short, long)]
    entrypoints: bool,

    /// Normalize dump by sorting the various tables and methods
    #[arg(short, long)]
    normalize: bool,

    /// Query method by exact name, signature, row id or token
    #[arg(short, long = "query", num_args = 1..)]
    queries: Vec<String>,

    /// Search method by keyword
    #[arg(short, long = "keyword", num_args = 1..)]
    keywords: Vec<String>,

    /// Get one runtime function by id or relative virtual address
    #[arg(
        short = 'f',
        long = "runtimefunction",
        num_args = 1..,
        value_parser = parse_runtime_function
    )]
    runtime_functions: Vec<u32>,

    /// Get section by keyword
    #[arg(short, long = "section", num_args = 1..)]
    sections: Vec<String>,

    /// Dump disassembly, unwindInfo, gcInfo, section contents and entry points
    #[arg(short, long)]
    verbose: bool,

    /// Compare two R2R images
    #[arg(long)]
    diff: bool,

    /// Don't include fields that could vary between machines (XML only)
    #[arg(long)]
    ignore_sensitive: bool,

    /// Explicit reference assembly files
    #[arg(short, long = "reference", num_args = 1..)]
    references: Vec<PathBuf>,

    /// Directories to search for reference assemblies
    #[arg(long = "reference-path", num_args = 1..)]
    reference_paths: Vec<PathBuf>,

    /// Append the signature blob after each method signature
    #[arg(long)]
    signature_binary: bool,

    /// Embed the signature blob in the signature text
    #[arg(long)]
    inline_signature_binary: bool,
}

fn parse_runtime_function(s: &str) -> std::result::Result<u32, String> {
    parse_number(s).ok_or_else(|| format!("`{s}` is not a decimal or 0x-prefixed number"))
}

impl From<Args> for DumpOptions {
    fn from(args: Args) -> Self {
        let options = DumpOptions {
            inputs: args.inputs,
            output: args.output,
            xml: args.xml,
            raw: args.raw,
            naked: args.naked,
            header: args.header,
            disasm: args.disasm,
            unwind: args.unwind,
            gc: args.gc,
            section_contents: args.section_contents,
            entrypoints: args.entrypoints,
            normalize: args.normalize,
            queries: args.queries,
            keywords: args.keywords,
            runtime_functions: args.runtime_functions,
            sections: args.sections,
            diff: args.diff,
            ignore_sensitive: args.ignore_sensitive,
            references: args.references,
            reference_paths: args.reference_paths,
            signature_binary: args.signature_binary,
            inline_signature_binary: args.inline_signature_binary,
        };
        if args.verbose {
            options.verbose()
        } else {
            options
        }
    }
}

fn try_main(args: Args) -> Result<()> {
    let options = DumpOptions::from(args);
    let stdout = io::stdout();
    let mut stdout = stdout.lock();
    r2rdump::run(&options, &mut stdout)?;
    Ok(())
}

fn main() -> ExitCode {
    init_tracing();
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            let _ = e.print();
            return ExitCode::SUCCESS;
        }
        Err(e) => {
            let _ = e.print();
            return ExitCode::FAILURE;
        }
    };

    match try_main(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}
