//! ReadyToRun image inspector.
//!
//! This library parses ReadyToRun (R2R) images, the precompiled native code
//! containers embedded in managed executables, and renders their header,
//! sections, methods and code as text or XML, or compares two images.

pub mod binary;
pub mod diff;
pub mod disasm;
pub mod driver;
pub mod dumper;
pub mod error;
pub mod logging;
pub mod metadata;
pub mod options;
pub mod r2r;

pub use diff::{diff_images, DiffReport};
pub use disasm::Disassembler;
pub use driver::run;
pub use dumper::{create_dumper, dump_image, Dumper};
pub use error::{R2rError, Result};
pub use options::DumpOptions;
pub use r2r::R2rImage;
