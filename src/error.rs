//! Error types for ReadyToRun image inspection.

use thiserror::Error;

/// Errors raised while loading, dumping or diffing ReadyToRun images.
///
/// Lookup misses (a query that matches nothing) are not errors; the
/// lookup functions return empty results instead.
#[derive(Debug, Error)]
pub enum R2rError {
    /// The container, R2R header or one of its tables is malformed.
    #[error("Invalid image format: {0}")]
    Format(String),

    /// Parse error with location information
    #[error("Malformed data at offset {offset:#x}: {message}")]
    Malformed { offset: usize, message: String },

    /// The file cannot be opened or read, or the output cannot be written.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// No decoder is available for the image's machine type.
    #[error("Unsupported architecture: {0}")]
    UnsupportedArchitecture(String),

    /// Invalid option set: missing inputs, too few diff inputs, conflicting flags.
    #[error("{0}")]
    Configuration(String),

    /// XML serialization errors
    #[error("XML error: {0}")]
    Xml(#[from] quick_xml::Error),
}

impl R2rError {
    pub(crate) fn format(message: impl Into<String>) -> Self {
        R2rError::Format(message.into())
    }

    pub(crate) fn malformed(offset: usize, message: impl Into<String>) -> Self {
        R2rError::Malformed {
            offset,
            message: message.into(),
        }
    }

    /// Returns true for errors caused by the image contents.
    pub fn is_format_error(&self) -> bool {
        matches!(self, R2rError::Format(_) | R2rError::Malformed { .. })
    }
}

impl From<object::read::Error> for R2rError {
    fn from(err: object::read::Error) -> Self {
        R2rError::Format(err.to_string())
    }
}

/// Result type alias for r2rdump operations
pub type Result<T> = std::result::Result<T, R2rError>;
