//! Error types for manifest parsing and code generation.

use thiserror::Error;

/// Errors found while reading a symbol manifest.
///
/// Every variant is fatal: a manifest that fails to parse aborts code
/// generation, and with it the build of the crate that embeds the module.
#[derive(Error, Debug)]
pub enum ManifestError {
    /// Two declarations share a name.
    #[error("line {line}: duplicate declaration of '{name}' (first declared on line {first_line})")]
    Duplicate {
        name: String,
        line: usize,
        first_line: usize,
    },

    /// A declaration or directive could not be understood.
    #[error("line {line}: {message}")]
    Malformed { line: usize, message: String },

    /// A type that has no FFI mapping.
    #[error("line {line}: unsupported type '{ty}'")]
    UnsupportedType { line: usize, ty: String },

    /// A size constant with an unknown unit suffix.
    #[error("line {line}: unknown size unit '{unit}'")]
    UnknownUnit { line: usize, unit: String },

    /// A size constant that does not fit in 64 bits once expanded.
    #[error("line {line}: constant '{name}' overflows 64 bits")]
    ConstantOverflow { line: usize, name: String },

    /// A comment or body that never ends.
    #[error("line {line}: unterminated {what}")]
    Unterminated { line: usize, what: &'static str },

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ManifestError {
    pub(crate) fn malformed(line: usize, message: impl Into<String>) -> Self {
        ManifestError::Malformed {
            line,
            message: message.into(),
        }
    }
}

/// Result type for manifest operations.
pub type ManifestResult<T> = std::result::Result<T, ManifestError>;
