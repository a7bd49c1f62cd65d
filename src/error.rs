//! Error types for the codec core.

use core::fmt;

/// The result type used throughout this crate.
pub type Result<T> = core::result::Result<T, J2kError>;

/// Errors that can occur while encoding or decoding a JPEG 2000 codestream.
///
/// Every variant that can be traced to a specific point in the byte stream
/// carries the offset at which the problem was detected, and where relevant
/// the name of the marker or segment involved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum J2kError {
    /// A caller-supplied encoder/decoder parameter violates a Part 1
    /// constraint (e.g. a code-block dimension that is not a power of two).
    InvalidParameter { message: &'static str },
    /// The byte source ended before a required marker or segment was fully
    /// read.
    TruncatedCodestream { offset: usize, expected: &'static str },
    /// A mandatory marker is absent from a required position.
    MissingMarker { name: &'static str, offset: usize },
    /// A marker's length field is inconsistent with its content, or a field
    /// value is out of the range Part 1 allows.
    MalformedMarker { name: &'static str, offset: usize, reason: &'static str },
    /// The codestream signals a feature this implementation does not
    /// support (an extension, an unrecognised transformation, etc).
    UnsupportedFeature { feature: &'static str, offset: usize },
    /// Entropy-coded or packet data violates an invariant of the format
    /// (forbidden byte pair, tag-tree underflow, over-long pass length).
    CorruptCodestream { offset: usize, reason: &'static str },
    /// The caller requested cancellation at a checkpoint.
    Cancelled,
}

impl fmt::Display for J2kError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            J2kError::InvalidParameter { message } => {
                write!(f, "invalid parameter: {message}")
            }
            J2kError::TruncatedCodestream { offset, expected } => {
                write!(f, "truncated codestream at offset {offset}: expected {expected}")
            }
            J2kError::MissingMarker { name, offset } => {
                write!(f, "missing {name} marker at offset {offset}")
            }
            J2kError::MalformedMarker { name, offset, reason } => {
                write!(f, "malformed {name} marker at offset {offset}: {reason}")
            }
            J2kError::UnsupportedFeature { feature, offset } => {
                write!(f, "unsupported feature '{feature}' at offset {offset}")
            }
            J2kError::CorruptCodestream { offset, reason } => {
                write!(f, "corrupt codestream at offset {offset}: {reason}")
            }
            J2kError::Cancelled => write!(f, "operation was cancelled"),
        }
    }
}

impl std::error::Error for J2kError {}

impl J2kError {
    pub(crate) fn truncated(offset: usize, expected: &'static str) -> Self {
        J2kError::TruncatedCodestream { offset, expected }
    }

    pub(crate) fn missing_marker(name: &'static str, offset: usize) -> Self {
        J2kError::MissingMarker { name, offset }
    }

    pub(crate) fn malformed(name: &'static str, offset: usize, reason: &'static str) -> Self {
        J2kError::MalformedMarker { name, offset, reason }
    }

    pub(crate) fn corrupt(offset: usize, reason: &'static str) -> Self {
        J2kError::CorruptCodestream { offset, reason }
    }
}
