//! Error types for key parsing and validation.

use thiserror::Error;

/// Errors that can occur when parsing or validating resource identities.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    /// The key string is empty.
    #[error("key cannot be empty")]
    Empty,

    /// The key is missing the `/` separator between namespace and name.
    #[error("key missing '/' separator")]
    MissingSeparator,

    /// A namespace or name segment is malformed.
    #[error("invalid {segment} '{value}': {reason}")]
    InvalidSegment {
        segment: &'static str,
        value: String,
        reason: &'static str,
    },

    /// The resource kind is not one this controller manages.
    #[error("unknown resource kind: {0}")]
    UnknownKind(String),

    /// A reference of one kind was converted into a key of another.
    #[error("kind mismatch: expected {expected}, got {actual}")]
    KindMismatch {
        expected: &'static str,
        actual: &'static str,
    },

    /// The UID is not a valid UUID.
    #[error("invalid uid: {0}")]
    InvalidUid(String),
}

impl IdError {
    /// Returns true if this error indicates the input was empty.
    pub fn is_empty(&self) -> bool {
        matches!(self, IdError::Empty)
    }

    /// Returns true if this error came from a malformed segment.
    pub fn is_segment_error(&self) -> bool {
        matches!(self, IdError::InvalidSegment { .. })
    }
}
