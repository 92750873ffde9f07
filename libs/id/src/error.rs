//! Error types for name and ID parsing.

use thiserror::Error;

/// Errors that can occur when parsing or validating names and IDs.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    /// The value is empty.
    #[error("{kind} cannot be empty")]
    Empty { kind: &'static str },

    /// The value exceeds the maximum label length.
    #[error("{kind} '{value}' is longer than {max} characters")]
    TooLong {
        kind: &'static str,
        value: String,
        max: usize,
    },

    /// The value contains a character outside `[a-z0-9-]`.
    #[error("{kind} '{value}' contains invalid character '{ch}'")]
    InvalidCharacter {
        kind: &'static str,
        value: String,
        ch: char,
    },

    /// The value starts or ends with a hyphen.
    #[error("{kind} '{value}' must start and end with an alphanumeric character")]
    InvalidBoundary { kind: &'static str, value: String },

    /// A composite key is missing its separator.
    #[error("{kind} '{value}' is missing the '{separator}' separator")]
    MissingSeparator {
        kind: &'static str,
        value: String,
        separator: char,
    },

    /// The ULID suffix of an instance ID is invalid.
    #[error("invalid ULID: {0}")]
    InvalidUlid(String),
}

impl IdError {
    /// Returns true if this error indicates the input was empty.
    pub fn is_empty(&self) -> bool {
        matches!(self, IdError::Empty { .. })
    }

    /// Returns true if this error indicates a malformed composite key.
    pub fn is_separator_error(&self) -> bool {
        matches!(self, IdError::MissingSeparator { .. })
    }
}
