//! Error types for dataset access

use thiserror::Error;

/// Result type alias for dataset operations
pub type Result<T> = std::result::Result<T, DatasetError>;

/// Errors raised while addressing or parsing protocol datasets
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DatasetError {
    #[error("Invalid DICOM tag: {0}")]
    InvalidTag(String),

    #[error("Invalid HL7 field address: {0}")]
    InvalidHl7Address(String),

    #[error("HL7 message has no MSH segment")]
    MissingHeader,
}
