//! Error Handling Module
//!
//! This module defines the error taxonomy for dmarcscan using the `thiserror` crate.
//! Only [`DmarcError::Connection`] is fatal to a run; everything else is caught at
//! the narrowest scope (attachment, report or record) and turned into a skip.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DmarcError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Corrupt archive: {0}")]
    CorruptArchive(String),

    #[error("File too large: {0}")]
    FileTooLarge(String),

    #[error("Invalid format: {0}")]
    Format(String),

    #[error("Report rejected: {0}")]
    Parse(#[from] ParseError),

    #[error("Malformed message: {0}")]
    Message(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

/// Report-level failures. The whole report is skipped.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("malformed XML: {0}")]
    Malformed(String),

    #[error("missing required field `{0}`")]
    MissingRequiredField(&'static str),

    #[error("invalid date range: {0}")]
    InvalidDateRange(String),
}

/// Record-level failures. Only the offending `<record>` is skipped.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecordError {
    #[error("record is missing `{0}`")]
    MissingField(&'static str),

    #[error("record has invalid `{field}`: {value:?}")]
    InvalidValue { field: &'static str, value: String },
}

impl From<quick_xml::Error> for ParseError {
    fn from(e: quick_xml::Error) -> Self {
        ParseError::Malformed(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, DmarcError>;
