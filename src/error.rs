use std::io;

use thiserror::Error;

/// Errors surfaced while decoding a database file.
///
/// Every variant is recoverable at the call boundary; malformed input
/// never aborts the process.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// A file or page header failed one of its structural checks.
    #[error("malformed header: {schema}.{field} at offset {offset}: {detail}")]
    MalformedHeader {
        schema: &'static str,
        field: &'static str,
        offset: usize,
        detail: String,
    },

    /// A page's type byte is not one of the four recognized values.
    #[error("unknown page type {value} on page {page}")]
    UnknownPageType { page: u32, value: i64 },

    /// Fewer bytes were available than a field declares.
    #[error("truncated read at offset {offset}: need {needed} bytes, have {available}")]
    Truncated {
        offset: usize,
        needed: usize,
        available: usize,
    },

    /// An overflow chain ended before the declared payload size was
    /// assembled, or revisited a page within one chain.
    #[error("overflow chain broken at page {page}: expected {expected} bytes, assembled {actual}")]
    OverflowChainBroken {
        page: u32,
        expected: usize,
        actual: usize,
    },

    /// Name lookup against the catalog yielded no match.
    #[error("no such table: {name}")]
    TableNotFound { name: String },

    /// A packed or delegated decode failed internally.
    #[error("unpack failed at offset {offset}: {detail}")]
    UnpackFailed { offset: usize, detail: String },

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Schema(#[from] SchemaError),
}

/// Violations found while compiling a schema description.
///
/// These indicate a bad schema definition, not bad input data.
#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("schema {schema}: no decoder named {name} in the registry")]
    UnknownDecoder {
        schema: &'static str,
        name: &'static str,
    },

    #[error("schema {schema}: field {field} depends on {dep}, which is neither an earlier field nor ambient")]
    UnresolvedDependency {
        schema: &'static str,
        field: &'static str,
        dep: String,
    },

    #[error("schema {schema}: duplicate field name {field}")]
    DuplicateField {
        schema: &'static str,
        field: &'static str,
    },

    #[error("schema {schema}: declared size {expected} but fields cover {actual}")]
    SizeMismatch {
        schema: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("schema {schema}: field {field} uses a format not allowed inside a repetition")]
    InvalidRepetition {
        schema: &'static str,
        field: &'static str,
    },
}
