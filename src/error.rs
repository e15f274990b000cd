//! # Error Kinds
//!
//! All fallible operations return `eyre::Result` with contextual messages,
//! matching the storage layer's error discipline throughout the crate. The
//! conditions a caller is expected to react to programmatically are carried
//! as a typed [`DbError`] inside the report and can be recovered with
//! [`DbError::of`].
//!
//! `NotFound` and `AlreadyExists` are expected signals of the table API,
//! not engine failures. Structural file errors (`BadSignature`,
//! `BadMasterPage`) are fatal on open. I/O failures are wrapped
//! `std::io::Error` values inside the report; a failed write transaction
//! discards its dirty state and the database stays at the previously
//! committed version.

use crate::records::Record;
use thiserror::Error;

/// Typed error kinds surfaced by the engine.
#[derive(Debug, Error)]
pub enum DbError {
    /// The file does not start with the engine signature.
    #[error("bad signature")]
    BadSignature,

    /// The signature matched but the master page fields are inconsistent
    /// with the file size.
    #[error("bad master page")]
    BadMasterPage,

    /// A table definition failed validation.
    #[error("invalid table definition: {0}")]
    Schema(String),

    /// A record's column value does not match the schema column type.
    #[error("type mismatch for column '{column}'")]
    TypeMismatch { column: String },

    /// A record or table does not exist.
    #[error("record not found")]
    NotFound,

    /// Insert-only collision, or a duplicate table name.
    #[error("record already exists")]
    AlreadyExists,

    /// The queried column set is not a prefix of the primary key or of any
    /// defined secondary index.
    #[error("no index found")]
    NoIndex,

    /// A prefix or free-list counter would wrap.
    #[error("counter overflow")]
    Overflow,

    /// A range scan hit the row cap. The partial result is carried with
    /// the error so callers keep the rows scanned so far.
    #[error("reached maximum result limit")]
    RangeLimit(Vec<Record>),
}

impl DbError {
    /// Recovers the typed kind from an `eyre` report, if any.
    pub fn of(report: &eyre::Report) -> Option<&DbError> {
        report.downcast_ref::<DbError>()
    }

    /// True when the report carries a `NotFound` kind.
    pub fn is_not_found(report: &eyre::Report) -> bool {
        matches!(Self::of(report), Some(DbError::NotFound))
    }

    /// True when the report carries an `AlreadyExists` kind.
    pub fn is_already_exists(report: &eyre::Report) -> bool {
        matches!(Self::of(report), Some(DbError::AlreadyExists))
    }
}
