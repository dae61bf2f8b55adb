//! Error types for the DICOM index

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Bad parameter type: {0}")]
    BadParameterType(String),

    #[error("Parameter out of range: {0}")]
    ParameterOutOfRange(String),

    #[error("Bad sequence of calls: {0}")]
    BadSequenceOfCalls(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Not implemented: {0}")]
    NotImplemented(String),

    #[error("Inexistent item: {0}")]
    InexistentItem(String),

    #[error("Unknown resource: {0}")]
    UnknownResource(String),

    #[error("Inexistent file: {0}")]
    InexistentFile(String),

    /// The storage backend returned inconsistent data.
    #[error("Error in the database backend: {0}")]
    DatabasePlugin(String),

    #[error("Incompatible database version: {0}")]
    IncompatibleDatabaseVersion(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Short machine-readable code, stable across releases.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Database(_) | Error::Migration(_) => "database",
            Error::BadParameterType(_) => "bad-parameter-type",
            Error::ParameterOutOfRange(_) => "parameter-out-of-range",
            Error::BadSequenceOfCalls(_) => "bad-sequence-of-calls",
            Error::BadRequest(_) => "bad-request",
            Error::NotImplemented(_) => "not-implemented",
            Error::InexistentItem(_) => "inexistent-item",
            Error::UnknownResource(_) => "unknown-resource",
            Error::InexistentFile(_) => "inexistent-file",
            Error::DatabasePlugin(_) => "database-plugin",
            Error::IncompatibleDatabaseVersion(_) => "incompatible-database-version",
            Error::Internal(_) | Error::Other(_) => "internal",
        }
    }

    pub fn is_not_implemented(&self) -> bool {
        matches!(self, Error::NotImplemented(_))
    }
}
