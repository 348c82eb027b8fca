//! Error types for filekeep

use thiserror::Error;

/// Main error type for filekeep operations, matching the error kinds the
/// core surfaces to callers: NotFound, Forbidden, BadRequest, IoFailure,
/// ChunkMissing, Transient and Fatal.
#[derive(Error, Debug)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("chunk missing: manifest {manifest} references chunk {hash}")]
    ChunkMissing { manifest: String, hash: String },

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("fatal: {0}")]
    Fatal(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("TOML parsing error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
}

impl Error {
    pub fn not_found(what: impl Into<String>) -> Self {
        Error::NotFound(what.into())
    }

    pub fn forbidden(what: impl Into<String>) -> Self {
        Error::Forbidden(what.into())
    }

    pub fn bad_request(what: impl Into<String>) -> Self {
        Error::BadRequest(what.into())
    }
}

/// Result type alias for filekeep operations
pub type Result<T> = std::result::Result<T, Error>;
