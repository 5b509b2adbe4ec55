//! Error types shared across the indexing and query pipeline.
//!
//! Per-document failures (`Scan`, `Normalization`) are isolated by their
//! callers and never abort a batch; `Store` and `Database` errors are fatal
//! to the current indexing run and trigger rollback.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("scan error: {0}")]
    Scan(String),

    #[error("normalization error: {0}")]
    Normalization(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("document not found: {0}")]
    NotFound(String),

    #[error("scheduling error: {0}")]
    Scheduling(String),

    #[error("a transaction is already open on this store")]
    NestedTransaction,

    #[error("no transaction is open on this store")]
    NoTransaction,

    #[error("an indexing run is already in flight")]
    RunInFlight,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("watch error: {0}")]
    Watch(#[from] notify::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
