//! Error type shared by the record sources, sink and remote client.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("message store not found at {0}")]
    StoreNotFound(PathBuf),

    #[error("permission denied reading {0}; grant Full Disk Access to the terminal")]
    PermissionDenied(PathBuf),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("invalid tapback pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API request failed: {status} - {body}")]
    Api { status: u16, body: String },

    #[error("OPENAI_API_KEY is not set and no key file was found")]
    MissingApiKey,
}

pub type Result<T> = std::result::Result<T, Error>;
