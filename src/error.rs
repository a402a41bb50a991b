use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unsupported file type: {0}")]
    UnsupportedFileType(String),

    #[error("Parse failure: {0}")]
    ParseFailure(String),

    #[error("Unknown file: {0}")]
    UnknownFile(Uuid),

    #[error("Invalid state for {entity}: cannot move from {from} to {to}")]
    InvalidState {
        entity: String,
        from: String,
        to: String,
    },

    #[error("Settings error: {0}")]
    Settings(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, IngestError>;
