use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RatchetError {
    #[error("Source file not found for table '{table}': {path}")]
    SourceNotFound { table: String, path: PathBuf },

    #[error("Schema mismatch for table '{table}': {detail}")]
    SchemaMismatch { table: String, detail: String },

    #[error("Unknown query: {0}")]
    UnknownQuery(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Session is closed")]
    SessionClosed,

    #[error("Checkpoint corrupt at {path}: {detail}")]
    CheckpointCorrupt { path: PathBuf, detail: String },

    #[error("Partition count mismatch at {path}: expected {expected}, found {found}")]
    PartitionCountMismatch {
        path: PathBuf,
        expected: usize,
        found: usize,
    },

    #[error("Statement mismatch: checkpoint expects {expected}, statement has {actual}")]
    StatementMismatch { expected: String, actual: String },

    #[error("Invalid suspend window [{start}, {end}]: {reason}")]
    SuspendWindowInvalid { start: f64, end: f64, reason: String },

    #[error("SQL parse error: {0}")]
    Parse(String),

    #[error("Unsupported statement: {0}")]
    Unsupported(String),

    #[error("Unknown table or view: {0}")]
    UnknownTable(String),

    #[error("Unknown column: {0}")]
    UnknownColumn(String),

    #[error("Catalog error: {0}")]
    Catalog(String),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Polars error: {0}")]
    Polars(String),
}

impl From<polars::error::PolarsError> for RatchetError {
    fn from(err: polars::error::PolarsError) -> Self {
        RatchetError::Polars(err.to_string())
    }
}

impl From<rusqlite::Error> for RatchetError {
    fn from(err: rusqlite::Error) -> Self {
        RatchetError::Catalog(err.to_string())
    }
}

impl From<sqlparser::parser::ParserError> for RatchetError {
    fn from(err: sqlparser::parser::ParserError) -> Self {
        RatchetError::Parse(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RatchetError>;
