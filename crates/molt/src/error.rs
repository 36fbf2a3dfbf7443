//! Error types for the migration library.

use thiserror::Error;

/// Main error type for fetch and verify operations.
#[derive(Error, Debug)]
pub enum MoltError {
    /// Configuration error (invalid flags, unsupported mode combinations).
    /// These are fail-fast and never retried.
    #[error("configuration error: {0}")]
    Config(String),

    /// Postgres-wire database error (source PostgreSQL or target CockroachDB).
    #[error("postgres error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    /// MySQL database error.
    #[error("mysql error: {0}")]
    MySql(#[from] mysql_async::Error),

    /// Oracle database error.
    #[error("oracle error: {0}")]
    Oracle(#[from] oracle::Error),

    /// Data export/import failed for a specific table.
    #[error("table {table}: {message}")]
    Table { table: String, message: String },

    /// Raw cell could not be converted to a canonical datum.
    #[error("cannot convert {value:?} to {type_name}: {message}")]
    Conversion {
        value: String,
        type_name: &'static str,
        message: String,
    },

    /// Blob store operation failed.
    #[error("blob store error: {0}")]
    Store(String),

    /// Invariant violation. Aborts the subcommand; signals the mapping
    /// tables or engine logic are incomplete.
    #[error("assertion failed: {0}")]
    Assertion(String),

    /// Operation cancelled (SIGINT, etc.).
    #[error("operation cancelled")]
    Cancelled,

    /// IO error (file operations, network streams).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// CSV encode/decode error.
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    /// JSON serialization/deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl MoltError {
    /// Create a per-table error.
    pub fn table(table: impl Into<String>, message: impl Into<String>) -> Self {
        MoltError::Table {
            table: table.into(),
            message: message.into(),
        }
    }

    /// Create an assertion failure.
    pub fn assertion(message: impl Into<String>) -> Self {
        MoltError::Assertion(message.into())
    }

    /// Create a blob store error.
    pub fn store(message: impl Into<String>) -> Self {
        MoltError::Store(message.into())
    }

    /// Format error with the full source chain.
    pub fn format_detailed(&self) -> String {
        let mut output = format!("error: {}", self);
        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\ncaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }
        output
    }
}

/// Result type alias for migration operations.
pub type Result<T> = std::result::Result<T, MoltError>;
