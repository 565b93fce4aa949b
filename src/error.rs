//! Error types for dripflow.
//!
//! Every error carries a stable code and a retry category so the graph-walk
//! loop can decide between retrying, failing the run, or skipping it.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for dripflow operations.
pub type Result<T> = std::result::Result<T, Error>;

/// dripflow error types.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed automation definition, rejected at save time.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Dangling node reference or cycle, rejected at save/activate time.
    #[error("Graph error: {0}")]
    Graph(String),

    /// Transient failure during node execution (send timeout, contention).
    #[error("Execution error: {0}")]
    Execution(String),

    /// Problem discovered at execution time that a retry cannot fix.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Row already claimed by another worker.
    #[error("Concurrency conflict: {0}")]
    Conflict(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Get the error code for programmatic consumers.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Validation(_) => "VALIDATION_ERROR",
            Error::Graph(_) => "GRAPH_ERROR",
            Error::Execution(_) => "EXECUTION_ERROR",
            Error::Configuration(_) => "CONFIGURATION_ERROR",
            Error::Conflict(_) => "CONCURRENCY_CONFLICT",
            Error::NotFound(_) => "NOT_FOUND",
            Error::Storage(_) => "STORAGE_ERROR",
            Error::Parse(_) => "PARSE_ERROR",
            Error::Internal(_) => "INTERNAL_ERROR",
            Error::Database(_) => "DATABASE_ERROR",
            Error::Yaml(_) => "YAML_ERROR",
            Error::Json(_) => "JSON_ERROR",
            Error::Io(_) => "IO_ERROR",
        }
    }

    /// Classify the error for retry decisions.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Validation(_) | Error::Graph(_) | Error::Parse(_) | Error::NotFound(_) => {
                ErrorCategory::ClientError
            }

            // Contention on the database is worth another attempt.
            Error::Execution(_) | Error::Storage(_) | Error::Database(_) | Error::Io(_) => {
                ErrorCategory::Transient
            }

            Error::Conflict(_) => ErrorCategory::Conflict,

            Error::Configuration(_) | Error::Internal(_) | Error::Yaml(_) | Error::Json(_) => {
                ErrorCategory::Permanent
            }
        }
    }

    /// Whether the graph-walk loop should schedule another attempt.
    pub fn is_retryable(&self) -> bool {
        self.category() == ErrorCategory::Transient
    }

    /// Convert to a JSON error envelope.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "success": false,
            "error": {
                "code": self.code(),
                "category": self.category(),
                "message": self.to_string(),
            }
        })
    }
}

/// Error categories used for retry logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Invalid input. Do not retry without fixing the request.
    ClientError,
    /// May succeed on retry.
    Transient,
    /// Will not succeed on retry.
    Permanent,
    /// Another worker owns the row; skip it.
    Conflict,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorCategory::ClientError => write!(f, "client_error"),
            ErrorCategory::Transient => write!(f, "transient"),
            ErrorCategory::Permanent => write!(f, "permanent"),
            ErrorCategory::Conflict => write!(f, "conflict"),
        }
    }
}
