//! Rule Engine Error Types

use thiserror::Error;

/// Result type for rule operations
pub type Result<T> = std::result::Result<T, RuleError>;

/// Rule engine errors
#[derive(Debug, Error)]
pub enum RuleError {
    /// Invalid catalog format
    #[error("Invalid catalog format: {0}")]
    InvalidFormat(String),

    /// Catalog parsing error
    #[error("Catalog parsing error: {0}")]
    ParseError(String),

    /// Unknown condition/effect/action kind in the catalog
    #[error("Unknown {category} kind '{kind}' in rule {rule_id}")]
    UnknownKind {
        category: &'static str,
        kind: String,
        rule_id: String,
    },

    /// Transfer request missing required fields
    #[error("Invalid transfer request: {0}")]
    InvalidTransfer(String),

    /// Transfer rejected by the robot scheduler
    #[error("Transfer rejected: {0}")]
    TransferRejected(String),

    /// Engine task is no longer running
    #[error("Engine stopped")]
    EngineStopped,

    /// IO error (catalog files, rule logs)
    #[error("IO error: {0}")]
    IoError(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl From<serde_json::Error> for RuleError {
    fn from(err: serde_json::Error) -> Self {
        RuleError::SerializationError(err.to_string())
    }
}

impl From<serde_yaml::Error> for RuleError {
    fn from(err: serde_yaml::Error) -> Self {
        RuleError::SerializationError(err.to_string())
    }
}

impl From<std::io::Error> for RuleError {
    fn from(err: std::io::Error) -> Self {
        RuleError::IoError(err.to_string())
    }
}
