use std::fmt;

use thiserror::Error;

/// Errors surfaced by the correlation engine.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error("Source {source_id} unavailable: {reason}")]
    SourceUnavailable { source_id: String, reason: String },

    #[error("No timestamp column detected in {0}")]
    NoTimestampColumn(String),

    #[error("Unparseable timestamp value: {0}")]
    TimestampParse(String),

    #[error("No timestamp data found in any source")]
    EmptyTimeRange,

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("Memory limit exceeded: {0}")]
    MemoryExhausted(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<corvus_model::ModelError> for EngineError {
    fn from(err: corvus_model::ModelError) -> Self {
        EngineError::Configuration(err.to_string())
    }
}

impl EngineError {
    /// Coarse error category used by the coordinator's recovery chains.
    pub fn category(&self) -> ErrorCategory {
        match self {
            EngineError::Database(_) | EngineError::SourceUnavailable { .. } => {
                ErrorCategory::Database
            }
            EngineError::NoTimestampColumn(_) | EngineError::TimestampParse(_) => {
                ErrorCategory::Timestamp
            }
            EngineError::MemoryExhausted(_) => ErrorCategory::Memory,
            EngineError::Configuration(_) | EngineError::EmptyTimeRange => {
                ErrorCategory::Configuration
            }
            EngineError::Cancelled(_)
            | EngineError::Internal(_)
            | EngineError::Serialization(_) => ErrorCategory::Processing,
            EngineError::Io(_) => ErrorCategory::System,
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// Error category, keyed to a recovery-strategy chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ErrorCategory {
    Database,
    Timestamp,
    Memory,
    Configuration,
    Processing,
    System,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Severity grading for error events.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    serde::Serialize,
    serde::Deserialize,
)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn categories_follow_the_taxonomy() {
        assert_eq!(
            EngineError::NoTimestampColumn("prefetch".into()).category(),
            ErrorCategory::Timestamp
        );
        assert_eq!(
            EngineError::MemoryExhausted("over limit".into()).category(),
            ErrorCategory::Memory
        );
        assert_eq!(
            EngineError::Configuration("bad wing".into()).category(),
            ErrorCategory::Configuration
        );
    }

    #[test]
    fn severity_orders_low_to_critical() {
        assert!(ErrorSeverity::Low < ErrorSeverity::Critical);
        assert!(ErrorSeverity::Medium < ErrorSeverity::High);
    }
}
