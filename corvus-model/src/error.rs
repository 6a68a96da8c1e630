use std::fmt::{self, Display};

/// Errors produced by model constructors and validation routines.
#[derive(Debug)]
pub enum ModelError {
    Io(std::io::Error),
    Serialization(serde_json::Error),
    InvalidWing(Vec<String>),
    InvalidConfig(String),
}

impl Display for ModelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelError::Io(err) => write!(f, "io error: {err}"),
            ModelError::Serialization(err) => write!(f, "serialization error: {err}"),
            ModelError::InvalidWing(problems) => {
                write!(f, "invalid wing: {}", problems.join("; "))
            }
            ModelError::InvalidConfig(msg) => write!(f, "invalid config: {msg}"),
        }
    }
}

impl std::error::Error for ModelError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ModelError::Io(err) => Some(err),
            ModelError::Serialization(err) => Some(err),
            ModelError::InvalidWing(_) | ModelError::InvalidConfig(_) => None,
        }
    }
}

impl From<std::io::Error> for ModelError {
    fn from(err: std::io::Error) -> Self {
        ModelError::Io(err)
    }
}

impl From<serde_json::Error> for ModelError {
    fn from(err: serde_json::Error) -> Self {
        ModelError::Serialization(err)
    }
}

pub type Result<T> = std::result::Result<T, ModelError>;
