use async_openai::error::OpenAIError;
use thiserror::Error;
use tokio::task::JoinError;

use crate::storage::object::StorageError;

// Core internal errors. Every variant maps onto one of the machine-readable
// kinds surfaced to clients; `Dependency` carries the failing subsystem name.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Already exists: {0}")]
    AlreadyExists(String),
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Unauthorized: {0}")]
    Unauthorized(String),
    #[error("Forbidden: {0}")]
    Forbidden(String),
    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),
    #[error("Dependency failure ({dependency}): {message}")]
    Dependency {
        dependency: &'static str,
        message: String,
    },
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn graph(message: impl Into<String>) -> Self {
        Self::Dependency {
            dependency: "graph-store",
            message: message.into(),
        }
    }

    pub fn llm(message: impl Into<String>) -> Self {
        Self::Dependency {
            dependency: "llm",
            message: message.into(),
        }
    }

    /// Machine-readable error kind, stable across releases.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::AlreadyExists(_) => "already_exists",
            Self::InvalidArgument(_) => "invalid_argument",
            Self::Unauthorized(_) => "unauthorized",
            Self::Forbidden(_) => "forbidden",
            Self::QuotaExceeded(_) => "quota_exceeded",
            Self::Dependency { .. } => "dependency_failure",
            Self::Conflict(_) => "conflict",
            Self::Internal(_) => "internal",
        }
    }
}

impl From<surrealdb::Error> for AppError {
    fn from(err: surrealdb::Error) -> Self {
        Self::graph(err.to_string())
    }
}

impl From<OpenAIError> for AppError {
    fn from(err: OpenAIError) -> Self {
        Self::llm(err.to_string())
    }
}

impl From<StorageError> for AppError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound { ref key } => Self::NotFound(format!("object {key}")),
            other => Self::Dependency {
                dependency: "object-store",
                message: other.to_string(),
            },
        }
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidArgument(err.to_string())
    }
}

impl From<JoinError> for AppError {
    fn from(err: JoinError) -> Self {
        Self::Internal(format!("task join error: {err}"))
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_stable() {
        assert_eq!(AppError::NotFound("x".into()).kind(), "not_found");
        assert_eq!(AppError::QuotaExceeded("x".into()).kind(), "quota_exceeded");
        assert_eq!(AppError::graph("down").kind(), "dependency_failure");
    }

    #[test]
    fn dependency_message_names_the_subsystem() {
        let err = AppError::llm("timeout");
        assert!(err.to_string().contains("llm"));
    }
}
