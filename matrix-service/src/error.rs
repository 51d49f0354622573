// Service Errors
// Error taxonomy shared by the parser, expander, environments, and runners

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised by the matrix service
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid workflow: {0}")]
    InvalidWorkflow(String),

    #[error("invalid matrix: {0}")]
    InvalidMatrix(String),

    #[error("expression error in '{expression}': {message}")]
    Expression { expression: String, message: String },

    #[error("failed to provision environment at {path}: {message}")]
    Provisioning { path: PathBuf, message: String },

    #[error("action '{0}' is not available locally")]
    UnsupportedAction(String),

    #[error("action '{action}' failed: {message}")]
    Action { action: String, message: String },

    #[error("coverage upload failed: {0}")]
    CoverageUpload(String),
}

impl ServiceError {
    pub fn invalid_workflow(message: impl Into<String>) -> Self {
        Self::InvalidWorkflow(message.into())
    }

    pub fn invalid_matrix(message: impl Into<String>) -> Self {
        Self::InvalidMatrix(message.into())
    }

    pub fn expression(expression: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Expression {
            expression: expression.into(),
            message: message.into(),
        }
    }

    pub fn action(action: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Action {
            action: action.into(),
            message: message.into(),
        }
    }
}

/// Result alias used across the service
pub type ServiceResult<T> = Result<T, ServiceError>;
