//! Error types for the Empaas engine

use thiserror::Error;

/// Process-level error type for the engine
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Queue error: {0}")]
    QueueError(#[from] crate::queue::QueueError),

    #[error("Orchestrator error: {0}")]
    OrchestratorError(#[from] crate::orchestrator::OrchestratorError),

    #[error("Reconcile error: {0}")]
    ReconcileError(#[from] crate::deploy::reconciler::ReconcileError),

    #[error("Routing error: {0}")]
    RoutingError(#[from] crate::routing::RoutingWriteError),

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Shutdown error: {0}")]
    ShutdownError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<anyhow::Error> for EngineError {
    fn from(err: anyhow::Error) -> Self {
        EngineError::Internal(err.to_string())
    }
}
