//! Container orchestrator API
//!
//! The [`Orchestrator`] trait is the only way the engine talks to the swarm.
//! [`docker::DockerEngine`] drives a Docker Engine API endpoint,
//! [`memory::MemoryOrchestrator`] keeps everything in process for local runs
//! and tests.

pub mod docker;
pub mod memory;
pub mod types;

use async_trait::async_trait;
use thiserror::Error;

pub use types::{
    is_valid_service_name, Mount, MountType, PortProtocol, PublishMode, PublishedPort,
    RegistryAuth, ServiceSpec, ServiceState,
};

/// Errors reported by an orchestrator backend
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OrchestratorError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    Conflict(String),

    #[error("version conflict: {0}")]
    VersionConflict(String),

    #[error("image not found: {0}")]
    ImageNotFound(String),

    /// The orchestrator itself could not be reached
    #[error("unreachable: {0}")]
    Unreachable(String),

    /// The orchestrator answered but could not reach the image registry
    #[error("registry unreachable: {0}")]
    RegistryUnreachable(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("rejected ({status}): {message}")]
    Rejected { status: u16, message: String },
}

/// Operations the engine needs from the orchestrator
#[async_trait]
pub trait Orchestrator: Send + Sync {
    /// Live state of a service, `None` when it does not exist
    async fn get_service(&self, name: &str) -> Result<Option<ServiceState>, OrchestratorError>;

    /// Create a service; `Conflict` when the name is taken
    async fn create_service(&self, spec: &ServiceSpec) -> Result<(), OrchestratorError>;

    /// Replace a service's spec; `VersionConflict` when `version` is stale
    async fn update_service(
        &self,
        name: &str,
        version: u64,
        spec: &ServiceSpec,
    ) -> Result<(), OrchestratorError>;

    /// Whether the image is present on the node
    async fn image_exists(&self, image: &str) -> Result<bool, OrchestratorError>;

    /// Pull the image from its registry
    async fn pull_image(
        &self,
        image: &str,
        auth: Option<&RegistryAuth>,
    ) -> Result<(), OrchestratorError>;

    async fn network_exists(&self, name: &str) -> Result<bool, OrchestratorError>;

    /// Create an attachable overlay network; `Conflict` when it exists
    async fn create_network(&self, name: &str) -> Result<(), OrchestratorError>;
}
