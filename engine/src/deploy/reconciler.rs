//! Service reconciler
//!
//! Converges a named service to a desired [`ServiceSpec`]: update when the
//! service exists (carrying the version token just read), create when it does
//! not, and treat a create conflict as success. Version conflicts are retried
//! a bounded number of times; every other orchestrator failure is returned
//! to the caller unchanged.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::orchestrator::{
    Orchestrator, OrchestratorError, RegistryAuth, ServiceSpec, ServiceState,
};
use crate::utils::{calc_jittered_backoff, CooldownOptions};

/// Image could not be made available locally
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ImagePullError {
    #[error("image {image} not found: {message}")]
    NotFound { image: String, message: String },

    #[error("registry unreachable while pulling {image}: {message}")]
    RegistryUnreachable { image: String, message: String },

    #[error("registry refused credentials for {image}: {message}")]
    Unauthorized { image: String, message: String },

    #[error("pull of {image} failed: {message}")]
    Failed { image: String, message: String },
}

impl ImagePullError {
    /// Registry-side failures become an [`ImagePullError`]; anything that
    /// says the orchestrator itself misbehaved is handed back unchanged.
    fn classify(image: &str, err: OrchestratorError) -> Result<Self, OrchestratorError> {
        let image = image.to_string();
        Ok(match err {
            OrchestratorError::ImageNotFound(message) | OrchestratorError::NotFound(message) => {
                ImagePullError::NotFound { image, message }
            }
            OrchestratorError::RegistryUnreachable(message) => {
                ImagePullError::RegistryUnreachable { image, message }
            }
            OrchestratorError::Unauthorized(message) => ImagePullError::Unauthorized { image, message },
            OrchestratorError::Rejected { status, message } => ImagePullError::Failed {
                image,
                message: format!("rejected ({}): {}", status, message),
            },
            other @ (OrchestratorError::Unreachable(_)
            | OrchestratorError::Conflict(_)
            | OrchestratorError::VersionConflict(_)) => return Err(other),
        })
    }
}

/// Reconciliation failed
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReconcileError {
    #[error(transparent)]
    ImagePull(#[from] ImagePullError),

    #[error("invalid spec: {0}")]
    InvalidSpec(String),

    #[error("service {0} does not exist")]
    NotFound(String),

    #[error("service {name} still out of sequence after {attempts} attempts")]
    VersionConflict { name: String, attempts: u32 },

    #[error("orchestrator failed on service {name}: {source}")]
    Orchestrator {
        name: String,
        source: OrchestratorError,
    },

    #[error("orchestrator failed while preparing image {image}: {source}")]
    ImageLookup {
        image: String,
        source: OrchestratorError,
    },
}

impl ReconcileError {
    fn orchestrator(name: &str, source: OrchestratorError) -> Self {
        ReconcileError::Orchestrator {
            name: name.to_string(),
            source,
        }
    }

    fn image_lookup(image: &str, source: OrchestratorError) -> Self {
        ReconcileError::ImageLookup {
            image: image.to_string(),
            source,
        }
    }

    /// Whether the registry, rather than the orchestrator, was at fault
    pub fn is_image_pull(&self) -> bool {
        matches!(self, ReconcileError::ImagePull(_))
    }
}

/// Bounded retry on version conflicts
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total lookup+update attempts
    pub max_attempts: u32,

    pub backoff: CooldownOptions,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: CooldownOptions::default(),
        }
    }
}

/// Which branch converged the service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcilePath {
    Created,
    Updated,
    /// Create raced with another creator
    AlreadyExisted,
}

/// Result of a successful reconcile
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileOutcome {
    pub state: ServiceState,
    pub path: ReconcilePath,
}

pub struct Reconciler {
    orchestrator: Arc<dyn Orchestrator>,
    retry: RetryPolicy,
}

impl Reconciler {
    pub fn new(orchestrator: Arc<dyn Orchestrator>, retry: RetryPolicy) -> Self {
        Self {
            orchestrator,
            retry,
        }
    }

    /// Get the orchestrator handle
    pub fn orchestrator(&self) -> &Arc<dyn Orchestrator> {
        &self.orchestrator
    }

    /// Converge the service to `spec`
    pub async fn reconcile(&self, spec: &ServiceSpec) -> Result<ServiceState, ReconcileError> {
        self.reconcile_with(spec, None).await.map(|o| o.state)
    }

    /// Converge the service to `spec`, pulling with `auth` when needed
    pub async fn reconcile_with(
        &self,
        spec: &ServiceSpec,
        auth: Option<&RegistryAuth>,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        spec.validate()
            .map_err(|e| ReconcileError::InvalidSpec(e.to_string()))?;
        self.ensure_image(&spec.image, auth).await?;

        let name = spec.name.as_str();
        let attempts = self.retry.max_attempts.max(1);

        for attempt in 0..attempts {
            let current = self
                .orchestrator
                .get_service(name)
                .await
                .map_err(|e| ReconcileError::orchestrator(name, e))?;

            if let Some(current) = current {
                match self
                    .orchestrator
                    .update_service(name, current.version_index, spec)
                    .await
                {
                    Ok(()) => {
                        info!("Service {} updated (version {})", name, current.version_index);
                        let state = self.read_state(name).await?;
                        return Ok(ReconcileOutcome {
                            state,
                            path: ReconcilePath::Updated,
                        });
                    }
                    Err(OrchestratorError::VersionConflict(message)) => {
                        warn!(
                            "Service {} update raced (attempt {}/{}): {}",
                            name,
                            attempt + 1,
                            attempts,
                            message
                        );
                        self.backoff(attempt, attempts).await;
                        continue;
                    }
                    Err(OrchestratorError::NotFound(_)) => {
                        debug!("Service {} vanished before update, creating", name);
                    }
                    Err(e) => return Err(ReconcileError::orchestrator(name, e)),
                }
            }

            return match self.orchestrator.create_service(spec).await {
                Ok(()) => {
                    info!("Service {} not found, created", name);
                    let state = self.read_state(name).await?;
                    Ok(ReconcileOutcome {
                        state,
                        path: ReconcilePath::Created,
                    })
                }
                Err(OrchestratorError::Conflict(_)) => {
                    info!("Service {} already exists, continuing", name);
                    let state = self.read_state(name).await?;
                    Ok(ReconcileOutcome {
                        state,
                        path: ReconcilePath::AlreadyExisted,
                    })
                }
                Err(e) => Err(ReconcileError::orchestrator(name, e)),
            };
        }

        Err(ReconcileError::VersionConflict {
            name: name.to_string(),
            attempts,
        })
    }

    /// Resubmit `spec` with a new replica count. Update-only: a service
    /// that does not exist is an error rather than created.
    pub async fn scale(
        &self,
        spec: &ServiceSpec,
        replicas: u64,
    ) -> Result<ServiceState, ReconcileError> {
        let scaled = spec.with_replicas(replicas);
        if replicas > 0 {
            self.ensure_image(&scaled.image, None).await?;
        }

        let name = scaled.name.as_str();
        let attempts = self.retry.max_attempts.max(1);

        for attempt in 0..attempts {
            let current = self
                .orchestrator
                .get_service(name)
                .await
                .map_err(|e| ReconcileError::orchestrator(name, e))?
                .ok_or_else(|| ReconcileError::NotFound(name.to_string()))?;

            match self
                .orchestrator
                .update_service(name, current.version_index, &scaled)
                .await
            {
                Ok(()) => {
                    info!("Service {} scaled to {} replicas", name, replicas);
                    return self.read_state(name).await;
                }
                Err(OrchestratorError::VersionConflict(message)) => {
                    warn!("Service {} scale raced: {}", name, message);
                    self.backoff(attempt, attempts).await;
                }
                Err(OrchestratorError::NotFound(_)) => {
                    return Err(ReconcileError::NotFound(name.to_string()))
                }
                Err(e) => return Err(ReconcileError::orchestrator(name, e)),
            }
        }

        Err(ReconcileError::VersionConflict {
            name: name.to_string(),
            attempts,
        })
    }

    /// Pull-if-absent. A failed local lookup is an orchestrator failure;
    /// a failed pull is an [`ImagePullError`] unless the Engine API itself
    /// could not be reached.
    pub async fn ensure_image(
        &self,
        image: &str,
        auth: Option<&RegistryAuth>,
    ) -> Result<(), ReconcileError> {
        let present = self
            .orchestrator
            .image_exists(image)
            .await
            .map_err(|e| ReconcileError::image_lookup(image, e))?;
        if present {
            debug!("Image {} already present", image);
            return Ok(());
        }

        info!("Pulling image {}", image);
        match self.orchestrator.pull_image(image, auth).await {
            Ok(()) => Ok(()),
            Err(e) => Err(match ImagePullError::classify(image, e) {
                Ok(pull) => pull.into(),
                Err(e) => ReconcileError::image_lookup(image, e),
            }),
        }
    }

    /// Ensure-exists for an overlay network. Returns whether it was created.
    pub async fn ensure_network(&self, name: &str) -> Result<bool, OrchestratorError> {
        if self.orchestrator.network_exists(name).await? {
            return Ok(false);
        }
        match self.orchestrator.create_network(name).await {
            Ok(()) => {
                info!("Network {} created", name);
                Ok(true)
            }
            Err(OrchestratorError::Conflict(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn read_state(&self, name: &str) -> Result<ServiceState, ReconcileError> {
        self.orchestrator
            .get_service(name)
            .await
            .map_err(|e| ReconcileError::orchestrator(name, e))?
            .ok_or_else(|| ReconcileError::NotFound(name.to_string()))
    }

    async fn backoff(&self, attempt: u32, attempts: u32) {
        if attempt + 1 < attempts {
            tokio::time::sleep(calc_jittered_backoff(&self.retry.backoff, attempt)).await;
        }
    }
}
