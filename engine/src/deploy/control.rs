//! Immediate service control
//!
//! `start`, `stop` and `reload` resubmit the last accepted spec of a service
//! with a different replica count. They go through the reconciler's
//! version-checked update path and never create a service.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::deploy::reconciler::{ReconcileError, Reconciler};
use crate::errors::EngineError;
use crate::orchestrator::{ServiceSpec, ServiceState};
use crate::queue::JobQueue;

/// Control intent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlAction {
    Start,
    Stop,
    Reload,
}

impl ControlAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ControlAction::Start => "start",
            ControlAction::Stop => "stop",
            ControlAction::Reload => "reload",
        }
    }
}

pub struct ServiceControl {
    reconciler: Arc<Reconciler>,
    queue: Arc<dyn JobQueue>,
}

impl ServiceControl {
    pub fn new(reconciler: Arc<Reconciler>, queue: Arc<dyn JobQueue>) -> Self {
        Self { reconciler, queue }
    }

    pub async fn apply(&self, service: &str, action: ControlAction) -> Result<ServiceState, EngineError> {
        let spec = self.last_spec(service).await?;
        let state = match action {
            ControlAction::Start => self.scale(&spec, spec.replicas.max(1)).await?,
            ControlAction::Stop => self.scale(&spec, 0).await?,
            ControlAction::Reload => {
                self.scale(&spec, 0).await?;
                self.scale(&spec, spec.replicas.max(1)).await?
            }
        };
        info!(
            "Service {} {} applied ({} replicas)",
            service,
            action.as_str(),
            state.desired_replicas
        );
        Ok(state)
    }

    async fn last_spec(&self, service: &str) -> Result<ServiceSpec, EngineError> {
        self.queue
            .latest_for_service(service)
            .await?
            .map(|job| job.spec)
            .ok_or_else(|| EngineError::NotFound(format!("no deployment recorded for service {}", service)))
    }

    async fn scale(&self, spec: &ServiceSpec, replicas: u64) -> Result<ServiceState, EngineError> {
        match self.reconciler.scale(spec, replicas).await {
            Err(ReconcileError::NotFound(name)) => Err(EngineError::NotFound(format!(
                "service {} is not running on the orchestrator",
                name
            ))),
            other => Ok(other?),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deploy::reconciler::RetryPolicy;
    use crate::models::job::{DeploymentJob, JobAction, ServiceKind};
    use crate::orchestrator::memory::MemoryOrchestrator;
    use crate::queue::memory::MemoryJobQueue;

    async fn deployed() -> (Arc<MemoryOrchestrator>, ServiceControl) {
        let orchestrator = Arc::new(MemoryOrchestrator::new());
        let queue = Arc::new(MemoryJobQueue::new());
        let reconciler = Arc::new(Reconciler::new(orchestrator.clone(), RetryPolicy::default()));
        let spec = ServiceSpec::new("web", "nginx:1.27").with_replicas(2);
        reconciler.reconcile(&spec).await.unwrap();
        queue
            .enqueue(&DeploymentJob::new(ServiceKind::Application, JobAction::Deploy, spec))
            .await
            .unwrap();
        (orchestrator, ServiceControl::new(reconciler, queue))
    }

    #[tokio::test]
    async fn test_stop_then_start_restores_replicas() {
        let (orchestrator, control) = deployed().await;

        let stopped = control.apply("web", ControlAction::Stop).await.unwrap();
        assert_eq!(stopped.desired_replicas, 0);

        let started = control.apply("web", ControlAction::Start).await.unwrap();
        assert_eq!(started.desired_replicas, 2);
        assert_eq!(orchestrator.spec("web").unwrap().image, "nginx:1.27");
    }

    #[tokio::test]
    async fn test_reload_ends_running() {
        let (_, control) = deployed().await;
        let state = control.apply("web", ControlAction::Reload).await.unwrap();
        assert_eq!(state.desired_replicas, 2);
    }

    #[tokio::test]
    async fn test_unknown_service_is_not_found() {
        let (_, control) = deployed().await;
        let err = control.apply("ghost", ControlAction::Start).await.unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
    }
}
