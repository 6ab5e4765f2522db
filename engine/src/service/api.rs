//! Intent API
//!
//! The only entry point callers use to act on services: deploys are queued
//! as jobs, start/stop/reload act immediately through the reconciler.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::deploy::control::{ControlAction, ServiceControl};
use crate::deploy::fsm::JobState;
use crate::errors::EngineError;
use crate::logstream::{LogHub, LogSubscription};
use crate::models::job::{DeploymentJob, JobAction, ServiceKind};
use crate::orchestrator::{RegistryAuth, ServiceSpec, ServiceState};
use crate::queue::JobQueue;
use crate::routing::Domain;

/// Body of a deploy intent
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployRequest {
    pub spec: ServiceSpec,

    #[serde(default)]
    pub kind: ServiceKind,

    #[serde(default)]
    pub domains: Vec<Domain>,

    #[serde(default)]
    pub registry_auth: Option<RegistryAuth>,
}

/// Answer to a cancel intent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelOutcome {
    pub job_id: Uuid,
    pub cancelled: bool,
    pub message: String,
}

pub struct ServiceApi {
    queue: Arc<dyn JobQueue>,
    control: ServiceControl,
    logs: Arc<LogHub>,
}

impl ServiceApi {
    pub fn new(queue: Arc<dyn JobQueue>, control: ServiceControl, logs: Arc<LogHub>) -> Self {
        Self {
            queue,
            control,
            logs,
        }
    }

    /// Queue a deployment of `spec` under `name`
    pub async fn deploy(&self, name: &str, request: DeployRequest) -> Result<DeploymentJob, EngineError> {
        let mut spec = request.spec;
        if spec.name.is_empty() {
            spec.name = name.to_string();
        }
        if spec.name != name {
            return Err(EngineError::ValidationError(format!(
                "spec names service '{}' but the request targets '{}'",
                spec.name, name
            )));
        }
        spec.validate()?;

        let job = DeploymentJob::new(request.kind, JobAction::Deploy, spec)
            .with_domains(request.domains)
            .with_registry_auth(request.registry_auth);
        self.queue.enqueue(&job).await?;
        info!("Queued deployment {} of {}", job.id, name);
        Ok(job)
    }

    /// Queue a new job with the last accepted spec of `name`
    pub async fn redeploy(&self, name: &str) -> Result<DeploymentJob, EngineError> {
        let previous = self
            .queue
            .latest_for_service(name)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("no deployment recorded for service {}", name)))?;

        let job = previous.rerun();
        self.queue.enqueue(&job).await?;
        info!("Queued redeployment {} of {} (from {})", job.id, name, previous.id);
        Ok(job)
    }

    pub async fn start(&self, name: &str) -> Result<ServiceState, EngineError> {
        self.control.apply(name, ControlAction::Start).await
    }

    pub async fn stop(&self, name: &str) -> Result<ServiceState, EngineError> {
        self.control.apply(name, ControlAction::Stop).await
    }

    pub async fn reload(&self, name: &str) -> Result<ServiceState, EngineError> {
        self.control.apply(name, ControlAction::Reload).await
    }

    pub async fn job(&self, job_id: Uuid) -> Result<DeploymentJob, EngineError> {
        self.queue
            .job(job_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("job {}", job_id)))
    }

    /// Request cancellation. Jobs past reconciliation report not cancelled.
    /// The stage is read again after the flag is set, since the pipeline may
    /// have moved on in between.
    pub async fn cancel(&self, job_id: Uuid) -> Result<CancelOutcome, EngineError> {
        let job = self.job(job_id).await?;
        if !job.stage.is_cancellable() {
            return Ok(CancelOutcome {
                job_id,
                cancelled: false,
                message: format!("job is {} and can no longer be cancelled", job.stage),
            });
        }

        self.queue.request_cancel(job_id).await?;
        info!("Cancellation requested for job {}", job_id);
        let after = self.job(job_id).await?;
        Ok(cancel_outcome(job_id, after.stage))
    }

    /// Ordered log of a job, replaying what was already emitted
    pub async fn subscribe_logs(&self, job_id: Uuid) -> Result<LogSubscription, EngineError> {
        let job = self.job(job_id).await?;
        if job.stage.is_terminal() && self.logs.history(job_id).is_empty() {
            // Finished before this process started
            let _ = self.logs.emit_terminal(
                job_id,
                format!("Job {}; earlier log lines are not retained", job.status.as_str()),
            );
        }
        Ok(self.logs.subscribe(job_id))
    }
}

fn cancel_outcome(job_id: Uuid, stage: JobState) -> CancelOutcome {
    match stage {
        JobState::Cancelled => CancelOutcome {
            job_id,
            cancelled: true,
            message: "job cancelled".to_string(),
        },
        stage if stage.is_cancellable() => CancelOutcome {
            job_id,
            cancelled: true,
            message: format!(
                "cancellation requested; the job is {} and stops at its next checkpoint",
                stage
            ),
        },
        stage => CancelOutcome {
            job_id,
            cancelled: false,
            message: format!("job reached {} before the request was seen", stage),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deploy::fsm::JobState;
    use crate::deploy::reconciler::{Reconciler, RetryPolicy};
    use crate::orchestrator::memory::MemoryOrchestrator;
    use crate::queue::memory::MemoryJobQueue;

    fn api() -> (Arc<MemoryJobQueue>, ServiceApi) {
        let queue = Arc::new(MemoryJobQueue::new());
        let reconciler = Arc::new(Reconciler::new(
            Arc::new(MemoryOrchestrator::new()),
            RetryPolicy::default(),
        ));
        let control = ServiceControl::new(reconciler, queue.clone());
        (queue.clone(), ServiceApi::new(queue, control, Arc::new(LogHub::default())))
    }

    fn request(name: &str) -> DeployRequest {
        DeployRequest {
            spec: ServiceSpec::new(name, "nginx:1.27"),
            kind: ServiceKind::Application,
            domains: Vec::new(),
            registry_auth: None,
        }
    }

    #[tokio::test]
    async fn test_deploy_rejects_mismatched_name() {
        let (_, api) = api();
        let err = api.deploy("other", request("web")).await.unwrap_err();
        assert!(matches!(err, EngineError::ValidationError(_)));
    }

    #[tokio::test]
    async fn test_redeploy_reuses_last_spec() {
        let (queue, api) = api();
        assert!(matches!(api.redeploy("web").await, Err(EngineError::NotFound(_))));

        let first = api.deploy("web", request("web")).await.unwrap();
        let second = api.redeploy("web").await.unwrap();
        assert_ne!(first.id, second.id);
        assert_eq!(second.spec, first.spec);
        assert_eq!(queue.pending_len(), 2);
    }

    #[tokio::test]
    async fn test_cancel_depends_on_stage() {
        let (queue, api) = api();
        let job = api.deploy("web", request("web")).await.unwrap();

        let outcome = api.cancel(job.id).await.unwrap();
        assert!(outcome.cancelled);
        assert!(queue.is_cancel_requested(job.id).await.unwrap());

        queue.update_state(job.id, JobState::Routing, None).await.unwrap();
        let late = api.cancel(job.id).await.unwrap();
        assert!(!late.cancelled);
    }

    #[test]
    fn test_cancel_answer_uses_stage_seen_after_request() {
        let id = Uuid::new_v4();

        let pending = cancel_outcome(id, JobState::Reconciling);
        assert!(pending.cancelled);
        assert!(pending.message.starts_with("cancellation requested"));

        // Pipeline moved past its last checkpoint before the flag landed
        let missed = cancel_outcome(id, JobState::Networking);
        assert!(!missed.cancelled);
        assert_eq!(missed.message, "job reached networking before the request was seen");

        assert!(cancel_outcome(id, JobState::Cancelled).cancelled);
        assert!(!cancel_outcome(id, JobState::Succeeded).cancelled);
    }

    #[tokio::test]
    async fn test_logs_of_finished_job_close_immediately() {
        let (queue, api) = api();
        let job = api.deploy("web", request("web")).await.unwrap();
        queue.update_state(job.id, JobState::Succeeded, None).await.unwrap();

        let mut subscription = api.subscribe_logs(job.id).await.unwrap();
        let event = subscription.next_event().await.unwrap();
        assert!(event.is_terminal);
        assert!(subscription.next_event().await.is_none());
    }
}
