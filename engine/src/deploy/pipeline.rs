//! Deployment pipeline
//!
//! Drives one job through `pulling → reconciling → networking → routing`.
//! Step failures never escape [`Pipeline::run`]: they become the job's
//! terminal failure event and its `failed` status.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{error, info, warn};
use uuid::Uuid;

use crate::deploy::fsm::{FailureCause, JobEvent, JobFsm, JobState, PipelineFailure};
use crate::deploy::reconciler::{ReconcileError, ReconcilePath, Reconciler};
use crate::logstream::LogHub;
use crate::models::job::DeploymentJob;
use crate::orchestrator::ServiceState;
use crate::queue::JobQueue;
use crate::routing::{RoutingChange, RoutingStore};

pub const SUCCESS_MESSAGE: &str = "Deployment completed successfully!";

/// Outcome of one pipeline run
#[derive(Debug, Clone)]
pub struct PipelineReport {
    pub job_id: Uuid,
    pub service_name: String,
    pub state: JobState,
    pub service_state: Option<ServiceState>,
    pub failure: Option<PipelineFailure>,
    pub elapsed: Duration,
}

impl PipelineReport {
    pub fn succeeded(&self) -> bool {
        self.state == JobState::Succeeded
    }
}

/// Per-run bookkeeping
struct JobRun<'a> {
    job: &'a DeploymentJob,
    fsm: JobFsm,
    started: Instant,
    service_state: Option<ServiceState>,
}

pub struct Pipeline {
    reconciler: Arc<Reconciler>,
    routing: Arc<dyn RoutingStore>,
    queue: Arc<dyn JobQueue>,
    logs: Arc<LogHub>,
    cancel_poll: Duration,
}

impl Pipeline {
    pub fn new(
        reconciler: Arc<Reconciler>,
        routing: Arc<dyn RoutingStore>,
        queue: Arc<dyn JobQueue>,
        logs: Arc<LogHub>,
    ) -> Self {
        Self {
            reconciler,
            routing,
            queue,
            logs,
            cancel_poll: Duration::from_millis(500),
        }
    }

    /// How often a running pull looks for a cancel request
    pub fn with_cancel_poll(mut self, cancel_poll: Duration) -> Self {
        self.cancel_poll = cancel_poll;
        self
    }

    pub fn logs(&self) -> &Arc<LogHub> {
        &self.logs
    }

    /// Run a consumed job to a terminal state
    pub async fn run(&self, job: &DeploymentJob) -> PipelineReport {
        let mut run = JobRun {
            job,
            fsm: JobFsm::new(),
            started: Instant::now(),
            service_state: None,
        };
        info!(
            "Deployment {} of {} started ({})",
            job.id,
            job.target_service_name,
            job.kind.as_str()
        );
        self.log(
            job.id,
            format!(
                "Starting deployment of {} with image {}",
                job.target_service_name, job.spec.image
            ),
        );

        if self.cancel_requested(job.id).await {
            return self.cancel(run, "Deployment cancelled before it started").await;
        }

        // Pulling
        self.advance(&mut run, JobEvent::Start).await;
        self.log(job.id, format!("Pulling image {}", job.spec.image));
        let pull = self
            .reconciler
            .ensure_image(&job.spec.image, job.registry_auth.as_ref());
        tokio::select! {
            biased;
            pulled = pull => {
                if let Err(e) = pulled {
                    return self.fail(run, reconcile_failure_cause(&e), e.to_string()).await;
                }
            }
            _ = self.wait_for_cancel(job.id) => {
                return self.cancel(run, "Deployment cancelled while pulling the image").await;
            }
        }
        self.log(job.id, format!("Image {} is ready", job.spec.image));
        self.advance(&mut run, JobEvent::Pulled).await;

        // Reconciling
        if self.cancel_requested(job.id).await {
            return self.cancel(run, "Deployment cancelled before the service was updated").await;
        }
        let missing_networks = match self.missing_networks(job).await {
            Ok(missing) => missing,
            Err(message) => return self.fail(run, FailureCause::Reconcile, message).await,
        };
        let mut initial = job.spec.clone();
        initial.networks.retain(|n| !missing_networks.contains(n));
        self.log(job.id, format!("Reconciling service {}", job.target_service_name));
        match self
            .reconciler
            .reconcile_with(&initial, job.registry_auth.as_ref())
            .await
        {
            Ok(outcome) => {
                let verb = match outcome.path {
                    ReconcilePath::Created => "created",
                    ReconcilePath::Updated => "updated",
                    ReconcilePath::AlreadyExisted => "already existed, left as is",
                };
                self.log(
                    job.id,
                    format!(
                        "Service {} {} (version {}, {} replicas)",
                        job.target_service_name,
                        verb,
                        outcome.state.version_index,
                        outcome.state.desired_replicas
                    ),
                );
                run.service_state = Some(outcome.state);
            }
            Err(e) => return self.fail(run, reconcile_failure_cause(&e), e.to_string()).await,
        }

        // Cancellation requested mid-reconcile is honored here
        if self.cancel_requested(job.id).await {
            return self
                .cancel(run, "Deployment cancelled after the service was updated, skipping networking and routing")
                .await;
        }
        self.advance(&mut run, JobEvent::Reconciled).await;

        // Networking
        if let Err(message) = self.ensure_networks(&mut run, &missing_networks).await {
            return self.fail(run, FailureCause::Network, message).await;
        }
        self.advance(&mut run, JobEvent::Networked).await;

        // Routing
        if job.domains.is_empty() {
            self.log(job.id, "No domains configured, routing unchanged");
        } else {
            match self
                .routing
                .apply(&job.target_service_name, &job.domains)
                .await
            {
                Ok(RoutingChange::Written) => self.log(
                    job.id,
                    format!("Routing updated for {} domains", job.domains.len()),
                ),
                Ok(RoutingChange::Unchanged) => self.log(job.id, "Routing already up to date"),
                Err(e) => return self.fail(run, FailureCause::Routing, e.to_string()).await,
            }
        }
        self.advance(&mut run, JobEvent::Routed).await;

        self.terminal(job.id, SUCCESS_MESSAGE);
        info!(
            "Deployment {} of {} succeeded in {:?}",
            job.id,
            job.target_service_name,
            run.started.elapsed()
        );
        self.report(run)
    }

    /// Declared networks that do not exist yet
    async fn missing_networks(&self, job: &DeploymentJob) -> Result<BTreeSet<String>, String> {
        let mut missing = BTreeSet::new();
        for network in &job.spec.networks {
            let exists = self
                .reconciler
                .orchestrator()
                .network_exists(network)
                .await
                .map_err(|e| format!("failed to look up network {}: {}", network, e))?;
            if !exists {
                missing.insert(network.clone());
            }
        }
        Ok(missing)
    }

    /// Ensure every declared network exists and attach the ones that were
    /// missing during reconciliation
    async fn ensure_networks(
        &self,
        run: &mut JobRun<'_>,
        missing: &BTreeSet<String>,
    ) -> Result<(), String> {
        let job = run.job;
        if job.spec.networks.is_empty() {
            self.log(job.id, "No networks declared");
            return Ok(());
        }

        for network in &job.spec.networks {
            let created = self
                .reconciler
                .ensure_network(network)
                .await
                .map_err(|e| format!("failed to ensure network {}: {}", network, e))?;
            let note = if created { "created" } else { "exists" };
            self.log(job.id, format!("Network {} {}", network, note));
        }

        if !missing.is_empty() {
            self.log(
                job.id,
                format!("Attaching {} to {} new networks", job.target_service_name, missing.len()),
            );
            let outcome = self
                .reconciler
                .reconcile_with(&job.spec, job.registry_auth.as_ref())
                .await
                .map_err(|e| format!("failed to attach networks: {}", e))?;
            run.service_state = Some(outcome.state);
        }
        Ok(())
    }

    async fn advance(&self, run: &mut JobRun<'_>, event: JobEvent) {
        match run.fsm.process(event) {
            Ok(state) => self.persist(run.job.id, state, None).await,
            Err(e) => error!("Job {}: {}", run.job.id, e),
        }
    }

    async fn fail(&self, mut run: JobRun<'_>, cause: FailureCause, message: String) -> PipelineReport {
        let failure = PipelineFailure::new(cause, message);
        warn!(
            "Deployment {} of {} failed: {}",
            run.job.id, run.job.target_service_name, failure
        );
        if let Err(e) = run.fsm.process(JobEvent::Fail(failure.clone())) {
            error!("Job {}: {}", run.job.id, e);
        }
        self.persist(run.job.id, JobState::Failed, Some(&failure)).await;
        self.terminal(run.job.id, failure.to_string());
        self.report(run)
    }

    async fn cancel(&self, mut run: JobRun<'_>, message: &str) -> PipelineReport {
        info!("Deployment {} of {} cancelled", run.job.id, run.job.target_service_name);
        if let Err(e) = run.fsm.process(JobEvent::Cancel) {
            error!("Job {}: {}", run.job.id, e);
        }
        self.persist(run.job.id, JobState::Cancelled, None).await;
        self.terminal(run.job.id, message);
        self.report(run)
    }

    fn report(&self, run: JobRun<'_>) -> PipelineReport {
        PipelineReport {
            job_id: run.job.id,
            service_name: run.job.target_service_name.clone(),
            state: run.fsm.state(),
            service_state: run.service_state,
            failure: run.fsm.failure().cloned(),
            elapsed: run.started.elapsed(),
        }
    }

    /// Record the stage on the job; the run goes on if the queue is down
    async fn persist(&self, job_id: Uuid, state: JobState, failure: Option<&PipelineFailure>) {
        if let Err(e) = self.queue.update_state(job_id, state, failure).await {
            warn!("Failed to record state {} of job {}: {}", state, job_id, e);
        }
    }

    fn log(&self, job_id: Uuid, message: impl Into<String>) {
        if let Err(e) = self.logs.emit(job_id, message) {
            warn!("{}", e);
        }
    }

    fn terminal(&self, job_id: Uuid, message: impl Into<String>) {
        if let Err(e) = self.logs.emit_terminal(job_id, message) {
            warn!("{}", e);
        }
    }

    async fn cancel_requested(&self, job_id: Uuid) -> bool {
        match self.queue.is_cancel_requested(job_id).await {
            Ok(requested) => requested,
            Err(e) => {
                warn!("Failed to read cancel flag of job {}: {}", job_id, e);
                false
            }
        }
    }

    /// Resolves once a cancel request for the job is seen
    async fn wait_for_cancel(&self, job_id: Uuid) {
        let mut interval = tokio::time::interval(self.cancel_poll);
        loop {
            interval.tick().await;
            if self.cancel_requested(job_id).await {
                return;
            }
        }
    }
}

/// Registry faults are pull failures; an unreachable or misbehaving
/// orchestrator is a reconcile failure whichever step hit it
fn reconcile_failure_cause(err: &ReconcileError) -> FailureCause {
    if err.is_image_pull() {
        FailureCause::ImagePull
    } else {
        FailureCause::Reconcile
    }
}
