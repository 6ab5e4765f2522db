//! Deployment worker consuming the job queue

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tracing::{debug, error, info, warn};

use crate::deploy::fsm::JobState;
use crate::deploy::pipeline::{Pipeline, PipelineReport};
use crate::models::job::DeploymentJob;
use crate::notifications::{Dispatcher, NotificationEvent};
use crate::queue::{job_stream, JobQueue, QueueError};

/// Deployer worker options
#[derive(Debug, Clone)]
pub struct Options {
    /// Worker number, for logs
    pub worker_id: usize,

    /// Blocking consume timeout
    pub consume_timeout: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            worker_id: 0,
            consume_timeout: Duration::from_secs(5),
        }
    }
}

/// Consume jobs until shutdown. Returns the queue error that stopped the
/// worker, the caller decides whether the process survives it.
pub async fn run(
    options: &Options,
    queue: Arc<dyn JobQueue>,
    pipeline: Arc<Pipeline>,
    dispatcher: Arc<Dispatcher>,
    mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
) -> Result<(), QueueError> {
    info!("Deployer worker {} starting...", options.worker_id);

    let mut jobs = job_stream(queue.clone(), options.consume_timeout);
    loop {
        let next = tokio::select! {
            _ = &mut shutdown_signal => {
                info!("Deployer worker {} shutting down...", options.worker_id);
                return Ok(());
            }
            next = jobs.next() => next,
        };

        match next {
            Some(Ok(job)) => {
                debug!("Worker {} picked up job {}", options.worker_id, job.id);
                execute(&job, queue.as_ref(), &pipeline, &dispatcher).await;
            }
            Some(Err(e)) => {
                error!("Deployer worker {} lost the job queue: {}", options.worker_id, e);
                return Err(e);
            }
            None => return Ok(()),
        }
    }
}

/// Run one job to completion, acknowledge it and notify
pub async fn execute(
    job: &DeploymentJob,
    queue: &dyn JobQueue,
    pipeline: &Pipeline,
    dispatcher: &Dispatcher,
) -> PipelineReport {
    let report = pipeline.run(job).await;

    // An unacknowledged job is redelivered after a restart
    if let Err(e) = queue.ack(job.id).await {
        warn!("Failed to acknowledge job {}: {}", job.id, e);
    }

    if let Some(event) = notification_for(&report) {
        let summary = dispatcher.dispatch(&event).await;
        debug!(
            "Notified {} of {} channels about job {}",
            summary.delivered, summary.matched, job.id
        );
    }
    report
}

/// Cancelled jobs are not announced
fn notification_for(report: &PipelineReport) -> Option<NotificationEvent> {
    match (report.state, &report.failure) {
        (JobState::Succeeded, _) => Some(NotificationEvent::deployment_succeeded(
            &report.service_name,
            report.job_id,
        )),
        (JobState::Failed, Some(failure)) => Some(NotificationEvent::deployment_failed(
            &report.service_name,
            report.job_id,
            failure,
        )),
        _ => None,
    }
}
