//! Durable deployment job queue
//!
//! Delivery is at-least-once: a job is moved to a processing list when
//! consumed and only dropped from it by [`JobQueue::ack`]. Jobs left behind by
//! a crashed worker are put back with [`JobQueue::recover`].

pub mod connection;
pub mod memory;
pub mod redis;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use thiserror::Error;
use uuid::Uuid;

use crate::deploy::fsm::{JobState, PipelineFailure};
use crate::models::job::DeploymentJob;

pub use connection::{resolve_queue_connection, DeploymentMode, QueueConnection};

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("queue backend unavailable: {0}")]
    Unavailable(String),

    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),

    #[error("corrupt job record {id}: {source}")]
    Corrupt {
        id: String,
        source: serde_json::Error,
    },

    #[error("failed to encode job {0}")]
    Encode(#[from] serde_json::Error),

    #[error("job {0} not found")]
    NotFound(Uuid),
}

/// Job queue backend
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Store the job record and append it to the pending list
    async fn enqueue(&self, job: &DeploymentJob) -> Result<Uuid, QueueError>;

    /// Take the next pending job, waiting up to `timeout`
    async fn consume(&self, timeout: Duration) -> Result<Option<DeploymentJob>, QueueError>;

    /// Drop a consumed job from the processing list
    async fn ack(&self, job_id: Uuid) -> Result<(), QueueError>;

    /// Move unacknowledged jobs back to pending. Returns how many moved.
    async fn recover(&self) -> Result<usize, QueueError>;

    async fn job(&self, job_id: Uuid) -> Result<Option<DeploymentJob>, QueueError>;

    /// Persist a stage transition on the job record
    async fn update_state(
        &self,
        job_id: Uuid,
        stage: JobState,
        failure: Option<&PipelineFailure>,
    ) -> Result<(), QueueError>;

    /// Most recently enqueued job for a service name
    async fn latest_for_service(&self, service: &str)
        -> Result<Option<DeploymentJob>, QueueError>;

    async fn request_cancel(&self, job_id: Uuid) -> Result<(), QueueError>;

    async fn is_cancel_requested(&self, job_id: Uuid) -> Result<bool, QueueError>;
}

/// Endless stream of consumed jobs. Waits while the queue is empty and ends
/// after yielding the first backend error.
pub fn job_stream(
    queue: Arc<dyn JobQueue>,
    poll_timeout: Duration,
) -> BoxStream<'static, Result<DeploymentJob, QueueError>> {
    stream::unfold(Some(queue), move |state| async move {
        let queue = state?;
        loop {
            match queue.consume(poll_timeout).await {
                Ok(Some(job)) => return Some((Ok(job), Some(queue))),
                Ok(None) => continue,
                Err(e) => return Some((Err(e), None)),
            }
        }
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::job::{JobAction, ServiceKind};
    use crate::orchestrator::ServiceSpec;
    use crate::queue::memory::MemoryJobQueue;

    #[tokio::test]
    async fn test_job_stream_yields_in_order() {
        let queue = Arc::new(MemoryJobQueue::new());
        let mut ids = Vec::new();
        for name in ["a", "b"] {
            let job = DeploymentJob::new(
                ServiceKind::Application,
                JobAction::Deploy,
                ServiceSpec::new(name, "nginx:1.27"),
            );
            ids.push(queue.enqueue(&job).await.unwrap());
        }

        let mut jobs = job_stream(queue.clone(), Duration::from_millis(10));
        let first = jobs.next().await.unwrap().unwrap();
        let second = jobs.next().await.unwrap().unwrap();
        assert_eq!(vec![first.id, second.id], ids);
    }
}
