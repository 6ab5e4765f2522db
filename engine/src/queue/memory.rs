//! In-process job queue
//!
//! Same delivery contract as the Redis backend without durability across
//! restarts. Used for development runs and tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::deploy::fsm::{JobState, PipelineFailure};
use crate::models::job::DeploymentJob;
use crate::queue::{JobQueue, QueueError};

#[derive(Default)]
struct Inner {
    pending: VecDeque<Uuid>,
    processing: Vec<Uuid>,
    jobs: HashMap<Uuid, DeploymentJob>,
    latest: HashMap<String, Uuid>,
    cancelled: HashSet<Uuid>,
    unavailable: bool,
}

#[derive(Default)]
pub struct MemoryJobQueue {
    inner: Mutex<Inner>,
    available: Notify,
}

impl MemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail as if the backend went away
    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
        self.available.notify_waiters();
    }

    /// Ids consumed but not yet acknowledged
    pub fn processing(&self) -> Vec<Uuid> {
        self.lock().processing.clone()
    }

    pub fn pending_len(&self) -> usize {
        self.lock().pending.len()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check(inner: &Inner) -> Result<(), QueueError> {
        if inner.unavailable {
            return Err(QueueError::Unavailable("in-memory queue marked unavailable".to_string()));
        }
        Ok(())
    }

    fn try_take(&self) -> Result<Option<DeploymentJob>, QueueError> {
        let mut inner = self.lock();
        Self::check(&inner)?;
        while let Some(id) = inner.pending.pop_front() {
            if let Some(job) = inner.jobs.get(&id).cloned() {
                inner.processing.push(id);
                return Ok(Some(job));
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    async fn enqueue(&self, job: &DeploymentJob) -> Result<Uuid, QueueError> {
        {
            let mut inner = self.lock();
            Self::check(&inner)?;
            inner.jobs.insert(job.id, job.clone());
            inner.latest.insert(job.target_service_name.clone(), job.id);
            inner.pending.push_back(job.id);
        }
        self.available.notify_one();
        Ok(job.id)
    }

    async fn consume(&self, timeout: Duration) -> Result<Option<DeploymentJob>, QueueError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.available.notified();
            if let Some(job) = self.try_take()? {
                return Ok(Some(job));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.try_take();
            }
        }
    }

    async fn ack(&self, job_id: Uuid) -> Result<(), QueueError> {
        let mut inner = self.lock();
        Self::check(&inner)?;
        inner.processing.retain(|id| *id != job_id);
        inner.cancelled.remove(&job_id);
        Ok(())
    }

    async fn recover(&self) -> Result<usize, QueueError> {
        let recovered = {
            let mut inner = self.lock();
            Self::check(&inner)?;
            let stranded: Vec<Uuid> = inner.processing.drain(..).collect();
            for id in stranded.iter().rev() {
                inner.pending.push_front(*id);
            }
            stranded.len()
        };
        if recovered > 0 {
            self.available.notify_waiters();
        }
        Ok(recovered)
    }

    async fn job(&self, job_id: Uuid) -> Result<Option<DeploymentJob>, QueueError> {
        let inner = self.lock();
        Self::check(&inner)?;
        Ok(inner.jobs.get(&job_id).cloned())
    }

    async fn update_state(
        &self,
        job_id: Uuid,
        stage: JobState,
        failure: Option<&PipelineFailure>,
    ) -> Result<(), QueueError> {
        let mut inner = self.lock();
        Self::check(&inner)?;
        let job = inner
            .jobs
            .get_mut(&job_id)
            .ok_or(QueueError::NotFound(job_id))?;
        job.set_stage(stage, failure.cloned());
        Ok(())
    }

    async fn latest_for_service(
        &self,
        service: &str,
    ) -> Result<Option<DeploymentJob>, QueueError> {
        let inner = self.lock();
        Self::check(&inner)?;
        Ok(inner
            .latest
            .get(service)
            .and_then(|id| inner.jobs.get(id))
            .cloned())
    }

    async fn request_cancel(&self, job_id: Uuid) -> Result<(), QueueError> {
        let mut inner = self.lock();
        Self::check(&inner)?;
        inner.cancelled.insert(job_id);
        Ok(())
    }

    async fn is_cancel_requested(&self, job_id: Uuid) -> Result<bool, QueueError> {
        let inner = self.lock();
        Self::check(&inner)?;
        Ok(inner.cancelled.contains(&job_id))
    }
}
