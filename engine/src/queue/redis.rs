//! Redis-backed job queue
//!
//! Key layout under the prefix (default `empaas:deployments`):
//! `:pending` and `:processing` lists of job ids, `:jobs` hash of job records,
//! `:latest` hash of service name to newest job id, `:cancel:<id>` flags.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Client;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::deploy::fsm::{JobState, PipelineFailure};
use crate::models::job::DeploymentJob;
use crate::queue::{JobQueue, QueueError};

pub const DEFAULT_KEY_PREFIX: &str = "empaas:deployments";

/// Cancel flags outlive any realistic job
const CANCEL_FLAG_TTL_SECS: u64 = 24 * 60 * 60;

/// Key names derived from the prefix
#[derive(Debug, Clone)]
pub struct QueueKeys {
    prefix: String,
}

impl QueueKeys {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn pending(&self) -> String {
        format!("{}:pending", self.prefix)
    }

    pub fn processing(&self) -> String {
        format!("{}:processing", self.prefix)
    }

    pub fn jobs(&self) -> String {
        format!("{}:jobs", self.prefix)
    }

    pub fn latest(&self) -> String {
        format!("{}:latest", self.prefix)
    }

    pub fn cancel(&self, job_id: Uuid) -> String {
        format!("{}:cancel:{}", self.prefix, job_id)
    }
}

impl Default for QueueKeys {
    fn default() -> Self {
        Self::new(DEFAULT_KEY_PREFIX)
    }
}

pub struct RedisJobQueue {
    /// Short commands
    conn: ConnectionManager,

    /// Blocking pops, kept apart so they never stall other commands
    blocking: ConnectionManager,

    keys: QueueKeys,
}

impl RedisJobQueue {
    /// Connect both connections; fails fast when the server is unreachable
    pub async fn connect(url: &str, keys: QueueKeys) -> Result<Self, QueueError> {
        let client = Client::open(url)?;
        let conn = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| QueueError::Unavailable(format!("{}: {}", url, e)))?;
        let blocking = ConnectionManager::new(client)
            .await
            .map_err(|e| QueueError::Unavailable(format!("{}: {}", url, e)))?;

        let mut ping = conn.clone();
        let pong: String = redis::cmd("PING").query_async(&mut ping).await?;
        debug!("Queue backend answered {}", pong);
        info!("Connected to job queue at {}", url);

        Ok(Self {
            conn,
            blocking,
            keys,
        })
    }

    pub fn keys(&self) -> &QueueKeys {
        &self.keys
    }

    async fn load(&self, id: &str) -> Result<Option<DeploymentJob>, QueueError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = redis::cmd("HGET")
            .arg(self.keys.jobs())
            .arg(id)
            .query_async(&mut conn)
            .await?;
        raw.map(|raw| {
            serde_json::from_str(&raw).map_err(|source| QueueError::Corrupt {
                id: id.to_string(),
                source,
            })
        })
        .transpose()
    }

    async fn store(&self, job: &DeploymentJob) -> Result<(), QueueError> {
        let record = serde_json::to_string(job)?;
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("HSET")
            .arg(self.keys.jobs())
            .arg(job.id.to_string())
            .arg(record)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl JobQueue for RedisJobQueue {
    async fn enqueue(&self, job: &DeploymentJob) -> Result<Uuid, QueueError> {
        let record = serde_json::to_string(job)?;
        let id = job.id.to_string();
        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .atomic()
            .cmd("HSET")
            .arg(self.keys.jobs())
            .arg(&id)
            .arg(record)
            .ignore()
            .cmd("HSET")
            .arg(self.keys.latest())
            .arg(&job.target_service_name)
            .arg(&id)
            .ignore()
            .cmd("LPUSH")
            .arg(self.keys.pending())
            .arg(&id)
            .ignore()
            .query_async(&mut conn)
            .await?;
        debug!("Enqueued job {} for {}", id, job.target_service_name);
        Ok(job.id)
    }

    async fn consume(&self, timeout: Duration) -> Result<Option<DeploymentJob>, QueueError> {
        let mut blocking = self.blocking.clone();
        let id: Option<String> = redis::cmd("BLMOVE")
            .arg(self.keys.pending())
            .arg(self.keys.processing())
            .arg("RIGHT")
            .arg("LEFT")
            .arg(timeout.as_secs_f64())
            .query_async(&mut blocking)
            .await?;
        let Some(id) = id else {
            return Ok(None);
        };

        match self.load(&id).await {
            Ok(Some(job)) => Ok(Some(job)),
            Ok(None) => {
                warn!("Job {} has no record, dropping it", id);
                let mut conn = self.conn.clone();
                let _: i64 = redis::cmd("LREM")
                    .arg(self.keys.processing())
                    .arg(0)
                    .arg(&id)
                    .query_async(&mut conn)
                    .await?;
                Ok(None)
            }
            Err(QueueError::Corrupt { id, source }) => {
                warn!("Job {} record is corrupt ({}), dropping it", id, source);
                let mut conn = self.conn.clone();
                let _: i64 = redis::cmd("LREM")
                    .arg(self.keys.processing())
                    .arg(0)
                    .arg(&id)
                    .query_async(&mut conn)
                    .await?;
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn ack(&self, job_id: Uuid) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .cmd("LREM")
            .arg(self.keys.processing())
            .arg(0)
            .arg(job_id.to_string())
            .ignore()
            .cmd("DEL")
            .arg(self.keys.cancel(job_id))
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn recover(&self) -> Result<usize, QueueError> {
        let mut conn = self.conn.clone();
        let mut moved = 0;
        loop {
            // Newest first onto the consuming end keeps the oldest next in line
            let id: Option<String> = redis::cmd("LMOVE")
                .arg(self.keys.processing())
                .arg(self.keys.pending())
                .arg("LEFT")
                .arg("RIGHT")
                .query_async(&mut conn)
                .await?;
            match id {
                Some(id) => {
                    debug!("Requeued unacknowledged job {}", id);
                    moved += 1;
                }
                None => break,
            }
        }
        if moved > 0 {
            info!("Recovered {} unacknowledged jobs", moved);
        }
        Ok(moved)
    }

    async fn job(&self, job_id: Uuid) -> Result<Option<DeploymentJob>, QueueError> {
        self.load(&job_id.to_string()).await
    }

    async fn update_state(
        &self,
        job_id: Uuid,
        stage: JobState,
        failure: Option<&PipelineFailure>,
    ) -> Result<(), QueueError> {
        let mut job = self
            .load(&job_id.to_string())
            .await?
            .ok_or(QueueError::NotFound(job_id))?;
        job.set_stage(stage, failure.cloned());
        self.store(&job).await
    }

    async fn latest_for_service(
        &self,
        service: &str,
    ) -> Result<Option<DeploymentJob>, QueueError> {
        let mut conn = self.conn.clone();
        let id: Option<String> = redis::cmd("HGET")
            .arg(self.keys.latest())
            .arg(service)
            .query_async(&mut conn)
            .await?;
        match id {
            Some(id) => self.load(&id).await,
            None => Ok(None),
        }
    }

    async fn request_cancel(&self, job_id: Uuid) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SET")
            .arg(self.keys.cancel(job_id))
            .arg(1)
            .arg("EX")
            .arg(CANCEL_FLAG_TTL_SECS)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn is_cancel_requested(&self, job_id: Uuid) -> Result<bool, QueueError> {
        let mut conn = self.conn.clone();
        let exists: bool = redis::cmd("EXISTS")
            .arg(self.keys.cancel(job_id))
            .query_async(&mut conn)
            .await?;
        Ok(exists)
    }
}
