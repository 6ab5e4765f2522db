//! Engine API models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Health response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
}

/// Version response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionResponse {
    pub version: String,
    pub git_hash: String,
    pub build_time: String,
}

/// Error body returned by every failing endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Response to a queued deploy/redeploy intent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnqueuedResponse {
    pub job_id: Uuid,
    pub service_name: String,
    pub status: String,
}

/// Response to an immediate start/stop/reload intent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlResponse {
    pub service_name: String,
    pub action: String,
    pub replicas: u64,
    pub version_index: u64,
}

/// Deployment job view
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResponse {
    pub id: Uuid,
    pub service_name: String,
    pub service_kind: String,
    pub status: String,
    pub stage: String,
    pub requested_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

/// Cancellation outcome
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelResponse {
    pub job_id: Uuid,
    pub cancelled: bool,
    pub message: String,
}

/// One log line of a deployment job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEventView {
    pub job_id: Uuid,
    pub sequence_number: u64,
    pub timestamp: DateTime<Utc>,
    pub message: String,
    pub is_terminal: bool,
}
