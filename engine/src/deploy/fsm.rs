//! Finite State Machine for deployment jobs

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::job::JobStatus;

/// Pipeline stage of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    /// Waiting in the queue
    Queued,

    /// Making the image available on the node
    Pulling,

    /// Creating or updating the service
    Reconciling,

    /// Ensuring declared networks exist and are attached
    Networking,

    /// Writing reverse-proxy configuration
    Routing,

    Succeeded,

    Failed,

    Cancelled,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Pulling => "pulling",
            JobState::Reconciling => "reconciling",
            JobState::Networking => "networking",
            JobState::Routing => "routing",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed | JobState::Cancelled
        )
    }

    /// Whether a cancel request can still stop the job. `Reconciling`
    /// counts: the running step completes and the job stops before
    /// networking.
    pub fn is_cancellable(&self) -> bool {
        matches!(
            self,
            JobState::Queued | JobState::Pulling | JobState::Reconciling
        )
    }

    /// Coarse status reported to callers
    pub fn status(&self) -> JobStatus {
        match self {
            JobState::Queued => JobStatus::Queued,
            JobState::Pulling
            | JobState::Reconciling
            | JobState::Networking
            | JobState::Routing => JobStatus::Running,
            JobState::Succeeded => JobStatus::Succeeded,
            JobState::Failed => JobStatus::Failed,
            JobState::Cancelled => JobStatus::Cancelled,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure category shown to operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureCause {
    ImagePull,
    Reconcile,
    Network,
    Routing,
}

impl FailureCause {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureCause::ImagePull => "image-pull",
            FailureCause::Reconcile => "reconcile",
            FailureCause::Network => "network",
            FailureCause::Routing => "routing",
        }
    }
}

impl fmt::Display for FailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a job ended in `failed`
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("Deployment failed ({cause}): {message}")]
pub struct PipelineFailure {
    pub cause: FailureCause,
    pub message: String,
}

impl PipelineFailure {
    pub fn new(cause: FailureCause, message: impl Into<String>) -> Self {
        Self {
            cause,
            message: message.into(),
        }
    }
}

/// Job event
#[derive(Debug, Clone)]
pub enum JobEvent {
    /// Worker picked the job up
    Start,

    /// Image is present
    Pulled,

    /// Service converged
    Reconciled,

    /// Networks ensured
    Networked,

    /// Routing written
    Routed,

    Fail(PipelineFailure),

    Cancel,
}

/// Deployment job FSM
#[derive(Debug, Clone)]
pub struct JobFsm {
    state: JobState,
    failure: Option<PipelineFailure>,
}

impl JobFsm {
    /// Create a new FSM in queued state
    pub fn new() -> Self {
        Self {
            state: JobState::Queued,
            failure: None,
        }
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn failure(&self) -> Option<&PipelineFailure> {
        self.failure.as_ref()
    }

    /// Process an event and transition state
    pub fn process(&mut self, event: JobEvent) -> Result<JobState, String> {
        let new_state = match (self.state, &event) {
            (JobState::Queued, JobEvent::Start) => JobState::Pulling,
            (JobState::Pulling, JobEvent::Pulled) => JobState::Reconciling,
            (JobState::Reconciling, JobEvent::Reconciled) => JobState::Networking,
            (JobState::Networking, JobEvent::Networked) => JobState::Routing,
            (JobState::Routing, JobEvent::Routed) => JobState::Succeeded,

            (state, JobEvent::Fail(failure)) if !state.is_terminal() => {
                self.failure = Some(failure.clone());
                JobState::Failed
            }

            (state, JobEvent::Cancel) if state.is_cancellable() => JobState::Cancelled,

            (state, event) => {
                return Err(format!("Invalid transition: {:?} -> {:?}", state, event));
            }
        };

        self.state = new_state;
        Ok(new_state)
    }
}

impl Default for JobFsm {
    fn default() -> Self {
        Self::new()
    }
}
