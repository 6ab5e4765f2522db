//! Deployment job models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::deploy::fsm::{JobState, PipelineFailure};
use crate::orchestrator::{RegistryAuth, ServiceSpec};
use crate::routing::Domain;

/// What kind of workload a service is
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceKind {
    #[default]
    Application,
    Compose,
    Postgres,
    Redis,
    Mongo,
    Libsql,
}

impl ServiceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceKind::Application => "application",
            ServiceKind::Compose => "compose",
            ServiceKind::Postgres => "postgres",
            ServiceKind::Redis => "redis",
            ServiceKind::Mongo => "mongo",
            ServiceKind::Libsql => "libsql",
        }
    }
}

/// Coarse job status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

/// Intent that produced the job
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobAction {
    #[default]
    Deploy,
    Redeploy,
}

/// A queued deployment of one service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentJob {
    pub id: Uuid,

    pub target_service_name: String,

    #[serde(default)]
    pub kind: ServiceKind,

    #[serde(default)]
    pub action: JobAction,

    /// Spec snapshot taken when the job was requested
    pub spec: ServiceSpec,

    /// Public endpoints routed to the service
    #[serde(default)]
    pub domains: Vec<Domain>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registry_auth: Option<RegistryAuth>,

    pub requested_at: DateTime<Utc>,

    pub status: JobStatus,

    /// Last pipeline stage reached
    pub stage: JobState,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<PipelineFailure>,
}

impl DeploymentJob {
    pub fn new(kind: ServiceKind, action: JobAction, spec: ServiceSpec) -> Self {
        Self {
            id: Uuid::new_v4(),
            target_service_name: spec.name.clone(),
            kind,
            action,
            spec,
            domains: Vec::new(),
            registry_auth: None,
            requested_at: Utc::now(),
            status: JobStatus::Queued,
            stage: JobState::Queued,
            failure: None,
        }
    }

    pub fn with_domains(mut self, domains: Vec<Domain>) -> Self {
        self.domains = domains;
        self
    }

    pub fn with_registry_auth(mut self, auth: Option<RegistryAuth>) -> Self {
        self.registry_auth = auth;
        self
    }

    /// Fresh job re-running this job's spec
    pub fn rerun(&self) -> Self {
        Self::new(self.kind, JobAction::Redeploy, self.spec.clone())
            .with_domains(self.domains.clone())
            .with_registry_auth(self.registry_auth.clone())
    }

    /// Record a stage transition
    pub fn set_stage(&mut self, stage: JobState, failure: Option<PipelineFailure>) {
        self.stage = stage;
        self.status = stage.status();
        if failure.is_some() {
            self.failure = failure;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deploy::fsm::FailureCause;

    #[test]
    fn test_new_job_is_queued() {
        let job = DeploymentJob::new(
            ServiceKind::Postgres,
            JobAction::Deploy,
            ServiceSpec::new("empaas-postgres", "postgres:16"),
        );
        assert_eq!(job.target_service_name, "empaas-postgres");
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.stage, JobState::Queued);
    }

    #[test]
    fn test_rerun_gets_new_id() {
        let job = DeploymentJob::new(
            ServiceKind::Application,
            JobAction::Deploy,
            ServiceSpec::new("web", "nginx:1.27"),
        );
        let rerun = job.rerun();
        assert_ne!(rerun.id, job.id);
        assert_eq!(rerun.action, JobAction::Redeploy);
        assert_eq!(rerun.spec, job.spec);
    }

    #[test]
    fn test_job_json_shape() {
        let mut job = DeploymentJob::new(
            ServiceKind::Redis,
            JobAction::Deploy,
            ServiceSpec::new("cache", "redis:7"),
        );
        job.set_stage(
            JobState::Failed,
            Some(PipelineFailure::new(FailureCause::Reconcile, "rejected")),
        );

        let value = serde_json::to_value(&job).unwrap();
        assert_eq!(value["status"], "failed");
        assert_eq!(value["stage"], "failed");
        assert_eq!(value["kind"], "redis");
        assert_eq!(value["failure"]["cause"], "reconcile");

        let back: DeploymentJob = serde_json::from_value(value).unwrap();
        assert_eq!(back.id, job.id);
        assert_eq!(back.failure, job.failure);
    }
}
