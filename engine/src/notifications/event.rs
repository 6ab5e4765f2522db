//! Notification events

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::deploy::fsm::PipelineFailure;

/// What happened
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NotificationKind {
    ServerRestarted,
    DeploymentSucceeded,
    DeploymentFailed,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::ServerRestarted => "server-restarted",
            NotificationKind::DeploymentSucceeded => "deployment-succeeded",
            NotificationKind::DeploymentFailed => "deployment-failed",
        }
    }

    /// Headline shown by every channel
    pub fn title(&self) -> &'static str {
        match self {
            NotificationKind::ServerRestarted => "Empaas Server Restarted",
            NotificationKind::DeploymentSucceeded => "Deployment Succeeded",
            NotificationKind::DeploymentFailed => "Deployment Failed",
        }
    }

    pub fn is_success(&self) -> bool {
        !matches!(self, NotificationKind::DeploymentFailed)
    }
}

pub const FIELD_SERVICE: &str = "service";
pub const FIELD_JOB_ID: &str = "jobId";
pub const FIELD_CATEGORY: &str = "category";
pub const FIELD_REASON: &str = "reason";

/// Event handed to every matching channel. Built at the trigger site and
/// never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NotificationEvent {
    pub kind: NotificationKind,
    pub timestamp: DateTime<Utc>,
    pub context: BTreeMap<String, String>,
}

impl NotificationEvent {
    pub fn new(kind: NotificationKind) -> Self {
        Self {
            kind,
            timestamp: Utc::now(),
            context: BTreeMap::new(),
        }
    }

    pub fn with(mut self, key: &str, value: impl Into<String>) -> Self {
        self.context.insert(key.to_string(), value.into());
        self
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn server_restarted() -> Self {
        Self::new(NotificationKind::ServerRestarted)
    }

    pub fn deployment_succeeded(service: &str, job_id: Uuid) -> Self {
        Self::new(NotificationKind::DeploymentSucceeded)
            .with(FIELD_SERVICE, service)
            .with(FIELD_JOB_ID, job_id.to_string())
    }

    pub fn deployment_failed(service: &str, job_id: Uuid, failure: &PipelineFailure) -> Self {
        Self::new(NotificationKind::DeploymentFailed)
            .with(FIELD_SERVICE, service)
            .with(FIELD_JOB_ID, job_id.to_string())
            .with(FIELD_CATEGORY, failure.cause.as_str())
            .with(FIELD_REASON, failure.message.clone())
    }

    pub fn title(&self) -> &'static str {
        self.kind.title()
    }

    pub fn field(&self, key: &str) -> Option<&str> {
        self.context.get(key).map(String::as_str)
    }

    pub fn service(&self) -> Option<&str> {
        self.field(FIELD_SERVICE)
    }

    /// `<category>: <reason>` for failures
    pub fn reason(&self) -> Option<String> {
        let reason = self.field(FIELD_REASON)?;
        Some(match self.field(FIELD_CATEGORY) {
            Some(category) => format!("{}: {}", category, reason),
            None => reason.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deploy::fsm::FailureCause;

    #[test]
    fn test_kind_wire_names() {
        assert_eq!(
            serde_json::to_string(&NotificationKind::ServerRestarted).unwrap(),
            "\"server-restarted\""
        );
        let kind: NotificationKind = serde_json::from_str("\"deployment-failed\"").unwrap();
        assert_eq!(kind, NotificationKind::DeploymentFailed);
    }

    #[test]
    fn test_failed_event_context() {
        let job_id = Uuid::new_v4();
        let event = NotificationEvent::deployment_failed(
            "web",
            job_id,
            &PipelineFailure::new(FailureCause::Routing, "disk full"),
        );
        assert_eq!(event.title(), "Deployment Failed");
        assert_eq!(event.service(), Some("web"));
        assert_eq!(event.reason().as_deref(), Some("routing: disk full"));
        assert!(!event.kind.is_success());
    }
}
