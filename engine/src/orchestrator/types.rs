//! Desired and live service models

use std::collections::BTreeSet;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize, Serializer};

use crate::errors::EngineError;

/// Mount kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MountType {
    Volume,
    Bind,
}

impl MountType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MountType::Volume => "volume",
            MountType::Bind => "bind",
        }
    }
}

/// Volume or bind mount attached to the service's containers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mount {
    #[serde(rename = "type")]
    pub mount_type: MountType,
    pub source: String,
    pub target: String,
}

/// Port protocol
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortProtocol {
    #[default]
    Tcp,
    Udp,
    Sctp,
}

impl PortProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            PortProtocol::Tcp => "tcp",
            PortProtocol::Udp => "udp",
            PortProtocol::Sctp => "sctp",
        }
    }
}

/// Publish mode of a port
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PublishMode {
    #[default]
    Ingress,
    Host,
}

impl PublishMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PublishMode::Ingress => "ingress",
            PublishMode::Host => "host",
        }
    }
}

/// A port published on the swarm nodes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishedPort {
    pub target: u16,
    pub published: u16,
    #[serde(default)]
    pub protocol: PortProtocol,
    #[serde(default)]
    pub mode: PublishMode,
}

/// Desired state of a long-running service.
///
/// Updates are full-replace: every field is resupplied on every update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceSpec {
    /// Globally unique service name; reconciliation is keyed on it
    pub name: String,

    /// Image reference, e.g. `postgres:16`
    pub image: String,

    /// `KEY=value` entries, order preserved
    #[serde(default)]
    pub environment_variables: Vec<String>,

    #[serde(default)]
    pub mounts: Vec<Mount>,

    #[serde(default)]
    pub networks: BTreeSet<String>,

    /// Predicates such as `node.role==manager`
    #[serde(default)]
    pub placement_constraints: BTreeSet<String>,

    #[serde(default = "default_replicas")]
    pub replicas: u64,

    #[serde(default)]
    pub published_ports: Vec<PublishedPort>,
}

fn default_replicas() -> u64 {
    1
}

impl ServiceSpec {
    /// Spec with a name and an image and defaults for everything else
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            environment_variables: Vec::new(),
            mounts: Vec::new(),
            networks: BTreeSet::new(),
            placement_constraints: BTreeSet::new(),
            replicas: 1,
            published_ports: Vec::new(),
        }
    }

    /// Reject a service spec the orchestrator would refuse
    pub fn validate(&self) -> Result<(), EngineError> {
        if !is_valid_service_name(&self.name) {
            return Err(EngineError::ValidationError(format!(
                "invalid service name '{}': use letters, digits, '-', '_' or '.'",
                self.name
            )));
        }
        if self.image.trim().is_empty() {
            return Err(EngineError::ValidationError(format!(
                "service '{}' has no image",
                self.name
            )));
        }
        if self.replicas == 0 {
            return Err(EngineError::ValidationError(format!(
                "service '{}' must run at least one replica",
                self.name
            )));
        }
        if let Some(entry) = self
            .environment_variables
            .iter()
            .find(|entry| !entry.contains('=') || entry.starts_with('='))
        {
            return Err(EngineError::ValidationError(format!(
                "environment entry '{}' is not KEY=value",
                entry
            )));
        }
        let mut targets = BTreeSet::new();
        for mount in &self.mounts {
            if !targets.insert(mount.target.as_str()) {
                return Err(EngineError::ValidationError(format!(
                    "mount target '{}' is used twice",
                    mount.target
                )));
            }
        }
        Ok(())
    }

    /// Copy of this spec running `replicas` replicas
    pub fn with_replicas(&self, replicas: u64) -> Self {
        Self {
            replicas,
            ..self.clone()
        }
    }
}

/// Names are used in URLs, DNS and file names, so the charset is restricted
pub fn is_valid_service_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 63
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
        && !name.starts_with(['-', '.'])
}

/// The orchestrator's live view of a service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceState {
    pub name: String,

    /// Optimistic concurrency token; must be echoed on update
    pub version_index: u64,

    pub image: String,

    pub desired_replicas: u64,

    pub current_replicas: u64,

    pub last_task_status: Option<String>,
}

/// Registry credentials forwarded on image pulls
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryAuth {
    pub username: String,
    #[serde(serialize_with = "expose_secret")]
    pub password: SecretString,
    pub server_address: String,
}

/// Serializer for secrets that have to be persisted
pub(crate) fn expose_secret<S: Serializer>(
    secret: &SecretString,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(secret.expose_secret())
}

/// Split an image reference into repository and tag (or digest)
pub fn split_image_reference(image: &str) -> (&str, Option<&str>) {
    if image.contains('@') {
        return (image, None);
    }
    let last_slash = image.rfind('/').map(|i| i + 1).unwrap_or(0);
    match image[last_slash..].rfind(':') {
        Some(pos) => {
            let split = last_slash + pos;
            (&image[..split], Some(&image[split + 1..]))
        }
        None => (image, None),
    }
}
