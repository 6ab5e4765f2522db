//! Queue connection target

use serde::{Deserialize, Serialize};

pub const DEFAULT_QUEUE_PORT: u16 = 6379;
pub const PRODUCTION_QUEUE_HOST: &str = "empaas-redis";
pub const LOCAL_QUEUE_HOST: &str = "127.0.0.1";

/// Deployment mode of the engine
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentMode {
    #[default]
    Development,
    Production,
}

impl DeploymentMode {
    /// Parse a `NODE_ENV`-style value, anything but production is development
    pub fn from_env_value(value: &str) -> Self {
        if value.trim().eq_ignore_ascii_case("production") {
            DeploymentMode::Production
        } else {
            DeploymentMode::Development
        }
    }

    pub fn is_production(&self) -> bool {
        matches!(self, DeploymentMode::Production)
    }
}

/// Resolved host and port of the queue backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConnection {
    pub host: String,
    pub port: u16,
}

impl QueueConnection {
    pub fn url(&self) -> String {
        format!("redis://{}:{}/", self.host, self.port)
    }
}

/// Production resolves the named host (overridable), everything else the
/// loopback address
pub fn resolve_queue_connection(
    mode: DeploymentMode,
    host_override: Option<&str>,
    port: Option<u16>,
) -> QueueConnection {
    let host = match mode {
        DeploymentMode::Production => host_override
            .filter(|h| !h.trim().is_empty())
            .unwrap_or(PRODUCTION_QUEUE_HOST),
        DeploymentMode::Development => LOCAL_QUEUE_HOST,
    };
    QueueConnection {
        host: host.to_string(),
        port: port.unwrap_or(DEFAULT_QUEUE_PORT),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_production_uses_named_host() {
        let conn = resolve_queue_connection(DeploymentMode::Production, None, None);
        assert_eq!(conn.host, "empaas-redis");
        assert_eq!(conn.port, 6379);
        assert_eq!(conn.url(), "redis://empaas-redis:6379/");
    }

    #[test]
    fn test_production_host_override() {
        let conn = resolve_queue_connection(DeploymentMode::Production, Some("redis.internal"), None);
        assert_eq!(conn.host, "redis.internal");

        let blank = resolve_queue_connection(DeploymentMode::Production, Some(" "), None);
        assert_eq!(blank.host, "empaas-redis");
    }

    #[test]
    fn test_development_uses_loopback() {
        let conn = resolve_queue_connection(DeploymentMode::Development, Some("redis.internal"), Some(6380));
        assert_eq!(conn.host, "127.0.0.1");
        assert_eq!(conn.port, 6380);
    }

    #[test]
    fn test_mode_from_env_value() {
        assert_eq!(DeploymentMode::from_env_value("production"), DeploymentMode::Production);
        assert_eq!(DeploymentMode::from_env_value("PRODUCTION "), DeploymentMode::Production);
        assert_eq!(DeploymentMode::from_env_value("test"), DeploymentMode::Development);
    }
}
