//! Settings file management

use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::deploy::reconciler::RetryPolicy;
use crate::errors::EngineError;
use crate::filesys::file::File;
use crate::logs::LogLevel;
use crate::queue::redis::DEFAULT_KEY_PREFIX;
use crate::queue::{resolve_queue_connection, DeploymentMode, QueueConnection};

/// Engine settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Log level
    pub log_level: LogLevel,

    /// Emit JSON log lines on stdout
    pub log_json: bool,

    /// Directory for rolling log files
    pub log_dir: Option<PathBuf>,

    pub mode: DeploymentMode,

    /// Job queue backend
    pub queue: QueueSettings,

    /// Docker Engine API
    pub docker: DockerSettings,

    /// Reverse proxy
    pub traefik: TraefikSettings,

    /// Local HTTP server
    pub server: ServerSettings,

    /// Deployment workers
    pub worker: WorkerSettings,

    /// Notification channels file, `notifications.json` in the base dir when unset
    pub notifications_file: Option<PathBuf>,

    /// Version-conflict retries
    pub reconcile: RetryPolicy,

    /// Managed Postgres created by `--setup`
    pub postgres: PostgresSettings,
}

/// Queue backend settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    /// Host used in production, `empaas-redis` when unset
    pub host: Option<String>,

    pub port: u16,

    pub key_prefix: String,

    /// Blocking consume timeout, bounds how long shutdown waits on a worker
    pub consume_timeout_secs: u64,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            host: None,
            port: 6379,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            consume_timeout_secs: 5,
        }
    }
}

impl QueueSettings {
    pub fn consume_timeout(&self) -> Duration {
        Duration::from_secs(self.consume_timeout_secs.max(1))
    }
}

/// Docker Engine API settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DockerSettings {
    /// Engine API base URL, `tcp://` is accepted
    pub api_url: String,

    pub timeout_secs: u64,
}

impl Default for DockerSettings {
    fn default() -> Self {
        Self {
            api_url: "http://127.0.0.1:2375".to_string(),
            timeout_secs: 60,
        }
    }
}

impl DockerSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Traefik settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TraefikSettings {
    /// Host directory holding `traefik.yml` and `dynamic/`
    pub config_dir: PathBuf,

    /// Where `config_dir` is mounted inside the Traefik container
    pub container_config_dir: String,

    pub image: String,

    /// ACME account email for the default certificate resolver
    pub acme_email: Option<String>,
}

impl Default for TraefikSettings {
    fn default() -> Self {
        Self {
            config_dir: PathBuf::from("/etc/empaas/traefik"),
            container_config_dir: "/etc/traefik".to_string(),
            image: "traefik:v3.5.0".to_string(),
            acme_email: None,
        }
    }
}

impl TraefikSettings {
    /// Per-service dynamic configuration directory
    pub fn dynamic_dir(&self) -> PathBuf {
        self.config_dir.join("dynamic")
    }
}

/// Local HTTP server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "127.0.0.1".to_string(),
            port: 3030,
        }
    }
}

/// Deployment worker settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    /// Jobs run concurrently, one per worker
    pub concurrency: usize,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self { concurrency: 1 }
    }
}

/// Managed Postgres settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PostgresSettings {
    pub user: String,
    pub database: String,

    /// Falls back to `EMPAAS_POSTGRES_PASSWORD`
    #[serde(skip_serializing)]
    pub password: Option<SecretString>,
}

impl Default for PostgresSettings {
    fn default() -> Self {
        Self {
            user: "empaas".to_string(),
            database: "empaas".to_string(),
            password: None,
        }
    }
}

impl Settings {
    /// Apply environment overrides read through `var`
    pub fn apply_env_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(mode) = var("EMPAAS_ENV").or_else(|| var("NODE_ENV")) {
            self.mode = DeploymentMode::from_env_value(&mode);
        }
        if let Some(host) = var("REDIS_HOST").filter(|h| !h.trim().is_empty()) {
            self.queue.host = Some(host);
        }
        if let Some(docker) = var("DOCKER_HOST").filter(|h| !h.trim().is_empty()) {
            self.docker.api_url = docker;
        }
        if self.postgres.password.is_none() {
            self.postgres.password = var("EMPAAS_POSTGRES_PASSWORD")
                .filter(|p| !p.is_empty())
                .map(SecretString::from);
        }
    }

    /// Queue target for the configured mode
    pub fn queue_connection(&self) -> QueueConnection {
        resolve_queue_connection(self.mode, self.queue.host.as_deref(), Some(self.queue.port))
    }
}

/// Read the settings file, defaults when it does not exist
pub async fn load_settings(file: &File) -> Result<Settings, EngineError> {
    match file.read_bytes_opt().await? {
        Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
        None => {
            warn!(
                "No settings file at {}, using defaults",
                file.path().display()
            );
            Ok(Settings::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let settings: Settings =
            serde_json::from_str(r#"{ "log_level": "debug", "queue": { "port": 6380 } }"#).unwrap();
        assert_eq!(settings.log_level, LogLevel::Debug);
        assert_eq!(settings.queue.port, 6380);
        assert_eq!(settings.queue.key_prefix, DEFAULT_KEY_PREFIX);
        assert_eq!(settings.reconcile.max_attempts, 3);
        assert_eq!(settings.worker.concurrency, 1);
        assert_eq!(settings.mode, DeploymentMode::Development);
    }

    #[test]
    fn test_redis_host_ignored_in_development() {
        let mut settings = Settings::default();
        settings.apply_env_overrides(env(&[("REDIS_HOST", "redis.internal")]));
        assert_eq!(settings.queue_connection().host, "127.0.0.1");
    }

    #[test]
    fn test_production_env_overrides() {
        let mut settings = Settings::default();
        settings.apply_env_overrides(env(&[
            ("NODE_ENV", "production"),
            ("REDIS_HOST", "redis.internal"),
            ("DOCKER_HOST", "tcp://10.0.0.2:2375"),
        ]));
        assert!(settings.mode.is_production());
        assert_eq!(settings.queue_connection().url(), "redis://redis.internal:6379/");
        assert_eq!(settings.docker.api_url, "tcp://10.0.0.2:2375");
    }

    #[test]
    fn test_empaas_env_wins_over_node_env() {
        let mut settings = Settings::default();
        settings.apply_env_overrides(env(&[
            ("EMPAAS_ENV", "development"),
            ("NODE_ENV", "production"),
        ]));
        assert_eq!(settings.mode, DeploymentMode::Development);
        assert_eq!(settings.queue_connection().host, "127.0.0.1");
    }

    #[tokio::test]
    async fn test_missing_settings_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = load_settings(&File::new(dir.path().join("settings.json")))
            .await
            .unwrap();
        assert_eq!(settings.server.port, 3030);
    }
}
