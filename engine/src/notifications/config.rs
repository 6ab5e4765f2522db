//! Notification channel configuration

use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;

use async_trait::async_trait;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;

use crate::errors::EngineError;
use crate::filesys::file::File;
use crate::notifications::event::NotificationKind;
use crate::orchestrator::types::expose_secret;

pub const DEFAULT_TELEGRAM_API: &str = "https://api.telegram.org";

/// Channel kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    Email,
    Discord,
    Slack,
    Telegram,
    Gotify,
}

impl ChannelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelKind::Email => "email",
            ChannelKind::Discord => "discord",
            ChannelKind::Slack => "slack",
            ChannelKind::Telegram => "telegram",
            ChannelKind::Gotify => "gotify",
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where and how a channel delivers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Destination {
    #[serde(rename_all = "camelCase")]
    Email {
        /// Transactional mail API endpoint
        api_url: String,
        #[serde(serialize_with = "expose_secret")]
        api_key: SecretString,
        from_address: String,
        to_addresses: Vec<String>,
    },

    #[serde(rename_all = "camelCase")]
    Discord {
        #[serde(serialize_with = "expose_secret")]
        webhook_url: SecretString,
    },

    #[serde(rename_all = "camelCase")]
    Slack {
        #[serde(serialize_with = "expose_secret")]
        webhook_url: SecretString,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        channel: Option<String>,
    },

    #[serde(rename_all = "camelCase")]
    Telegram {
        #[serde(serialize_with = "expose_secret")]
        bot_token: SecretString,
        chat_id: String,
        #[serde(default = "default_telegram_api")]
        api_url: String,
    },

    #[serde(rename_all = "camelCase")]
    Gotify {
        server_url: String,
        #[serde(serialize_with = "expose_secret")]
        app_token: SecretString,
        #[serde(default = "default_gotify_priority")]
        priority: u8,
    },
}

fn default_telegram_api() -> String {
    DEFAULT_TELEGRAM_API.to_string()
}

fn default_gotify_priority() -> u8 {
    5
}

fn default_true() -> bool {
    true
}

impl Destination {
    pub fn kind(&self) -> ChannelKind {
        match self {
            Destination::Email { .. } => ChannelKind::Email,
            Destination::Discord { .. } => ChannelKind::Discord,
            Destination::Slack { .. } => ChannelKind::Slack,
            Destination::Telegram { .. } => ChannelKind::Telegram,
            Destination::Gotify { .. } => ChannelKind::Gotify,
        }
    }
}

/// One configured notification channel
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelConfig {
    pub id: String,

    #[serde(default)]
    pub name: String,

    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Emoji and markdown prefixes
    #[serde(default = "default_true")]
    pub decoration_enabled: bool,

    /// Event kinds this channel subscribes to
    #[serde(default)]
    pub events: BTreeSet<NotificationKind>,

    #[serde(flatten)]
    pub destination: Destination,
}

impl ChannelConfig {
    pub fn kind(&self) -> ChannelKind {
        self.destination.kind()
    }

    /// Enabled and subscribed to `kind`
    pub fn wants(&self, kind: NotificationKind) -> bool {
        self.enabled && self.events.contains(&kind)
    }
}

/// On-disk shape of the channels file
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ChannelsDocument {
    #[serde(default)]
    pub channels: Vec<ChannelConfig>,
}

/// Source of channel configuration
#[async_trait]
pub trait ChannelStore: Send + Sync {
    async fn load(&self) -> Result<Vec<ChannelConfig>, EngineError>;
}

/// Channels read from a JSON file on every load
pub struct FileChannelStore {
    file: File,
}

impl FileChannelStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            file: File::new(path),
        }
    }

    pub async fn save(&self, channels: Vec<ChannelConfig>) -> Result<(), EngineError> {
        self.file.write_json(&ChannelsDocument { channels }).await
    }
}

#[async_trait]
impl ChannelStore for FileChannelStore {
    async fn load(&self) -> Result<Vec<ChannelConfig>, EngineError> {
        match self.file.read_bytes_opt().await? {
            Some(bytes) => {
                let document: ChannelsDocument = serde_json::from_slice(&bytes)?;
                Ok(document.channels)
            }
            None => {
                debug!(
                    "No notification channels file at {}",
                    self.file.path().display()
                );
                Ok(Vec::new())
            }
        }
    }
}

/// Channels kept in memory
#[derive(Default)]
pub struct MemoryChannelStore {
    channels: RwLock<Vec<ChannelConfig>>,
}

impl MemoryChannelStore {
    pub fn new(channels: Vec<ChannelConfig>) -> Self {
        Self {
            channels: RwLock::new(channels),
        }
    }

    pub async fn set(&self, channels: Vec<ChannelConfig>) {
        *self.channels.write().await = channels;
    }
}

#[async_trait]
impl ChannelStore for MemoryChannelStore {
    async fn load(&self) -> Result<Vec<ChannelConfig>, EngineError> {
        Ok(self.channels.read().await.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    const DOCUMENT: &str = r#"{
        "channels": [
            {
                "id": "ops-discord",
                "name": "Ops",
                "kind": "discord",
                "webhookUrl": "https://discord.test/api/webhooks/1/abc",
                "decorationEnabled": false,
                "events": ["server-restarted", "deployment-failed"]
            },
            {
                "id": "phone",
                "kind": "gotify",
                "serverUrl": "https://gotify.test",
                "appToken": "tok",
                "enabled": false
            }
        ]
    }"#;

    #[tokio::test]
    async fn test_file_store_loads_channels() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notifications.json");
        std::fs::write(&path, DOCUMENT).unwrap();

        let channels = FileChannelStore::new(&path).load().await.unwrap();
        assert_eq!(channels.len(), 2);

        let discord = &channels[0];
        assert_eq!(discord.kind(), ChannelKind::Discord);
        assert!(!discord.decoration_enabled);
        assert!(discord.wants(NotificationKind::ServerRestarted));
        assert!(!discord.wants(NotificationKind::DeploymentSucceeded));
        match &discord.destination {
            Destination::Discord { webhook_url } => {
                assert_eq!(webhook_url.expose_secret(), "https://discord.test/api/webhooks/1/abc")
            }
            other => panic!("unexpected destination {:?}", other.kind()),
        }

        let gotify = &channels[1];
        assert!(!gotify.wants(NotificationKind::ServerRestarted));
        assert!(matches!(gotify.destination, Destination::Gotify { priority: 5, .. }));
    }

    #[tokio::test]
    async fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileChannelStore::new(dir.path().join("absent.json"));
        assert!(store.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_save_round_trips_secrets() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notifications.json");
        std::fs::write(&path, DOCUMENT).unwrap();
        let store = FileChannelStore::new(&path);

        let channels = store.load().await.unwrap();
        store.save(channels).await.unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("\"appToken\": \"tok\""));
        assert_eq!(store.load().await.unwrap().len(), 2);
    }
}
