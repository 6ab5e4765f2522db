//! Channel adapters
//!
//! Each adapter owns one external message format. The `build_*` functions
//! are pure so formats can be checked without a network.

pub mod discord;
pub mod email;
pub mod gotify;
pub mod slack;
pub mod telegram;

use async_trait::async_trait;
use thiserror::Error;

use crate::http::HttpClientError;
use crate::notifications::config::{ChannelConfig, ChannelKind};
use crate::notifications::event::NotificationEvent;

pub use discord::DiscordAdapter;
pub use email::EmailAdapter;
pub use gotify::GotifyAdapter;
pub use slack::SlackAdapter;
pub use telegram::TelegramAdapter;

/// A single channel could not deliver
#[derive(Error, Debug)]
pub enum DeliveryError {
    #[error("{adapter} adapter cannot deliver to a {configured} channel")]
    WrongDestination {
        adapter: ChannelKind,
        configured: ChannelKind,
    },

    #[error("channel misconfigured: {0}")]
    Config(String),

    #[error(transparent)]
    Http(#[from] HttpClientError),

    #[error("adapter crashed: {0}")]
    Crashed(String),
}

/// Delivers events to one kind of channel
#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    fn kind(&self) -> ChannelKind;

    async fn send(
        &self,
        config: &ChannelConfig,
        event: &NotificationEvent,
    ) -> Result<(), DeliveryError>;
}

fn wrong_destination(adapter: ChannelKind, config: &ChannelConfig) -> DeliveryError {
    DeliveryError::WrongDestination {
        adapter,
        configured: config.kind(),
    }
}
