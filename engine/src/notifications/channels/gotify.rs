//! Gotify push messages

use std::sync::Arc;

use async_trait::async_trait;
use secrecy::ExposeSecret;
use serde::Serialize;
use serde_json::json;

use crate::http::HttpClient;
use crate::notifications::channels::{wrong_destination, ChannelAdapter, DeliveryError};
use crate::notifications::config::{ChannelConfig, ChannelKind, Destination};
use crate::notifications::event::NotificationEvent;
use crate::notifications::format::{date_time, decorate};

#[derive(Debug, Clone, Serialize)]
pub struct GotifyMessage {
    pub title: String,
    pub message: String,
    pub priority: u8,
    pub extras: serde_json::Value,
}

/// Plain-text message: title line, then date line
pub fn build_message(event: &NotificationEvent, decorated: bool, priority: u8) -> GotifyMessage {
    let emoji = if event.kind.is_success() { "✅" } else { "⚠️" };
    let title = decorate(decorated, emoji, event.title());

    let mut lines = vec![
        title.clone(),
        decorate(decorated, "🕒", &format!("Date: {}", date_time(&event.timestamp))),
    ];
    if let Some(service) = event.service() {
        lines.push(decorate(decorated, "🛠️", &format!("Service: {}", service)));
    }
    if let Some(reason) = event.reason() {
        lines.push(decorate(decorated, "⚠️", &format!("Error: {}", reason)));
    }

    GotifyMessage {
        title,
        message: lines.join("\n"),
        priority,
        extras: json!({ "client::display": { "contentType": "text/plain" } }),
    }
}

pub struct GotifyAdapter {
    http: Arc<HttpClient>,
}

impl GotifyAdapter {
    pub fn new(http: Arc<HttpClient>) -> Self {
        Self { http }
    }
}

#[async_trait]
impl ChannelAdapter for GotifyAdapter {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Gotify
    }

    async fn send(
        &self,
        config: &ChannelConfig,
        event: &NotificationEvent,
    ) -> Result<(), DeliveryError> {
        let Destination::Gotify {
            server_url,
            app_token,
            priority,
        } = &config.destination
        else {
            return Err(wrong_destination(self.kind(), config));
        };

        let url = format!("{}/message", server_url.trim_end_matches('/'));
        let message = build_message(event, config.decoration_enabled, *priority);
        self.http
            .post_json(
                &url,
                &[("X-Gotify-Key", app_token.expose_secret().to_string())],
                &message,
            )
            .await?;
        Ok(())
    }
}
