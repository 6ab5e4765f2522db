//! Telegram Bot API messages

use std::sync::Arc;

use async_trait::async_trait;
use secrecy::ExposeSecret;
use serde::Serialize;

use crate::http::HttpClient;
use crate::notifications::channels::{wrong_destination, ChannelAdapter, DeliveryError};
use crate::notifications::config::{ChannelConfig, ChannelKind, Destination};
use crate::notifications::event::NotificationEvent;
use crate::notifications::format::{decorate, escape_html, long_date, long_time};

#[derive(Debug, Clone, Serialize)]
pub struct TelegramMessage {
    pub chat_id: String,
    pub text: String,
    pub parse_mode: &'static str,
    pub disable_web_page_preview: bool,
}

/// HTML text for an event: bold title, then date and time lines
pub fn build_text(event: &NotificationEvent, decorated: bool) -> String {
    let emoji = if event.kind.is_success() { "✅" } else { "⚠️" };
    let mut text = format!(
        "<b>{}</b>\n",
        escape_html(&decorate(decorated, emoji, event.title()))
    );
    if let Some(service) = event.service() {
        text.push_str(&format!("\n<b>Service:</b> {}", escape_html(service)));
    }
    text.push_str(&format!(
        "\n<b>Date:</b> {}\n<b>Time:</b> {}",
        long_date(&event.timestamp),
        long_time(&event.timestamp)
    ));
    if let Some(reason) = event.reason() {
        text.push_str(&format!("\n<b>Error:</b> {}", escape_html(&reason)));
    }
    text
}

pub struct TelegramAdapter {
    http: Arc<HttpClient>,
}

impl TelegramAdapter {
    pub fn new(http: Arc<HttpClient>) -> Self {
        Self { http }
    }
}

#[async_trait]
impl ChannelAdapter for TelegramAdapter {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Telegram
    }

    async fn send(
        &self,
        config: &ChannelConfig,
        event: &NotificationEvent,
    ) -> Result<(), DeliveryError> {
        let Destination::Telegram {
            bot_token,
            chat_id,
            api_url,
        } = &config.destination
        else {
            return Err(wrong_destination(self.kind(), config));
        };
        if chat_id.trim().is_empty() {
            return Err(DeliveryError::Config("telegram chat id is empty".to_string()));
        }

        let url = format!(
            "{}/bot{}/sendMessage",
            api_url.trim_end_matches('/'),
            bot_token.expose_secret()
        );
        let message = TelegramMessage {
            chat_id: chat_id.clone(),
            text: build_text(event, config.decoration_enabled),
            parse_mode: "HTML",
            disable_web_page_preview: true,
        };
        self.http.post_json(&url, &[], &message).await?;
        Ok(())
    }
}
