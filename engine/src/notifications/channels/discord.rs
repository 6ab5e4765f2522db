//! Discord webhook embeds

use std::sync::Arc;

use async_trait::async_trait;
use secrecy::ExposeSecret;
use serde::Serialize;

use crate::http::HttpClient;
use crate::notifications::channels::{wrong_destination, ChannelAdapter, DeliveryError};
use crate::notifications::config::{ChannelConfig, ChannelKind, Destination};
use crate::notifications::event::{NotificationEvent, NotificationKind};
use crate::notifications::format::decorate;

pub const SUCCESS_COLOR: u32 = 0x57F287;
pub const FAILURE_COLOR: u32 = 0xED4245;

#[derive(Debug, Clone, Serialize)]
pub struct DiscordField {
    pub name: String,
    pub value: String,
    pub inline: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct DiscordFooter {
    pub text: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DiscordEmbed {
    pub title: String,
    pub color: u32,
    pub fields: Vec<DiscordField>,
    pub timestamp: String,
    pub footer: DiscordFooter,
}

#[derive(Debug, Clone, Serialize)]
pub struct DiscordMessage {
    pub embeds: Vec<DiscordEmbed>,
}

fn field(decorated: bool, emoji: &str, name: &str, value: String, inline: bool) -> DiscordField {
    DiscordField {
        name: decorate(decorated, emoji, name),
        value,
        inline,
    }
}

/// Embed for an event
pub fn build_embed(event: &NotificationEvent, decorated: bool) -> DiscordEmbed {
    let success = event.kind.is_success();
    let unix = event.timestamp.timestamp();
    let title_emoji = if success { "> `✅`" } else { "> `⚠️`" };

    let mut fields = Vec::new();
    if let Some(service) = event.service() {
        fields.push(field(decorated, "`🛠️`", "Service", service.to_string(), true));
    }
    fields.push(field(decorated, "`📅`", "Date", format!("<t:{}:D>", unix), true));
    fields.push(field(decorated, "`⌚`", "Time", format!("<t:{}:t>", unix), true));
    fields.push(field(
        decorated,
        "`❓`",
        "Type",
        if success { "Successful" } else { "Failed" }.to_string(),
        true,
    ));
    if let Some(reason) = event.reason() {
        let value = if decorated {
            format!("```{}```", reason)
        } else {
            reason
        };
        fields.push(field(decorated, "`⚠️`", "Error Message", value, false));
    }

    DiscordEmbed {
        title: decorate(decorated, title_emoji, event.title()),
        color: if success { SUCCESS_COLOR } else { FAILURE_COLOR },
        fields,
        timestamp: event.timestamp.to_rfc3339(),
        footer: DiscordFooter {
            text: format!("Empaas {} Notification", footer_label(event)),
        },
    }
}

fn footer_label(event: &NotificationEvent) -> &'static str {
    match event.kind {
        NotificationKind::ServerRestarted => "Restart",
        NotificationKind::DeploymentSucceeded | NotificationKind::DeploymentFailed => "Deployment",
    }
}

pub struct DiscordAdapter {
    http: Arc<HttpClient>,
}

impl DiscordAdapter {
    pub fn new(http: Arc<HttpClient>) -> Self {
        Self { http }
    }
}

#[async_trait]
impl ChannelAdapter for DiscordAdapter {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Discord
    }

    async fn send(
        &self,
        config: &ChannelConfig,
        event: &NotificationEvent,
    ) -> Result<(), DeliveryError> {
        let Destination::Discord { webhook_url } = &config.destination else {
            return Err(wrong_destination(self.kind(), config));
        };
        let message = DiscordMessage {
            embeds: vec![build_embed(event, config.decoration_enabled)],
        };
        self.http
            .post_json(webhook_url.expose_secret(), &[], &message)
            .await?;
        Ok(())
    }
}
