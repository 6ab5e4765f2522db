//! Slack incoming-webhook attachments

use std::sync::Arc;

use async_trait::async_trait;
use secrecy::ExposeSecret;
use serde::Serialize;

use crate::http::HttpClient;
use crate::notifications::channels::{wrong_destination, ChannelAdapter, DeliveryError};
use crate::notifications::config::{ChannelConfig, ChannelKind, Destination};
use crate::notifications::event::NotificationEvent;
use crate::notifications::format::date_time;

pub const SUCCESS_COLOR: &str = "#00FF00";
pub const FAILURE_COLOR: &str = "#FF0000";

#[derive(Debug, Clone, Serialize)]
pub struct SlackField {
    pub title: String,
    pub value: String,
    pub short: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SlackAttachment {
    pub color: String,
    pub pretext: String,
    pub fields: Vec<SlackField>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SlackMessage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    pub attachments: Vec<SlackAttachment>,
}

/// Attachment message for an event
pub fn build_message(
    event: &NotificationEvent,
    decorated: bool,
    channel: Option<String>,
) -> SlackMessage {
    let success = event.kind.is_success();
    let pretext = if decorated {
        let emoji = if success { ":white_check_mark:" } else { ":warning:" };
        format!("{} *{}*", emoji, event.title())
    } else {
        event.title().to_string()
    };

    let mut fields = Vec::new();
    if let Some(service) = event.service() {
        fields.push(SlackField {
            title: "Service".to_string(),
            value: service.to_string(),
            short: true,
        });
    }
    fields.push(SlackField {
        title: "Time".to_string(),
        value: date_time(&event.timestamp),
        short: true,
    });
    if let Some(reason) = event.reason() {
        fields.push(SlackField {
            title: "Error".to_string(),
            value: reason,
            short: false,
        });
    }

    SlackMessage {
        channel,
        attachments: vec![SlackAttachment {
            color: if success { SUCCESS_COLOR } else { FAILURE_COLOR }.to_string(),
            pretext,
            fields,
        }],
    }
}

pub struct SlackAdapter {
    http: Arc<HttpClient>,
}

impl SlackAdapter {
    pub fn new(http: Arc<HttpClient>) -> Self {
        Self { http }
    }
}

#[async_trait]
impl ChannelAdapter for SlackAdapter {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Slack
    }

    async fn send(
        &self,
        config: &ChannelConfig,
        event: &NotificationEvent,
    ) -> Result<(), DeliveryError> {
        let Destination::Slack {
            webhook_url,
            channel,
        } = &config.destination
        else {
            return Err(wrong_destination(self.kind(), config));
        };
        let message = build_message(event, config.decoration_enabled, channel.clone());
        self.http
            .post_json(webhook_url.expose_secret(), &[], &message)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decorated_pretext() {
        let message = build_message(&NotificationEvent::server_restarted(), true, Some("#ops".into()));
        let attachment = &message.attachments[0];
        assert_eq!(attachment.pretext, ":white_check_mark: *Empaas Server Restarted*");
        assert_eq!(attachment.color, SUCCESS_COLOR);
        assert_eq!(attachment.fields[0].title, "Time");
        assert_eq!(message.channel.as_deref(), Some("#ops"));
    }

    #[test]
    fn test_plain_pretext_has_no_markup() {
        let message = build_message(&NotificationEvent::server_restarted(), false, None);
        assert_eq!(message.attachments[0].pretext, "Empaas Server Restarted");

        let value = serde_json::to_value(&message).unwrap();
        assert!(value.get("channel").is_none());
    }
}
