//! Email through a transactional mail HTTP API

use std::sync::Arc;

use async_trait::async_trait;
use secrecy::ExposeSecret;
use serde::Serialize;

use crate::http::HttpClient;
use crate::notifications::channels::{wrong_destination, ChannelAdapter, DeliveryError};
use crate::notifications::config::{ChannelConfig, ChannelKind, Destination};
use crate::notifications::event::NotificationEvent;
use crate::notifications::format::{date_time, decorate, escape_html};

#[derive(Debug, Clone, Serialize)]
pub struct EmailMessage {
    pub from: String,
    pub to: Vec<String>,
    pub subject: String,
    pub html: String,
}

/// HTML body listing the event's fields
pub fn render_html(event: &NotificationEvent, decorated: bool) -> String {
    let emoji = if event.kind.is_success() { "✅" } else { "⚠️" };
    let heading = escape_html(&decorate(decorated, emoji, event.title()));

    let mut rows = vec![("Date", date_time(&event.timestamp))];
    if let Some(service) = event.service() {
        rows.push(("Service", service.to_string()));
    }
    if let Some(reason) = event.reason() {
        rows.push(("Error", reason));
    }
    let rows: String = rows
        .into_iter()
        .map(|(label, value)| {
            format!(
                "<tr><td style=\"padding:4px 12px 4px 0\"><strong>{}</strong></td><td>{}</td></tr>",
                label,
                escape_html(&value)
            )
        })
        .collect();

    format!(
        "<!DOCTYPE html><html><body style=\"font-family:sans-serif\">\
         <h2>{}</h2><table>{}</table>\
         <p style=\"color:#888\">Sent by Empaas</p></body></html>",
        heading, rows
    )
}

pub struct EmailAdapter {
    http: Arc<HttpClient>,
}

impl EmailAdapter {
    pub fn new(http: Arc<HttpClient>) -> Self {
        Self { http }
    }
}

#[async_trait]
impl ChannelAdapter for EmailAdapter {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Email
    }

    async fn send(
        &self,
        config: &ChannelConfig,
        event: &NotificationEvent,
    ) -> Result<(), DeliveryError> {
        let Destination::Email {
            api_url,
            api_key,
            from_address,
            to_addresses,
        } = &config.destination
        else {
            return Err(wrong_destination(self.kind(), config));
        };
        if to_addresses.is_empty() {
            return Err(DeliveryError::Config("email channel has no recipients".to_string()));
        }

        let message = EmailMessage {
            from: from_address.clone(),
            to: to_addresses.clone(),
            subject: event.title().to_string(),
            html: render_html(event, config.decoration_enabled),
        };
        self.http
            .post_json(
                api_url,
                &[(
                    "Authorization",
                    format!("Bearer {}", api_key.expose_secret()),
                )],
                &message,
            )
            .await?;
        Ok(())
    }
}
