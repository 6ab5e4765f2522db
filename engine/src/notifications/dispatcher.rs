//! Notification dispatcher
//!
//! Fans one event out to every enabled channel subscribed to its kind.
//! Adapters run concurrently, each on its own task, and a failing or
//! panicking adapter is logged and skipped. Nothing is retried.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use tracing::{debug, error, info, warn};

use crate::http::HttpClient;
use crate::notifications::channels::{
    ChannelAdapter, DeliveryError, DiscordAdapter, EmailAdapter, GotifyAdapter, SlackAdapter,
    TelegramAdapter,
};
use crate::notifications::config::{ChannelKind, ChannelStore};
use crate::notifications::event::NotificationEvent;

/// Counts from one dispatch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    pub matched: usize,
    pub delivered: usize,
    pub failed: usize,
}

pub struct Dispatcher {
    store: Arc<dyn ChannelStore>,
    adapters: HashMap<ChannelKind, Arc<dyn ChannelAdapter>>,
}

impl Dispatcher {
    /// Dispatcher without adapters
    pub fn new(store: Arc<dyn ChannelStore>) -> Self {
        Self {
            store,
            adapters: HashMap::new(),
        }
    }

    /// Dispatcher with an adapter for every channel kind
    pub fn with_default_adapters(store: Arc<dyn ChannelStore>, http: Arc<HttpClient>) -> Self {
        Self::new(store)
            .with_adapter(Arc::new(EmailAdapter::new(http.clone())))
            .with_adapter(Arc::new(DiscordAdapter::new(http.clone())))
            .with_adapter(Arc::new(SlackAdapter::new(http.clone())))
            .with_adapter(Arc::new(TelegramAdapter::new(http.clone())))
            .with_adapter(Arc::new(GotifyAdapter::new(http)))
    }

    /// Register or replace the adapter for its kind
    pub fn with_adapter(mut self, adapter: Arc<dyn ChannelAdapter>) -> Self {
        self.adapters.insert(adapter.kind(), adapter);
        self
    }

    /// Deliver `event` to every matching channel. Never fails.
    pub async fn dispatch(&self, event: &NotificationEvent) -> DispatchSummary {
        let channels = match self.store.load().await {
            Ok(channels) => channels,
            Err(e) => {
                error!("Failed to load notification channels: {}", e);
                return DispatchSummary::default();
            }
        };

        let matched: Vec<_> = channels
            .into_iter()
            .filter(|channel| channel.wants(event.kind))
            .collect();
        if matched.is_empty() {
            debug!("No channels subscribed to {}", event.kind.as_str());
            return DispatchSummary::default();
        }

        let deliveries = matched.into_iter().map(|config| {
            let adapter = self.adapters.get(&config.kind()).cloned();
            let event = event.clone();
            async move {
                let id = config.id.clone();
                let kind = config.kind();
                let result = match adapter {
                    Some(adapter) => {
                        match tokio::spawn(async move { adapter.send(&config, &event).await }).await {
                            Ok(result) => result,
                            Err(e) => Err(DeliveryError::Crashed(e.to_string())),
                        }
                    }
                    None => Err(DeliveryError::Config(format!("no adapter for {} channels", kind))),
                };
                (id, kind, result)
            }
        });

        let mut summary = DispatchSummary::default();
        for (id, kind, result) in join_all(deliveries).await {
            summary.matched += 1;
            match result {
                Ok(()) => {
                    summary.delivered += 1;
                    debug!("Sent {} to {} channel {}", event.kind.as_str(), kind, id);
                }
                Err(e) => {
                    summary.failed += 1;
                    warn!(
                        "Failed to send {} to {} channel {}: {}",
                        event.kind.as_str(),
                        kind,
                        id,
                        e
                    );
                }
            }
        }

        info!(
            "Notification {} dispatched: {} delivered, {} failed",
            event.kind.as_str(),
            summary.delivered,
            summary.failed
        );
        summary
    }
}
