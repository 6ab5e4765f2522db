//! Notifications
//!
//! [`dispatcher::Dispatcher`] matches an event against the configured
//! channels and hands it to one [`channels::ChannelAdapter`] per channel.

pub mod channels;
pub mod config;
pub mod dispatcher;
pub mod event;
pub mod format;

pub use channels::{ChannelAdapter, DeliveryError};
pub use config::{ChannelConfig, ChannelKind, ChannelStore, Destination, FileChannelStore, MemoryChannelStore};
pub use dispatcher::{DispatchSummary, Dispatcher};
pub use event::{NotificationEvent, NotificationKind};
