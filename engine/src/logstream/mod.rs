//! Per-job deployment log streams

pub mod hub;

pub use hub::{LogEvent, LogHub, LogHubOptions, LogStreamError, LogSubscription};
