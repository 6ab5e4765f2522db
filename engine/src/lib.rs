//! Empaas Engine Library
//!
//! Service reconciliation, the queued deployment pipeline and notification
//! fan-out behind the Empaas control plane.

pub mod app;
pub mod deploy;
pub mod errors;
pub mod filesys;
pub mod http;
pub mod logs;
pub mod logstream;
pub mod models;
pub mod notifications;
pub mod orchestrator;
pub mod queue;
pub mod routing;
pub mod server;
pub mod service;
pub mod setup;
pub mod storage;
pub mod utils;
pub mod workers;
