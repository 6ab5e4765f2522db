//! Reverse-proxy routing
//!
//! The pipeline's routing step hands a service's public endpoints to a
//! [`RoutingStore`]. Writers replace the whole document and swap it in, so a
//! failed write never leaves a half-written configuration behind.

pub mod traefik;

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A public endpoint of a service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Domain {
    pub host: String,

    #[serde(default = "default_path")]
    pub path: String,

    /// Container port the proxy forwards to
    pub port: u16,

    #[serde(default)]
    pub https: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate_resolver: Option<String>,

    #[serde(default)]
    pub middlewares: Vec<String>,
}

fn default_path() -> String {
    "/".to_string()
}

impl Domain {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            path: default_path(),
            port,
            https: false,
            certificate_resolver: None,
            middlewares: Vec::new(),
        }
    }
}

/// Failed to swap in new routing configuration. The previous document is
/// left untouched.
#[derive(Error, Debug)]
pub enum RoutingWriteError {
    #[error("invalid route for {service}: {message}")]
    Invalid { service: String, message: String },

    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("existing config {path} is not valid YAML: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[error("failed to serialize routing config: {0}")]
    Serialize(serde_yaml::Error),

    #[error("failed to write {path}: {message}")]
    Write { path: PathBuf, message: String },
}

/// What a routing write did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingChange {
    Written,
    /// New document was byte-identical to the current one
    Unchanged,
}

/// Store for the proxy's dynamic configuration
#[async_trait]
pub trait RoutingStore: Send + Sync {
    /// Replace the routes owned by `service` with routes for `domains`
    async fn apply(
        &self,
        service: &str,
        domains: &[Domain],
    ) -> Result<RoutingChange, RoutingWriteError>;

    /// Drop every route owned by `service`
    async fn remove(&self, service: &str) -> Result<RoutingChange, RoutingWriteError>;
}
