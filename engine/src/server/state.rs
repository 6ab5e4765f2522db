//! Server state

use std::sync::Arc;

use crate::service::ServiceApi;

/// Shared state handed to every handler
pub struct ServerState {
    /// Intent API the handlers translate requests into
    pub api: Arc<ServiceApi>,
}

impl ServerState {
    pub fn new(api: Arc<ServiceApi>) -> Self {
        Self { api }
    }
}
