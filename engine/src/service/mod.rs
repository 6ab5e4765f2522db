//! Service intent API

pub mod api;

pub use api::{CancelOutcome, DeployRequest, ServiceApi};
