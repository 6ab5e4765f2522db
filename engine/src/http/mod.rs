//! Outbound HTTP client shared by notification channels

pub mod client;

pub use client::{HttpClient, HttpClientError};
