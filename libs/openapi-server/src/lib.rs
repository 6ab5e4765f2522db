//! Models for the Empaas engine HTTP API

pub mod models;

pub use models::*;
