//! Data models

pub mod job;
