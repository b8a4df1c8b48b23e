//! # IoT Dashboard core
//!
//! Shared MQTT session for a device dashboard: one broker connection, any number
//! of topic subscribers, and a bounded history of what arrived.

pub mod config;
pub mod error;
pub mod mqtt;
pub mod telemetry;

pub use error::{Error, Result};
