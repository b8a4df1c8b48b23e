//! # Telemetry
//!
//! Application-level payloads carried inside MQTT messages and the consumers that
//! turn them into dashboard state.
//!
//! The subscription router never looks inside a payload. Consumers registered on a
//! topic parse the text they receive with [`Message::parse`] and keep whatever view
//! state they need, as [`VariableIndicator`] does for on/off variables.

pub mod indicator;
pub mod message;

pub use indicator::{IndicatorState, VariableIndicator};
pub use message::Message;
