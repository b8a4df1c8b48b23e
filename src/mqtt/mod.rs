//! # MQTT Integration Module
//!
//! Session and subscription management for the dashboard. One broker connection is
//! shared by every widget: widgets subscribe to the topics they display, the
//! connection is opened and closed in a single place, and the last received
//! messages stay available for inspection.
//!
//! ## Module Architecture
//!
//! ```text
//! mqtt/
//! ├── config.rs        - Connect, reconnect and publish options
//! ├── history.rs       - Bounded newest-first message history
//! ├── mqtt_handler.rs  - Connection state machine and public API
//! ├── router.rs        - Topic to callback routing
//! ├── rumqtt.rs        - rumqttc-backed transport
//! └── transport.rs     - Transport seam used by the handler
//! ```
//!
//! ## Connection lifecycle
//!
//! ```text
//! Disconnected --connect--> Connecting --ack--> Connected
//!      ^                        |                  |
//!      +--------error-----------+      drop/error  v
//!      +---------------disconnect------------ Reconnecting
//! ```
//!
//! State only changes in response to transport events. Callers observe it through
//! [`MqttHandler::status`] or a [`tokio::sync::watch`] receiver.
//!
//! ## Usage
//!
//! 1. Create one [`MqttHandler`] at startup and clone it into every consumer
//! 2. `connect` with the broker URL and credentials from the configuration
//! 3. Consumers `subscribe` with a callback and keep the returned [`CallbackId`]
//! 4. On teardown consumers `unsubscribe`, the app calls `disconnect`

pub mod config;
pub mod history;
pub mod mqtt_handler;
pub mod router;
pub mod rumqtt;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use config::{Backoff, ConnectOptions, PublishOptions, QoS, ReconnectPolicy};
pub use history::{MessageHistory, ReceivedMessage};
pub use mqtt_handler::{ConnectionState, ConnectionStatus, MqttHandler, Payload};
pub use router::{CallbackId, DispatchReport, MessageCallback, SubscriptionRouter};
pub use rumqtt::RumqttConnector;
pub use transport::{Connector, Link, TransportEvent};
