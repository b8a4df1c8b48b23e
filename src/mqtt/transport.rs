//! The seam between the connection manager and an MQTT client library.
//!
//! A [`Connector`] opens a [`Link`] and reports everything that happens on it as
//! [`TransportEvent`]s over a channel. The manager never touches the client
//! library directly, which keeps the event handling testable without a broker.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use super::config::{ConnectOptions, PublishOptions, QoS};
use crate::error::Result;

/// Something that happened on a link.
#[derive(Clone, Debug, PartialEq)]
pub enum TransportEvent {
    /// The broker acknowledged the connection.
    Connected,
    /// Connecting or the established connection failed.
    Error(String),
    /// The connection was closed.
    Closed,
    /// A retry is about to be attempted.
    Reconnecting,
    /// A publish arrived on a subscribed topic.
    Message { topic: String, payload: Bytes },
}

/// An open (or opening) broker connection.
#[async_trait]
pub trait Link: Send + Sync {
    /// Subscribes on the wire and resolves once the broker acknowledged it.
    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<()>;

    async fn unsubscribe(&self, topic: &str) -> Result<()>;

    /// Queues a publish without waiting for delivery.
    fn publish(&self, topic: &str, payload: Bytes, options: &PublishOptions) -> Result<()>;

    /// Tears the link down. No further events are reported afterwards.
    fn end(&self);
}

/// Opens links.
pub trait Connector: Send + Sync {
    /// Starts connecting and returns immediately; the outcome is reported through
    /// `events`. Fails only if the options cannot be turned into a connection.
    fn connect(
        &self,
        options: &ConnectOptions,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Arc<dyn Link>>;
}
