//! Error types shared by the connection manager, the subscription router and the
//! telemetry model.

use std::time::Duration;

use thiserror::Error;

/// Errors surfaced to callers of the dashboard core.
///
/// Everything except [`Error::AlreadyConnected`] rejects the call that caused it.
/// `AlreadyConnected` only signals that a second `connect` was ignored.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
    /// No broker URL was supplied.
    #[error("MQTT broker URL is not configured")]
    ConfigurationMissing,

    /// The broker URL could not be understood.
    #[error("invalid broker URL: {0}")]
    InvalidBrokerUrl(String),

    /// `connect` was called while a live connection exists.
    #[error("MQTT client already connected")]
    AlreadyConnected,

    /// Subscribe or publish without a live connection.
    #[error("MQTT client not connected")]
    NotConnected,

    /// Failure reported by the underlying transport, carrying its message.
    #[error("MQTT transport error: {0}")]
    Transport(String),

    /// Malformed or invalid telemetry payload.
    #[error("failed to parse MQTT message: {0}")]
    Parse(String),

    /// The broker did not acknowledge the connection in time.
    #[error("MQTT connect not acknowledged within {0:?}")]
    Timeout(Duration),
}

impl Error {
    /// Whether the error should be reported to the user as a failure.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Error::AlreadyConnected)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
