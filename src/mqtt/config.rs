use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Default time a `connect` waits for the broker's acknowledgement.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(4000);
/// Default delay between reconnect attempts.
pub const DEFAULT_RECONNECT_PERIOD: Duration = Duration::from_millis(1000);
pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(60);

/// Everything needed to open a broker connection.
#[derive(Clone, Debug, PartialEq)]
pub struct ConnectOptions {
    /// Broker URL, e.g. `ws://localhost:8083/mqtt` or `mqtt://localhost:1883`.
    pub url: String,
    /// Client identifier, a random one is generated when unset.
    pub client_id: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub connect_timeout: Duration,
    pub keep_alive: Duration,
    pub clean_session: bool,
    pub reconnect: ReconnectPolicy,
}

impl ConnectOptions {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client_id: None,
            username: None,
            password: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            keep_alive: DEFAULT_KEEP_ALIVE,
            clean_session: true,
            reconnect: ReconnectPolicy::default(),
        }
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    /// The configured client id or a fresh `iot_dash_xxxxxx` one.
    pub fn client_id_or_random(&self) -> String {
        match &self.client_id {
            Some(id) if !id.trim().is_empty() => id.trim().to_string(),
            _ => {
                let suffix = Uuid::new_v4().simple().to_string();
                format!("iot_dash_{}", &suffix[..6])
            }
        }
    }
}

/// How the transport retries after the connection drops or fails.
///
/// The attempt counter starts at 1 for the first retry after a failure and is
/// reset whenever the broker acknowledges a connection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    /// Base delay between attempts in milliseconds. `0` disables reconnecting.
    pub period_ms: u64,
    /// Give up after this many consecutive failed attempts, `None` retries forever.
    pub max_attempts: Option<u32>,
    pub backoff: Backoff,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Backoff {
    /// Always wait `period_ms`.
    Fixed,
    /// Double the delay on every attempt, capped at `max_delay_ms`.
    Exponential { max_delay_ms: u64 },
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            period_ms: DEFAULT_RECONNECT_PERIOD.as_millis() as u64,
            max_attempts: None,
            backoff: Backoff::Fixed,
        }
    }
}

impl ReconnectPolicy {
    /// A policy that never retries.
    pub fn disabled() -> Self {
        Self {
            period_ms: 0,
            max_attempts: Some(0),
            backoff: Backoff::Fixed,
        }
    }

    /// Delay before retry number `attempt`, or `None` once the policy gives up.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if self.period_ms == 0 {
            return None;
        }
        if let Some(max) = self.max_attempts {
            if attempt > max {
                return None;
            }
        }

        let millis = match self.backoff {
            Backoff::Fixed => self.period_ms,
            Backoff::Exponential { max_delay_ms } => {
                let shift = attempt.saturating_sub(1).min(32);
                self.period_ms
                    .saturating_mul(1u64 << shift)
                    .min(max_delay_ms.max(self.period_ms))
            }
        };
        Some(Duration::from_millis(millis))
    }
}

/// MQTT quality of service.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum QoS {
    #[default]
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl From<QoS> for rumqttc::QoS {
    fn from(qos: QoS) -> Self {
        match qos {
            QoS::AtMostOnce => rumqttc::QoS::AtMostOnce,
            QoS::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
            QoS::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PublishOptions {
    pub qos: QoS,
    pub retain: bool,
}

impl PublishOptions {
    pub fn retained(mut self) -> Self {
        self.retain = true;
        self
    }

    pub fn with_qos(mut self, qos: QoS) -> Self {
        self.qos = qos;
        self
    }
}
