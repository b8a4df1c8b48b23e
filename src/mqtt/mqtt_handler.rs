use std::sync::{Arc, Weak};

use bytes::Bytes;
use chrono::{DateTime, Local};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::config::{ConnectOptions, PublishOptions, QoS};
use super::history::{ReceivedMessage, DEFAULT_HISTORY_LIMIT};
use super::router::{CallbackId, MessageCallback, SubscriptionRouter};
use super::rumqtt::RumqttConnector;
use super::transport::{Connector, Link, TransportEvent};
use crate::error::{Error, Result};
use crate::telemetry::Message;

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Observable state of the broker connection.
///
/// Only transport events move `state`; callers read it through
/// [`MqttHandler::status`] or follow it with [`MqttHandler::watch_status`].
#[derive(Clone, Debug, Default)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    /// Message of the most recent failure, cleared by a successful connect.
    pub last_error: Option<String>,
    pub messages_received: usize,
    pub messages_sent: usize,
    pub last_activity: Option<DateTime<Local>>,
}

impl ConnectionStatus {
    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn label(&self) -> &'static str {
        match self.state {
            ConnectionState::Disconnected => "Disconnected",
            ConnectionState::Connecting => "Connecting...",
            ConnectionState::Connected => "Connected",
            ConnectionState::Reconnecting => "Reconnecting...",
        }
    }
}

/// Payload accepted by [`MqttHandler::publish`].
///
/// Text goes out unchanged, everything else is serialized to JSON first.
#[derive(Clone, Debug, PartialEq)]
pub enum Payload {
    Text(String),
    Json(serde_json::Value),
}

impl Payload {
    pub fn into_text(self) -> String {
        match self {
            Payload::Text(text) => text,
            Payload::Json(value) => value.to_string(),
        }
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Payload::Text(text.to_string())
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Payload::Text(text)
    }
}

impl From<serde_json::Value> for Payload {
    fn from(value: serde_json::Value) -> Self {
        Payload::Json(value)
    }
}

impl From<&Message> for Payload {
    fn from(message: &Message) -> Self {
        Payload::Text(message.to_json())
    }
}

struct ActiveLink {
    link: Arc<dyn Link>,
    cancel: CancellationToken,
}

impl ActiveLink {
    fn shutdown(self) {
        self.cancel.cancel();
        self.link.end();
    }
}

struct Shared {
    connector: Arc<dyn Connector>,
    router: SubscriptionRouter,
    active: Mutex<Option<ActiveLink>>,
    status: watch::Sender<ConnectionStatus>,
}

impl Shared {
    fn update(&self, modify: impl FnOnce(&mut ConnectionStatus)) {
        self.status.send_modify(modify);
    }

    fn record_error(&self, err: &Error) {
        let message = err.to_string();
        self.update(|status| status.last_error = Some(message));
    }

    /// Re-issues every wire subscription known to the router on `link`.
    ///
    /// Runs on every acknowledged connection: after a reconnect of the same link
    /// as well as for a fresh link that replaced one which never finished.
    fn resubscribe(&self, link: &Arc<dyn Link>) {
        let restored = self.router.resubscribe_all(link);
        if restored > 0 {
            info!("Restoring {} subscriptions on the new connection", restored);
        }
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        if let Some(active) = self.active.get_mut().take() {
            active.shutdown();
        }
    }
}

/// Owns the single broker connection and routes its messages to any number of
/// subscribers.
///
/// The handler is a cheap handle: clones share the connection, the subscription
/// table and the message history. Create one at startup and pass it to whoever
/// needs it.
///
/// ```rust,no_run
/// use iot_dashboard::mqtt::{ConnectOptions, MqttHandler};
///
/// # async fn demo() -> iot_dashboard::Result<()> {
/// let mqtt = MqttHandler::default();
/// mqtt.connect(ConnectOptions::new("ws://localhost:8083/mqtt")).await?;
///
/// let id = mqtt
///     .subscribe_fn("1/devices/+/state", |payload, topic| {
///         println!("{topic}: {payload}");
///         Ok(())
///     })
///     .await?;
///
/// mqtt.unsubscribe("1/devices/+/state", Some(id)).await;
/// mqtt.disconnect();
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct MqttHandler {
    shared: Arc<Shared>,
}

impl Default for MqttHandler {
    fn default() -> Self {
        Self::new(Arc::new(RumqttConnector::default()))
    }
}

impl MqttHandler {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self::with_history_limit(connector, DEFAULT_HISTORY_LIMIT)
    }

    pub fn with_history_limit(connector: Arc<dyn Connector>, history_limit: usize) -> Self {
        let (status, _) = watch::channel(ConnectionStatus::default());
        Self {
            shared: Arc::new(Shared {
                connector,
                router: SubscriptionRouter::new(history_limit),
                active: Mutex::new(None),
                status,
            }),
        }
    }

    /// Connects to the broker and waits until it acknowledges.
    ///
    /// The first acknowledgement or the first error settles the call; later
    /// transport events only move the connection state. If nothing happens within
    /// `options.connect_timeout` the call fails with [`Error::Timeout`] while the
    /// link keeps trying in the background.
    ///
    /// # Errors
    ///
    /// * [`Error::ConfigurationMissing`] - empty broker URL
    /// * [`Error::AlreadyConnected`] - a live connection exists, nothing was changed
    /// * [`Error::InvalidBrokerUrl`] - the URL cannot be used
    /// * [`Error::Transport`] - the broker or network refused the connection
    /// * [`Error::Timeout`] - no acknowledgement in time
    pub async fn connect(&self, options: ConnectOptions) -> Result<()> {
        if options.url.trim().is_empty() {
            let err = Error::ConfigurationMissing;
            error!("Failed to connect to MQTT broker: {}", err);
            self.shared.record_error(&err);
            return Err(err);
        }

        let settled = {
            let mut active = self.shared.active.lock();
            if active.is_some() && self.shared.status.borrow().is_connected() {
                warn!("MQTT client already connected");
                return Err(Error::AlreadyConnected);
            }
            if let Some(stale) = active.take() {
                debug!("Replacing unfinished MQTT link");
                stale.shutdown();
            }

            self.shared.update(|status| {
                status.state = ConnectionState::Connecting;
                status.last_error = None;
            });

            let (event_tx, event_rx) = mpsc::unbounded_channel();
            let link = match self.shared.connector.connect(&options, event_tx) {
                Ok(link) => link,
                Err(e) => {
                    error!("Failed to connect to MQTT broker: {}", e);
                    self.shared.update(|status| {
                        status.state = ConnectionState::Disconnected;
                        status.last_error = Some(e.to_string());
                    });
                    return Err(e);
                }
            };

            let cancel = CancellationToken::new();
            let (settle_tx, settle_rx) = oneshot::channel();
            *active = Some(ActiveLink {
                link: link.clone(),
                cancel: cancel.clone(),
            });
            tokio::spawn(run_event_pump(
                Arc::downgrade(&self.shared),
                link,
                event_rx,
                cancel,
                settle_tx,
            ));
            settle_rx
        };

        match tokio::time::timeout(options.connect_timeout, settled).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::Transport(
                "link closed before the broker answered".to_string(),
            )),
            Err(_) => {
                let err = Error::Timeout(options.connect_timeout);
                warn!("{}", err);
                self.shared.record_error(&err);
                Err(err)
            }
        }
    }

    /// Tears the connection down and forgets every subscription.
    ///
    /// No unsubscribe is sent since the connection goes away with it. Calling this
    /// while disconnected does nothing.
    pub fn disconnect(&self) {
        let Some(active) = self.shared.active.lock().take() else {
            debug!("Disconnect requested without an MQTT link");
            return;
        };

        active.shutdown();
        self.shared.router.clear_subscriptions();
        self.shared
            .update(|status| status.state = ConnectionState::Disconnected);
        info!("MQTT client disconnected");
    }

    pub async fn subscribe(
        &self,
        topic: &str,
        callback: Arc<dyn MessageCallback>,
    ) -> Result<CallbackId> {
        self.subscribe_with_qos(topic, QoS::default(), callback).await
    }

    /// Registers `callback` for messages on exactly `topic`.
    ///
    /// Only the first callback of a topic causes a wire subscription; the call then
    /// resolves once the broker acknowledged it. Registering the same `Arc` twice
    /// returns the existing token.
    pub async fn subscribe_with_qos(
        &self,
        topic: &str,
        qos: QoS,
        callback: Arc<dyn MessageCallback>,
    ) -> Result<CallbackId> {
        let link = self.connected_link()?;
        let result = self
            .shared
            .router
            .subscribe(&link, topic, qos, callback)
            .await;
        if let Err(e) = &result {
            self.shared.record_error(e);
        }
        result
    }

    pub async fn subscribe_fn<F>(&self, topic: &str, callback: F) -> Result<CallbackId>
    where
        F: Fn(&str, &str) -> color_eyre::Result<()> + Send + Sync + 'static,
    {
        self.subscribe(topic, Arc::new(callback)).await
    }

    /// Removes one callback, or all callbacks of `topic` when `callback` is `None`.
    /// Never fails.
    pub async fn unsubscribe(&self, topic: &str, callback: Option<CallbackId>) {
        let link = self
            .shared
            .active
            .lock()
            .as_ref()
            .map(|active| active.link.clone());
        self.shared
            .router
            .unsubscribe(link.as_deref(), topic, callback)
            .await;
    }

    /// Queues a message for `topic`.
    ///
    /// Only fails when there is no live connection. Transport failures are logged
    /// and recorded in the status, not returned.
    pub fn publish(
        &self,
        topic: &str,
        payload: impl Into<Payload>,
        options: PublishOptions,
    ) -> Result<()> {
        let link = self.connected_link()?;
        let text = payload.into().into_text();

        match link.publish(topic, Bytes::from(text.clone()), &options) {
            Ok(()) => {
                debug!("Published to {}: {}", topic, text);
                self.shared.update(|status| {
                    status.messages_sent += 1;
                    status.last_activity = Some(Local::now());
                });
            }
            Err(e) => {
                error!("Failed to publish to {}: {}", topic, e);
                self.shared.record_error(&e);
            }
        }
        Ok(())
    }

    /// History snapshot, newest first, optionally limited to one topic.
    pub fn messages(&self, topic: Option<&str>) -> Vec<ReceivedMessage> {
        self.shared.router.messages(topic)
    }

    pub fn clear_messages(&self, topic: Option<&str>) {
        self.shared.router.clear_messages(topic);
    }

    pub fn status(&self) -> ConnectionStatus {
        self.shared.status.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.shared.status.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.shared.status.borrow().is_connected()
    }

    pub fn router(&self) -> &SubscriptionRouter {
        &self.shared.router
    }

    fn connected_link(&self) -> Result<Arc<dyn Link>> {
        let link = self
            .shared
            .active
            .lock()
            .as_ref()
            .map(|active| active.link.clone());
        match link {
            Some(link) if self.is_connected() => Ok(link),
            _ => Err(Error::NotConnected),
        }
    }
}

/// Applies one link's transport events to the shared state until the link ends
/// or is replaced.
async fn run_event_pump(
    shared: Weak<Shared>,
    link: Arc<dyn Link>,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
    cancel: CancellationToken,
    settle: oneshot::Sender<Result<()>>,
) {
    let mut settle = Some(settle);

    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        let Some(shared) = shared.upgrade() else {
            break;
        };

        match event {
            TransportEvent::Connected => {
                info!("MQTT Connected");
                // Pending before anyone can observe the connected state.
                shared.resubscribe(&link);
                shared.update(|status| {
                    status.state = ConnectionState::Connected;
                    status.last_error = None;
                    status.last_activity = Some(Local::now());
                });
                if let Some(tx) = settle.take() {
                    let _ = tx.send(Ok(()));
                }
            }
            TransportEvent::Error(reason) => {
                error!("MQTT Error: {}", reason);
                shared.update(|status| {
                    status.state = ConnectionState::Disconnected;
                    status.last_error = Some(reason.clone());
                });
                if let Some(tx) = settle.take() {
                    let _ = tx.send(Err(Error::Transport(reason)));
                }
            }
            TransportEvent::Closed => {
                info!("MQTT Disconnected");
                shared.update(|status| status.state = ConnectionState::Disconnected);
            }
            TransportEvent::Reconnecting => {
                info!("MQTT Reconnecting...");
                shared.update(|status| status.state = ConnectionState::Reconnecting);
            }
            TransportEvent::Message { topic, payload } => {
                let report = shared.router.dispatch(&topic, &payload);
                shared.update(|status| {
                    status.messages_received += 1;
                    status.last_activity = Some(Local::now());
                    if let Some(failure) = report.failures.last() {
                        status.last_error = Some(failure.clone());
                    }
                });
            }
        }
    }

    debug!("MQTT event pump stopped");
}
