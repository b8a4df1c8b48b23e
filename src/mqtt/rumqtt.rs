//! [`Connector`] backed by `rumqttc`.
//!
//! Each link owns one `rumqttc` event loop driven by a background task. The task
//! translates packets into [`TransportEvent`]s, pairs subscribe requests with their
//! SUBACKs and applies the [`ReconnectPolicy`] after failures.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use rumqttc::{
    AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, SubAck, SubscribeReasonCode,
    Transport,
};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use super::config::{ConnectOptions, PublishOptions, QoS, ReconnectPolicy};
use super::transport::{Connector, Link, TransportEvent};
use crate::error::{Error, Result};

/// Time the event loop gets to flush a DISCONNECT before it is stopped.
const DISCONNECT_GRACE: Duration = Duration::from_millis(500);

/// Opens links with `rumqttc`.
#[derive(Clone, Debug)]
pub struct RumqttConnector {
    /// Capacity of the client's request queue.
    pub request_capacity: usize,
}

impl Default for RumqttConnector {
    fn default() -> Self {
        Self {
            request_capacity: 100,
        }
    }
}

impl Connector for RumqttConnector {
    fn connect(
        &self,
        options: &ConnectOptions,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Arc<dyn Link>> {
        let mqtt_options = mqtt_options(options)?;
        let (broker, port) = mqtt_options.broker_address();
        info!(
            "Opening MQTT link to {}:{} as {}",
            broker,
            port,
            mqtt_options.client_id()
        );

        let (client, eventloop) = AsyncClient::new(mqtt_options, self.request_capacity);
        let acks = Arc::new(SubscribeAcks::default());
        let cancel = CancellationToken::new();

        tokio::spawn(drive(
            eventloop,
            events,
            acks.clone(),
            options.reconnect.clone(),
            cancel.clone(),
        ));

        Ok(Arc::new(RumqttLink {
            client,
            acks,
            send_order: tokio::sync::Mutex::new(()),
            cancel,
        }))
    }
}

/// Translates [`ConnectOptions`] into `rumqttc` options.
///
/// Supported schemes are `mqtt`/`tcp`, `mqtts`/`ssl`, `ws` and `wss`.
pub(crate) fn mqtt_options(options: &ConnectOptions) -> Result<MqttOptions> {
    let raw = options.url.trim();
    if raw.is_empty() {
        return Err(Error::ConfigurationMissing);
    }

    let url = Url::parse(raw).map_err(|e| Error::InvalidBrokerUrl(format!("{}: {}", raw, e)))?;
    let host = url
        .host_str()
        .ok_or_else(|| Error::InvalidBrokerUrl(format!("{}: missing host", raw)))?;
    let client_id = options.client_id_or_random();

    let mut mqtt_options = match url.scheme() {
        "mqtt" | "tcp" => MqttOptions::new(client_id, host, url.port().unwrap_or(1883)),
        "mqtts" | "ssl" => {
            let mut opts = MqttOptions::new(client_id, host, url.port().unwrap_or(8883));
            opts.set_transport(Transport::tls_with_default_config());
            opts
        }
        "ws" => {
            let mut opts = MqttOptions::new(client_id, url.as_str(), url.port().unwrap_or(80));
            opts.set_transport(Transport::Ws);
            opts
        }
        "wss" => {
            let mut opts = MqttOptions::new(client_id, url.as_str(), url.port().unwrap_or(443));
            opts.set_transport(Transport::wss_with_default_config());
            opts
        }
        other => {
            return Err(Error::InvalidBrokerUrl(format!(
                "{}: unsupported scheme '{}'",
                raw, other
            )))
        }
    };

    mqtt_options
        .set_keep_alive(options.keep_alive)
        .set_clean_session(options.clean_session);

    if let Some(username) = &options.username {
        let password = options.password.clone().unwrap_or_default();
        mqtt_options.set_credentials(username.clone(), password);
    }

    Ok(mqtt_options)
}

type AckSender = oneshot::Sender<Result<()>>;

/// Pairs subscribe calls with the SUBACKs that answer them.
///
/// A waiter is queued before its request enters the client's request channel. The
/// event loop emits `Outgoing::Subscribe(pkid)` in request order, at which point
/// the front waiter is bound to that packet id.
#[derive(Default)]
struct SubscribeAcks {
    state: Mutex<AckState>,
}

#[derive(Default)]
struct AckState {
    queued: VecDeque<AckSender>,
    in_flight: HashMap<u16, AckSender>,
}

impl SubscribeAcks {
    fn enqueue(&self) -> oneshot::Receiver<Result<()>> {
        let (tx, rx) = oneshot::channel();
        self.state.lock().queued.push_back(tx);
        rx
    }

    /// Drops the most recently queued waiter whose request never left.
    fn discard_last(&self) {
        self.state.lock().queued.pop_back();
    }

    fn assign(&self, pkid: u16) {
        let mut state = self.state.lock();
        if let Some(tx) = state.queued.pop_front() {
            state.in_flight.insert(pkid, tx);
        }
    }

    fn complete(&self, ack: &SubAck) {
        let Some(tx) = self.state.lock().in_flight.remove(&ack.pkid) else {
            debug!("SUBACK {} without a waiter", ack.pkid);
            return;
        };

        let rejected = ack
            .return_codes
            .iter()
            .any(|code| matches!(code, SubscribeReasonCode::Failure));
        let result = if rejected {
            Err(Error::Transport("broker rejected the subscription".to_string()))
        } else {
            Ok(())
        };
        let _ = tx.send(result);
    }

    fn fail_all(&self, reason: &str) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let queued = state.queued.drain(..);
        let in_flight = std::mem::take(&mut state.in_flight).into_values();
        for tx in queued.chain(in_flight) {
            let _ = tx.send(Err(Error::Transport(reason.to_string())));
        }
    }
}

struct RumqttLink {
    client: AsyncClient,
    acks: Arc<SubscribeAcks>,
    /// Keeps waiter order and request order identical.
    send_order: tokio::sync::Mutex<()>,
    cancel: CancellationToken,
}

#[async_trait]
impl Link for RumqttLink {
    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<()> {
        let ack = {
            let _order = self.send_order.lock().await;
            let ack = self.acks.enqueue();
            if let Err(e) = self.client.subscribe(topic, qos.into()).await {
                self.acks.discard_last();
                return Err(Error::Transport(e.to_string()));
            }
            ack
        };

        ack.await.map_err(|_| {
            Error::Transport(
                "connection closed before the subscription was acknowledged".to_string(),
            )
        })?
    }

    async fn unsubscribe(&self, topic: &str) -> Result<()> {
        self.client
            .unsubscribe(topic)
            .await
            .map_err(|e| Error::Transport(e.to_string()))
    }

    fn publish(&self, topic: &str, payload: Bytes, options: &PublishOptions) -> Result<()> {
        self.client
            .try_publish(topic, options.qos.into(), options.retain, payload.to_vec())
            .map_err(|e| Error::Transport(e.to_string()))
    }

    fn end(&self) {
        if let Err(e) = self.client.try_disconnect() {
            debug!("Could not queue DISCONNECT: {}", e);
            self.cancel.cancel();
            return;
        }

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let cancel = self.cancel.clone();
                handle.spawn(async move {
                    tokio::time::sleep(DISCONNECT_GRACE).await;
                    cancel.cancel();
                });
            }
            Err(_) => self.cancel.cancel(),
        }
    }
}

async fn drive(
    mut eventloop: EventLoop,
    events: mpsc::UnboundedSender<TransportEvent>,
    acks: Arc<SubscribeAcks>,
    policy: ReconnectPolicy,
    cancel: CancellationToken,
) {
    let mut failures: u32 = 0;

    loop {
        let polled = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            polled = eventloop.poll() => polled,
        };

        let event = match polled {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                failures = 0;
                Some(TransportEvent::Connected)
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                debug!("Received message on topic: {}", publish.topic);
                Some(TransportEvent::Message {
                    topic: publish.topic,
                    payload: publish.payload,
                })
            }
            Ok(Event::Outgoing(Outgoing::Subscribe(pkid))) => {
                acks.assign(pkid);
                None
            }
            Ok(Event::Incoming(Packet::SubAck(ack))) => {
                acks.complete(&ack);
                None
            }
            Ok(Event::Incoming(Packet::Disconnect)) => Some(TransportEvent::Closed),
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                let _ = events.send(TransportEvent::Closed);
                break;
            }
            Ok(_) => None,
            Err(e) => {
                let reason = e.to_string();
                warn!("MQTT connection error: {}", reason);
                acks.fail_all(&reason);
                if events.send(TransportEvent::Error(reason)).is_err() {
                    break;
                }

                failures += 1;
                match policy.delay_for(failures) {
                    Some(delay) => {
                        tokio::select! {
                            biased;
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep(delay) => {}
                        }
                        info!("Reconnecting to MQTT broker (attempt {})", failures);
                        Some(TransportEvent::Reconnecting)
                    }
                    None => {
                        warn!("Giving up on MQTT broker after {} failed attempts", failures);
                        let _ = events.send(TransportEvent::Closed);
                        break;
                    }
                }
            }
        };

        if let Some(event) = event {
            if events.send(event).is_err() {
                debug!("Event receiver dropped, stopping MQTT event loop");
                break;
            }
        }
    }

    acks.fail_all("connection closed");
}
