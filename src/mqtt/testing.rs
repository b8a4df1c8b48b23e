//! Scripted in-memory transport for unit tests.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

use super::config::{ConnectOptions, PublishOptions, QoS};
use super::transport::{Connector, Link, TransportEvent};
use crate::error::{Error, Result};

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Call {
    Subscribe(String),
    Unsubscribe(String),
    Publish {
        topic: String,
        payload: String,
        retain: bool,
    },
    End,
}

/// What the fake reports right after `connect`.
#[derive(Clone, Debug)]
enum Reply {
    Connect,
    Fail(String),
    Silent,
}

struct FakeState {
    reply: Reply,
    events: Mutex<Option<mpsc::UnboundedSender<TransportEvent>>>,
    calls: Mutex<Vec<Call>>,
    rejected: Mutex<HashSet<String>>,
    fail_unsubscribe: AtomicBool,
    connects: AtomicUsize,
    /// Subscribe acknowledgements are withheld while this is `false`.
    acks_open: watch::Sender<bool>,
}

#[derive(Clone)]
pub(crate) struct FakeConnector {
    state: Arc<FakeState>,
}

impl FakeConnector {
    fn with_reply(reply: Reply) -> Self {
        Self {
            state: Arc::new(FakeState {
                reply,
                events: Mutex::new(None),
                calls: Mutex::new(Vec::new()),
                rejected: Mutex::new(HashSet::new()),
                fail_unsubscribe: AtomicBool::new(false),
                connects: AtomicUsize::new(0),
                acks_open: watch::Sender::new(true),
            }),
        }
    }

    /// Acknowledges every connection immediately.
    pub fn new() -> Self {
        Self::with_reply(Reply::Connect)
    }

    /// Reports `reason` as a connection error.
    pub fn failing(reason: &str) -> Self {
        Self::with_reply(Reply::Fail(reason.to_string()))
    }

    /// Never answers on its own; tests drive it with [`FakeConnector::emit`].
    pub fn silent() -> Self {
        Self::with_reply(Reply::Silent)
    }

    pub fn link(&self) -> Arc<dyn Link> {
        Arc::new(FakeLink {
            state: self.state.clone(),
        })
    }

    /// Sends an event on the most recent link.
    pub fn emit(&self, event: TransportEvent) {
        if let Some(events) = self.state.events.lock().as_ref() {
            let _ = events.send(event);
        }
    }

    pub fn message(&self, topic: &str, payload: &str) {
        self.emit(TransportEvent::Message {
            topic: topic.to_string(),
            payload: Bytes::copy_from_slice(payload.as_bytes()),
        });
    }

    pub fn reject(&self, topic: &str) {
        self.state.rejected.lock().insert(topic.to_string());
    }

    /// Keeps subscribe calls waiting for their acknowledgement until
    /// [`FakeConnector::release_acks`].
    pub fn hold_acks(&self) {
        self.state.acks_open.send_replace(false);
    }

    pub fn release_acks(&self) {
        self.state.acks_open.send_replace(true);
    }

    pub fn fail_unsubscribe(&self) {
        self.state.fail_unsubscribe.store(true, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.calls.lock().clone()
    }

    pub fn subscribe_calls(&self, topic: &str) -> usize {
        self.state
            .calls
            .lock()
            .iter()
            .filter(|c| matches!(c, Call::Subscribe(t) if t == topic))
            .count()
    }

    pub fn connects(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }
}

impl Connector for FakeConnector {
    fn connect(
        &self,
        _options: &ConnectOptions,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Arc<dyn Link>> {
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        match &self.state.reply {
            Reply::Connect => {
                let _ = events.send(TransportEvent::Connected);
            }
            Reply::Fail(reason) => {
                let _ = events.send(TransportEvent::Error(reason.clone()));
            }
            Reply::Silent => {}
        }
        *self.state.events.lock() = Some(events);
        Ok(self.link())
    }
}

struct FakeLink {
    state: Arc<FakeState>,
}

#[async_trait]
impl Link for FakeLink {
    async fn subscribe(&self, topic: &str, _qos: QoS) -> Result<()> {
        self.state
            .calls
            .lock()
            .push(Call::Subscribe(topic.to_string()));
        let mut acks_open = self.state.acks_open.subscribe();
        if acks_open.wait_for(|open| *open).await.is_err() {
            return Err(Error::Transport("connection closed".to_string()));
        }
        if self.state.rejected.lock().contains(topic) {
            return Err(Error::Transport("Not authorized".to_string()));
        }
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<()> {
        self.state
            .calls
            .lock()
            .push(Call::Unsubscribe(topic.to_string()));
        if self.state.fail_unsubscribe.load(Ordering::SeqCst) {
            return Err(Error::Transport("request queue closed".to_string()));
        }
        Ok(())
    }

    fn publish(&self, topic: &str, payload: Bytes, options: &PublishOptions) -> Result<()> {
        self.state.calls.lock().push(Call::Publish {
            topic: topic.to_string(),
            payload: String::from_utf8_lossy(&payload).into_owned(),
            retain: options.retain,
        });
        Ok(())
    }

    fn end(&self) {
        self.state.calls.lock().push(Call::End);
    }
}
