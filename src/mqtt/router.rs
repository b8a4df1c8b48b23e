//! Topic → callback routing on top of a single link.
//!
//! The router keeps one registration list per topic and a global message history.
//! It never interprets payloads: callbacks receive the payload as text together
//! with the topic it arrived on.
//!
//! Every topic entry also tracks its wire subscription on the current link. The
//! first callback of a topic starts it; everyone registering before the broker
//! answered waits for the same answer, and a rejection removes the whole entry.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::config::QoS;
use super::history::{MessageHistory, ReceivedMessage};
use super::transport::Link;
use crate::error::{Error, Result};

/// Receives every message delivered on a subscribed topic.
///
/// Returning an error (or panicking) is logged by the router and does not keep
/// other callbacks on the same topic from running.
pub trait MessageCallback: Send + Sync {
    fn on_message(&self, payload: &str, topic: &str) -> color_eyre::Result<()>;
}

impl<F> MessageCallback for F
where
    F: Fn(&str, &str) -> color_eyre::Result<()> + Send + Sync,
{
    fn on_message(&self, payload: &str, topic: &str) -> color_eyre::Result<()> {
        self(payload, topic)
    }
}

/// Token identifying one registration, used to unsubscribe exactly that callback.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CallbackId(u64);

impl fmt::Display for CallbackId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "cb#{}", self.0)
    }
}

/// State of a topic's subscription on the wire.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum WireState {
    Pending,
    Active,
    Failed(Error),
}

/// Completion side of a wire subscribe, held by the task that performs it.
pub(crate) struct PendingWire {
    generation: u64,
    done: watch::Sender<WireState>,
}

struct Registration {
    id: CallbackId,
    callback: Arc<dyn MessageCallback>,
}

struct TopicEntry {
    qos: QoS,
    /// Changes whenever a new wire subscribe is started for this entry.
    generation: u64,
    wire: watch::Receiver<WireState>,
    registrations: Vec<Registration>,
}

impl TopicEntry {
    fn new(qos: QoS, generation: u64) -> (Self, PendingWire) {
        let (done, wire) = watch::channel(WireState::Pending);
        let entry = TopicEntry {
            qos,
            generation,
            wire,
            registrations: Vec::new(),
        };
        (entry, PendingWire { generation, done })
    }

    fn restart_wire(&mut self, generation: u64) -> PendingWire {
        let (done, wire) = watch::channel(WireState::Pending);
        self.generation = generation;
        self.wire = wire;
        PendingWire { generation, done }
    }
}

type Table = Arc<Mutex<HashMap<String, TopicEntry>>>;

/// Outcome of adding a callback to the table.
pub(crate) struct Registered {
    pub id: CallbackId,
    /// Set when the topic had no entry before; the caller must start the wire
    /// subscription with it.
    pub first_for_topic: Option<PendingWire>,
    /// `false` when the very same callback was already registered on the topic.
    pub newly_added: bool,
    /// Resolves once the broker answered the topic's current wire subscribe.
    pub wire: watch::Receiver<WireState>,
}

/// Result of delivering one inbound message.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: usize,
    pub failures: Vec<String>,
}

pub struct SubscriptionRouter {
    table: Table,
    history: Mutex<MessageHistory>,
    next_id: AtomicU64,
}

impl Default for SubscriptionRouter {
    fn default() -> Self {
        Self::new(super::history::DEFAULT_HISTORY_LIMIT)
    }
}

impl SubscriptionRouter {
    pub fn new(history_limit: usize) -> Self {
        Self {
            table: Arc::new(Mutex::new(HashMap::new())),
            history: Mutex::new(MessageHistory::new(history_limit)),
            next_id: AtomicU64::new(1),
        }
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Adds `callback` to `topic` unless that exact callback is already there.
    pub(crate) fn register(
        &self,
        topic: &str,
        qos: QoS,
        callback: Arc<dyn MessageCallback>,
    ) -> Registered {
        let mut table = self.table.lock();
        let mut first_for_topic = None;
        let entry = table.entry(topic.to_string()).or_insert_with(|| {
            let (entry, pending) = TopicEntry::new(qos, self.next_id());
            first_for_topic = Some(pending);
            entry
        });

        if let Some(existing) = entry
            .registrations
            .iter()
            .find(|r| Arc::ptr_eq(&r.callback, &callback))
        {
            return Registered {
                id: existing.id,
                first_for_topic: None,
                newly_added: false,
                wire: entry.wire.clone(),
            };
        }

        let id = CallbackId(self.next_id());
        entry.registrations.push(Registration { id, callback });
        Registered {
            id,
            first_for_topic,
            newly_added: true,
            wire: entry.wire.clone(),
        }
    }

    /// Removes one registration. Returns `true` if the topic entry is gone as a result.
    pub(crate) fn deregister(&self, topic: &str, id: CallbackId) -> bool {
        let mut table = self.table.lock();
        let Some(entry) = table.get_mut(topic) else {
            return false;
        };

        entry.registrations.retain(|r| r.id != id);
        if entry.registrations.is_empty() {
            table.remove(topic);
            true
        } else {
            false
        }
    }

    /// Registers `callback` and resolves once the topic's wire subscription is
    /// acknowledged.
    ///
    /// Only the first callback of a topic subscribes on the wire; later ones wait
    /// for that same acknowledgement. The callback is eligible for dispatch as soon
    /// as it is registered. A rejected subscription removes the topic entry and
    /// fails every waiting call.
    ///
    /// The wire subscribe runs in its own task, so dropping the returned future
    /// does not leave the entry half-subscribed.
    pub async fn subscribe(
        &self,
        link: &Arc<dyn Link>,
        topic: &str,
        qos: QoS,
        callback: Arc<dyn MessageCallback>,
    ) -> Result<CallbackId> {
        let registered = self.register(topic, qos, callback);
        match registered.first_for_topic {
            Some(pending) => self.start_wire_subscribe(link.clone(), topic, qos, pending),
            None if registered.newly_added => {
                debug!("Added callback {} to topic {}", registered.id, topic)
            }
            None => debug!("Callback {} already registered on {}", registered.id, topic),
        }

        if let Err(e) = wait_for_wire(registered.wire).await {
            self.deregister(topic, registered.id);
            return Err(e);
        }
        Ok(registered.id)
    }

    /// Subscribes every known topic again on `link`, e.g. after the broker session
    /// was lost. Returns the number of topics.
    pub(crate) fn resubscribe_all(&self, link: &Arc<dyn Link>) -> usize {
        let restarted: Vec<(String, QoS, PendingWire)> = {
            let mut table = self.table.lock();
            table
                .iter_mut()
                .map(|(topic, entry)| {
                    let pending = entry.restart_wire(self.next_id());
                    (topic.clone(), entry.qos, pending)
                })
                .collect()
        };

        let count = restarted.len();
        for (topic, qos, pending) in restarted {
            self.start_wire_subscribe(link.clone(), &topic, qos, pending);
        }
        count
    }

    fn start_wire_subscribe(
        &self,
        link: Arc<dyn Link>,
        topic: &str,
        qos: QoS,
        pending: PendingWire,
    ) {
        let table = self.table.clone();
        let topic = topic.to_string();
        tokio::spawn(async move {
            let state = match link.subscribe(&topic, qos).await {
                Ok(()) => {
                    info!("Subscribed to topic: {}", topic);
                    WireState::Active
                }
                Err(e) => {
                    error!("Failed to subscribe to {}: {}", topic, e);
                    remove_generation(&table, &topic, pending.generation);
                    WireState::Failed(e)
                }
            };
            pending.done.send_replace(state);
        });
    }

    /// Removes one callback (`Some(id)`) or every callback (`None`) of a topic.
    ///
    /// The wire subscription is dropped once the topic has no callbacks left.
    /// Transport failures are logged and swallowed.
    pub async fn unsubscribe(
        &self,
        link: Option<&dyn Link>,
        topic: &str,
        id: Option<CallbackId>,
    ) {
        let emptied = match id {
            Some(id) => self.deregister(topic, id),
            None => self.table.lock().remove(topic).is_some(),
        };
        if !emptied {
            return;
        }

        match link {
            Some(link) => match link.unsubscribe(topic).await {
                Ok(()) => info!("Unsubscribed from topic: {}", topic),
                Err(e) => warn!("Failed to unsubscribe from {}: {}", topic, e),
            },
            None => debug!("Dropped {} without a link to unsubscribe on", topic),
        }
    }

    /// Records an inbound message and hands it to every callback of its topic.
    pub fn dispatch(&self, topic: &str, payload: &[u8]) -> DispatchReport {
        let text = String::from_utf8_lossy(payload).into_owned();
        self.history
            .lock()
            .record(ReceivedMessage::from_topic(topic, text.clone()));

        // Snapshot so callbacks run without the table lock and may (un)subscribe.
        let callbacks: Vec<Arc<dyn MessageCallback>> = match self.table.lock().get(topic) {
            Some(entry) => entry
                .registrations
                .iter()
                .map(|r| r.callback.clone())
                .collect(),
            None => {
                debug!("No callbacks for topic: {}", topic);
                return DispatchReport::default();
            }
        };

        let mut report = DispatchReport::default();
        for callback in callbacks {
            let outcome =
                panic::catch_unwind(AssertUnwindSafe(|| callback.on_message(&text, topic)));
            let failure = match outcome {
                Ok(Ok(())) => {
                    report.delivered += 1;
                    continue;
                }
                Ok(Err(e)) => e.to_string(),
                Err(panic) => format!("callback panicked: {}", panic_message(panic.as_ref())),
            };
            error!("Error in message callback for {}: {}", topic, failure);
            report.failures.push(failure);
        }
        report
    }

    pub fn messages(&self, topic: Option<&str>) -> Vec<ReceivedMessage> {
        self.history.lock().snapshot(topic)
    }

    pub fn clear_messages(&self, topic: Option<&str>) {
        self.history.lock().clear(topic);
    }

    /// Forgets every registration without touching the wire.
    pub fn clear_subscriptions(&self) {
        self.table.lock().clear();
    }

    /// Subscribed topics with the QoS their wire subscription was made with.
    pub fn topics(&self) -> Vec<(String, QoS)> {
        self.table
            .lock()
            .iter()
            .map(|(topic, entry)| (topic.clone(), entry.qos))
            .collect()
    }

    pub fn callback_count(&self, topic: &str) -> usize {
        self.table
            .lock()
            .get(topic)
            .map_or(0, |entry| entry.registrations.len())
    }

    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.table.lock().contains_key(topic)
    }
}

/// Drops the entry of `topic` if its wire subscribe is still the one identified by
/// `generation`.
fn remove_generation(table: &Table, topic: &str, generation: u64) {
    let mut table = table.lock();
    if table
        .get(topic)
        .is_some_and(|entry| entry.generation == generation)
    {
        table.remove(topic);
    }
}

async fn wait_for_wire(mut wire: watch::Receiver<WireState>) -> Result<()> {
    let answered = wire
        .wait_for(|state| *state != WireState::Pending)
        .await
        .map(|state| state.clone());
    match answered {
        Ok(WireState::Failed(e)) => Err(e),
        Ok(_) => Ok(()),
        Err(_) => Err(Error::Transport(
            "subscription ended before the broker answered".to_string(),
        )),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::testing::{Call, FakeConnector};
    use color_eyre::eyre::eyre;
    use std::sync::atomic::AtomicUsize;

    fn counter() -> (Arc<AtomicUsize>, Arc<dyn MessageCallback>) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let callback: Arc<dyn MessageCallback> =
            Arc::new(move |_: &str, _: &str| -> color_eyre::Result<()> {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        (count, callback)
    }

    #[tokio::test]
    async fn test_first_callback_subscribes_on_wire_once() {
        let fake = FakeConnector::new();
        let link = fake.link();
        let router = SubscriptionRouter::default();
        let (_, a) = counter();
        let (_, b) = counter();

        let id_a = router.subscribe(&link, "t", QoS::AtMostOnce, a).await.unwrap();
        let id_b = router.subscribe(&link, "t", QoS::AtMostOnce, b).await.unwrap();

        assert_ne!(id_a, id_b);
        assert_eq!(fake.subscribe_calls("t"), 1);
        assert_eq!(router.callback_count("t"), 2);
    }

    #[tokio::test]
    async fn test_same_callback_twice_is_idempotent() {
        let fake = FakeConnector::new();
        let link = fake.link();
        let router = SubscriptionRouter::default();
        let (count, callback) = counter();

        let first = router
            .subscribe(&link, "t", QoS::AtMostOnce, callback.clone())
            .await
            .unwrap();
        let second = router
            .subscribe(&link, "t", QoS::AtMostOnce, callback)
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(fake.subscribe_calls("t"), 1);

        router.dispatch("t", b"x");
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_rejected_subscribe_leaves_table_unchanged() {
        let fake = FakeConnector::new();
        fake.reject("secret/#");
        let link = fake.link();
        let router = SubscriptionRouter::default();
        let (_, callback) = counter();

        let result = router
            .subscribe(&link, "secret/#", QoS::AtMostOnce, callback)
            .await;

        assert!(matches!(result, Err(crate::Error::Transport(_))));
        assert!(!router.is_subscribed("secret/#"));
        assert!(router.topics().is_empty());
    }

    #[tokio::test]
    async fn test_rejection_fails_every_waiting_subscriber() {
        let fake = FakeConnector::new();
        fake.hold_acks();
        fake.reject("t");
        let link = fake.link();
        let router = SubscriptionRouter::default();
        let (_, a) = counter();
        let (_, b) = counter();

        let first = router.subscribe(&link, "t", QoS::AtMostOnce, a);
        let second = router.subscribe(&link, "t", QoS::AtMostOnce, b);
        let release = async {
            tokio::task::yield_now().await;
            assert_eq!(router.callback_count("t"), 2);
            fake.release_acks();
        };
        let (first, second, ()) = tokio::join!(first, second, release);

        assert!(matches!(first, Err(crate::Error::Transport(_))));
        assert!(matches!(second, Err(crate::Error::Transport(_))));
        assert!(!router.is_subscribed("t"));
        assert_eq!(fake.subscribe_calls("t"), 1);
    }

    #[tokio::test]
    async fn test_later_subscriber_waits_for_the_same_ack() {
        let fake = FakeConnector::new();
        fake.hold_acks();
        let link = fake.link();
        let router = SubscriptionRouter::default();
        let (_, a) = counter();
        let (_, b) = counter();

        let first = router.subscribe(&link, "t", QoS::AtMostOnce, a);
        let second = router.subscribe(&link, "t", QoS::AtMostOnce, b);
        let release = async {
            tokio::task::yield_now().await;
            fake.release_acks();
        };
        let (first, second, ()) = tokio::join!(first, second, release);

        assert!(first.is_ok());
        assert!(second.is_ok());
        assert_eq!(fake.subscribe_calls("t"), 1);
        assert_eq!(router.callback_count("t"), 2);
    }

    #[tokio::test]
    async fn test_resubscribe_all_restarts_every_topic() {
        let fake = FakeConnector::new();
        let link = fake.link();
        let router = SubscriptionRouter::default();
        let (_, a) = counter();
        router.subscribe(&link, "a", QoS::AtLeastOnce, a.clone()).await.unwrap();
        router.subscribe(&link, "b", QoS::AtMostOnce, a).await.unwrap();

        fake.hold_acks();
        assert_eq!(router.resubscribe_all(&link), 2);

        // a new subscriber waits for the fresh wire subscription
        let (_, b) = counter();
        let pending = router.subscribe(&link, "a", QoS::AtMostOnce, b);
        let release = async {
            tokio::task::yield_now().await;
            fake.release_acks();
        };
        let (result, ()) = tokio::join!(pending, release);

        assert!(result.is_ok());
        assert_eq!(fake.subscribe_calls("a"), 2);
        assert_eq!(router.topics().len(), 2);
    }

    #[tokio::test]
    async fn test_unsubscribe_last_callback_drops_wire_subscription() {
        let fake = FakeConnector::new();
        let link = fake.link();
        let router = SubscriptionRouter::default();
        let (_, a) = counter();
        let (_, b) = counter();

        let id_a = router.subscribe(&link, "t", QoS::AtMostOnce, a).await.unwrap();
        let id_b = router.subscribe(&link, "t", QoS::AtMostOnce, b).await.unwrap();

        router.unsubscribe(Some(link.as_ref()), "t", Some(id_a)).await;
        assert!(router.is_subscribed("t"));
        assert!(!fake.calls().contains(&Call::Unsubscribe("t".into())));

        router.unsubscribe(Some(link.as_ref()), "t", Some(id_b)).await;
        assert!(!router.is_subscribed("t"));
        assert_eq!(
            fake.calls()
                .iter()
                .filter(|c| **c == Call::Unsubscribe("t".into()))
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn test_unsubscribe_without_id_removes_topic() {
        let fake = FakeConnector::new();
        let link = fake.link();
        let router = SubscriptionRouter::default();
        let (_, a) = counter();
        let (_, b) = counter();

        router.subscribe(&link, "t", QoS::AtMostOnce, a).await.unwrap();
        router.subscribe(&link, "t", QoS::AtMostOnce, b).await.unwrap();
        router.unsubscribe(Some(link.as_ref()), "t", None).await;

        assert!(!router.is_subscribed("t"));
        assert!(fake.calls().contains(&Call::Unsubscribe("t".into())));
    }

    #[tokio::test]
    async fn test_unsubscribe_unknown_topic_is_noop() {
        let fake = FakeConnector::new();
        let link = fake.link();
        let router = SubscriptionRouter::default();

        router.unsubscribe(Some(link.as_ref()), "nope", None).await;
        router
            .unsubscribe(Some(link.as_ref()), "nope", Some(CallbackId(42)))
            .await;

        assert!(fake.calls().is_empty());
    }

    #[tokio::test]
    async fn test_unsubscribe_swallows_transport_errors() {
        let fake = FakeConnector::new();
        let link = fake.link();
        let router = SubscriptionRouter::default();
        let (_, a) = counter();

        let id = router.subscribe(&link, "t", QoS::AtMostOnce, a).await.unwrap();
        fake.fail_unsubscribe();
        router.unsubscribe(Some(link.as_ref()), "t", Some(id)).await;

        assert!(!router.is_subscribed("t"));
    }

    #[tokio::test]
    async fn test_table_key_exists_iff_callbacks_remain() {
        let fake = FakeConnector::new();
        let link = fake.link();
        let router = SubscriptionRouter::default();
        let mut live: Vec<CallbackId> = Vec::new();

        // interleave adds and removals, checking the invariant after every step
        for step in 0..40u32 {
            if step % 3 == 2 && !live.is_empty() {
                let id = live.remove((step as usize) % live.len());
                router.unsubscribe(Some(link.as_ref()), "t", Some(id)).await;
            } else {
                let (_, callback) = counter();
                let id = router
                    .subscribe(&link, "t", QoS::AtMostOnce, callback)
                    .await
                    .unwrap();
                live.push(id);
            }
            assert_eq!(router.is_subscribed("t"), !live.is_empty());
            assert_eq!(router.callback_count("t"), live.len());
        }

        for id in live.drain(..) {
            router.unsubscribe(Some(link.as_ref()), "t", Some(id)).await;
        }
        assert!(!router.is_subscribed("t"));
    }

    #[test]
    fn test_dispatch_passes_text_and_topic() {
        let router = SubscriptionRouter::default();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        router.register(
            "sensors/temp",
            QoS::AtMostOnce,
            Arc::new(move |payload: &str, topic: &str| -> color_eyre::Result<()> {
                s.lock().push((payload.to_string(), topic.to_string()));
                Ok(())
            }),
        );

        let report = router.dispatch("sensors/temp", b"21.5");

        assert_eq!(report.delivered, 1);
        assert_eq!(
            *seen.lock(),
            vec![("21.5".to_string(), "sensors/temp".to_string())]
        );
    }

    #[test]
    fn test_failing_callbacks_do_not_stop_dispatch() {
        let router = SubscriptionRouter::default();
        let (count, good) = counter();
        router.register(
            "t",
            QoS::AtMostOnce,
            Arc::new(|_: &str, _: &str| -> color_eyre::Result<()> { Err(eyre!("bad payload")) }),
        );
        router.register(
            "t",
            QoS::AtMostOnce,
            Arc::new(|_: &str, _: &str| -> color_eyre::Result<()> { panic!("boom") }),
        );
        router.register("t", QoS::AtMostOnce, good);

        let report = router.dispatch("t", b"x");

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(report.delivered, 1);
        assert_eq!(report.failures.len(), 2);
        assert!(report.failures[1].contains("boom"));
        assert_eq!(router.messages(None).len(), 1);
    }

    #[test]
    fn test_history_recorded_without_subscribers() {
        let router = SubscriptionRouter::default();

        let report = router.dispatch("nobody/listens", b"hello");

        assert_eq!(report, DispatchReport::default());
        assert_eq!(router.messages(Some("nobody/listens"))[0].payload, "hello");
    }

    #[test]
    fn test_exact_topic_match_only() {
        let router = SubscriptionRouter::default();
        let (count, callback) = counter();
        router.register("home/+/temp", QoS::AtMostOnce, callback);

        router.dispatch("home/kitchen/temp", b"1");
        assert_eq!(count.load(Ordering::SeqCst), 0);

        router.dispatch("home/+/temp", b"1");
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_callback_may_unsubscribe_during_dispatch() {
        let router = Arc::new(SubscriptionRouter::default());
        let r = router.clone();
        let registered = router.register(
            "t",
            QoS::AtMostOnce,
            Arc::new(move |_: &str, topic: &str| -> color_eyre::Result<()> {
                r.clear_subscriptions();
                assert!(!r.is_subscribed(topic));
                Ok(())
            }),
        );
        assert!(registered.first_for_topic.is_some());

        let report = router.dispatch("t", b"x");
        assert_eq!(report.delivered, 1);
        assert!(!router.is_subscribed("t"));
    }

    #[test]
    fn test_non_utf8_payload_is_lossy_text() {
        let router = SubscriptionRouter::default();
        router.dispatch("bin", &[0x66, 0xFF, 0x6F]);

        assert_eq!(router.messages(None)[0].payload, "f\u{FFFD}o");
    }

    #[test]
    fn test_history_limit_applies() {
        let router = SubscriptionRouter::new(100);
        for i in 1..=150 {
            router.dispatch("t", format!("{}", i).as_bytes());
        }

        let messages = router.messages(None);
        assert_eq!(messages.len(), 100);
        assert_eq!(messages[0].payload, "150");
        assert_eq!(messages[99].payload, "51");

        router.clear_messages(Some("t"));
        assert!(router.messages(None).is_empty());
    }
}
