//! Subscription deduplication and fan-out.
//!
//! Many views ask for the same data: a feed, a thread and a notification
//! panel can all request `{kinds:[1]}` from the same relays. The
//! [`SubscriptionManager`] collapses identical `(relay set, filter list)`
//! requests onto one live network subscription, fans incoming events out to
//! every attached listener, and closes the network side only when the last
//! listener is gone.
//!
//! # Fingerprints
//!
//! A subscription's identity is the canonical form of its request: the relay
//! set sorted and deduplicated, each filter canonical by construction (set
//! fields are ordered), and the filter list sorted by serialization. Two
//! requests that differ only in ordering share a fingerprint, and therefore
//! a network subscription.
//!
//! # EOSE Aggregation
//!
//! Each relay signals end-of-stored-events independently. Listeners get one
//! aggregate [`SubscriptionMessage::Eose`] when every relay has signaled (a
//! disconnected relay counts as signaled) or when `eose_timeout` elapses,
//! whichever comes first. One dead relay never stalls the rest.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::{counter, gauge};
use parking_lot::Mutex;
use remembrall_core::{Event, Filter};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::store::EventStore;
use crate::transport::{RelayTransport, RelayUrl, TransportMessage};

/// Configuration for the subscription manager.
#[derive(Debug, Clone)]
pub struct SubsConfig {
    /// Upper bound on waiting for per-relay EOSE signals before the
    /// aggregate EOSE is fired anyway.
    pub eose_timeout: Duration,

    /// Capacity of each listener's message channel. When a listener falls
    /// this far behind, events are dropped for it (and counted) rather than
    /// blocking delivery to the others.
    pub listener_capacity: usize,
}

impl Default for SubsConfig {
    fn default() -> Self {
        Self {
            eose_timeout: Duration::from_secs(5),
            listener_capacity: 256,
        }
    }
}

/// Messages delivered to a subscription listener.
#[derive(Debug, Clone)]
pub enum SubscriptionMessage {
    /// A matching event (cached replay or live from the network).
    Event(Arc<Event>),
    /// All stored events have been delivered; subsequent events are live.
    Eose,
}

/// A listener's handle on a (possibly shared) subscription.
///
/// Receive messages with [`Subscription::recv`]. Dropping the handle
/// detaches the listener; the underlying network subscription closes when
/// the last listener for its fingerprint is gone.
pub struct Subscription {
    id: u64,
    replay: VecDeque<SubscriptionMessage>,
    eose_replay: bool,
    rx: mpsc::Receiver<SubscriptionMessage>,
    _guard: ListenerGuard,
}

impl Subscription {
    /// Identifier of the underlying shared subscription (0 for local-only).
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Receive the next message.
    ///
    /// Replayed cache hits are delivered first, then live messages. Returns
    /// `None` once the subscription is closed and all messages are drained.
    pub async fn recv(&mut self) -> Option<SubscriptionMessage> {
        if let Some(message) = self.replay.pop_front() {
            return Some(message);
        }
        if self.eose_replay {
            self.eose_replay = false;
            return Some(SubscriptionMessage::Eose);
        }
        self.rx.recv().await
    }

    /// Detach this listener.
    ///
    /// Equivalent to dropping the handle; provided for call sites where the
    /// intent reads better spelled out.
    pub fn unsubscribe(self) {}

    /// Queue a cached event for delivery ahead of live messages.
    pub(crate) fn push_replay(&mut self, event: Arc<Event>) {
        self.replay.push_back(SubscriptionMessage::Event(event));
    }

    /// A subscription with no network side: it yields the queued replay,
    /// one EOSE, then ends.
    pub(crate) fn local() -> Self {
        let (_tx, rx) = mpsc::channel(1);
        Self {
            id: 0,
            replay: VecDeque::new(),
            eose_replay: true,
            rx,
            _guard: ListenerGuard {
                inner: None,
                fingerprint: String::new(),
                listener_id: 0,
            },
        }
    }
}

/// Detaches the listener when the [`Subscription`] is dropped.
struct ListenerGuard {
    inner: Option<Arc<ManagerInner>>,
    fingerprint: String,
    listener_id: u64,
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            inner.detach(&self.fingerprint, self.listener_id);
        }
    }
}

/// Debug view of one live subscription, for tooling and tests.
#[derive(Debug, Clone)]
pub struct SubscriptionInfo {
    /// Identifier of the shared subscription.
    pub id: u64,
    /// Number of relays in the set.
    pub relay_count: usize,
    /// Canonical filter list, serialized.
    pub filters: String,
    /// Number of attached listeners.
    pub listener_count: usize,
    /// Time since the network subscription was opened.
    pub age: Duration,
}

/// Shared per-fingerprint state the pump task and attach/detach both touch.
///
/// `eose_seen` lives under the same lock as the listener map so a listener
/// can never attach between the EOSE fan-out and the flag flip and miss the
/// signal.
struct SubShared {
    listeners: HashMap<u64, mpsc::Sender<SubscriptionMessage>>,
    eose_seen: bool,
}

struct ActiveSub {
    sub_id: u64,
    relay_count: usize,
    filter_summary: String,
    shared: Arc<Mutex<SubShared>>,
    token: CancellationToken,
    opened_at: Instant,
}

struct ManagerInner {
    store: Arc<EventStore>,
    transport: Arc<dyn RelayTransport>,
    config: SubsConfig,
    active: Mutex<HashMap<String, ActiveSub>>,
    next_sub_id: AtomicU64,
    next_listener_id: AtomicU64,
}

impl ManagerInner {
    fn detach(&self, fingerprint: &str, listener_id: u64) {
        let mut active = self.active.lock();
        let Some(sub) = active.get(fingerprint) else {
            return;
        };

        let now_empty = {
            let mut shared = sub.shared.lock();
            shared.listeners.remove(&listener_id);
            shared.listeners.is_empty()
        };

        if now_empty {
            let sub = active
                .remove(fingerprint)
                .expect("entry present under the same lock");
            sub.token.cancel();
            counter!("subs_closed_total").increment(1);
            gauge!("subs_live").set(active.len() as f64);
            tracing::debug!(sub_id = sub.sub_id, "closed subscription, refcount zero");
        }
    }
}

/// Deduplicating subscription multiplexer.
///
/// Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct SubscriptionManager {
    inner: Arc<ManagerInner>,
}

impl SubscriptionManager {
    /// Create a manager writing through to `store` and opening network
    /// subscriptions on `transport`.
    pub fn new(
        store: Arc<EventStore>,
        transport: Arc<dyn RelayTransport>,
        config: SubsConfig,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                store,
                transport,
                config,
                active: Mutex::new(HashMap::new()),
                next_sub_id: AtomicU64::new(1),
                next_listener_id: AtomicU64::new(1),
            }),
        }
    }

    /// Attach a listener for `filters` across `relays`.
    ///
    /// If a live subscription with the same fingerprint exists, the listener
    /// attaches to it and no network call is made. Otherwise a new network
    /// subscription is opened.
    ///
    /// `relays` must be non-empty; local-only subscriptions are built by the
    /// runtime facade without involving the manager.
    pub fn subscribe(&self, relays: &[RelayUrl], filters: &[Filter]) -> Subscription {
        let relay_set: BTreeSet<RelayUrl> = relays.iter().cloned().collect();
        let fingerprint = fingerprint(&relay_set, filters);
        let listener_id = self.inner.next_listener_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.inner.config.listener_capacity);

        let mut active = self.inner.active.lock();
        let (sub_id, eose_already) = match active.get(&fingerprint) {
            Some(sub) => {
                let mut shared = sub.shared.lock();
                shared.listeners.insert(listener_id, tx);
                counter!("subs_deduped_total").increment(1);
                tracing::debug!(
                    sub_id = sub.sub_id,
                    listeners = shared.listeners.len(),
                    "attached listener to existing subscription"
                );
                (sub.sub_id, shared.eose_seen)
            }
            None => {
                let sub_id = self.inner.next_sub_id.fetch_add(1, Ordering::Relaxed);
                let relay_vec: Vec<RelayUrl> = relay_set.iter().cloned().collect();
                let transport_sub = self.inner.transport.open(&relay_vec, filters);
                let (transport_rx, token) = transport_sub.into_parts();

                let shared = Arc::new(Mutex::new(SubShared {
                    listeners: HashMap::from([(listener_id, tx)]),
                    eose_seen: false,
                }));

                tokio::spawn(pump(
                    self.inner.store.clone(),
                    shared.clone(),
                    transport_rx,
                    relay_set.clone(),
                    self.inner.config.eose_timeout,
                ));

                let filter_summary = summarize(filters);
                tracing::debug!(
                    sub_id,
                    relays = relay_set.len(),
                    filters = %filter_summary,
                    "opened network subscription"
                );
                active.insert(
                    fingerprint.clone(),
                    ActiveSub {
                        sub_id,
                        relay_count: relay_set.len(),
                        filter_summary,
                        shared,
                        token,
                        opened_at: Instant::now(),
                    },
                );
                counter!("subs_opened_total").increment(1);
                gauge!("subs_live").set(active.len() as f64);
                (sub_id, false)
            }
        };
        drop(active);

        Subscription {
            id: sub_id,
            replay: VecDeque::new(),
            eose_replay: eose_already,
            rx,
            _guard: ListenerGuard {
                inner: Some(self.inner.clone()),
                fingerprint,
                listener_id,
            },
        }
    }

    /// Forcibly close every live subscription.
    ///
    /// Used at shutdown and in test teardown. Attached listeners see their
    /// streams end.
    pub fn close_all(&self) {
        let mut active = self.inner.active.lock();
        let count = active.len();
        for (_, sub) in active.drain() {
            sub.token.cancel();
        }
        if count > 0 {
            counter!("subs_closed_total").increment(count as u64);
            tracing::info!(count, "closed all subscriptions");
        }
        gauge!("subs_live").set(0.0);
    }

    /// Debug view over every live subscription.
    pub fn list_subscriptions(&self) -> Vec<SubscriptionInfo> {
        let active = self.inner.active.lock();
        let mut infos: Vec<SubscriptionInfo> = active
            .values()
            .map(|sub| SubscriptionInfo {
                id: sub.sub_id,
                relay_count: sub.relay_count,
                filters: sub.filter_summary.clone(),
                listener_count: sub.shared.lock().listeners.len(),
                age: sub.opened_at.elapsed(),
            })
            .collect();
        infos.sort_by_key(|info| info.id);
        infos
    }

    /// Number of live network subscriptions.
    pub fn live_count(&self) -> usize {
        self.inner.active.lock().len()
    }
}

/// Canonical fingerprint for a `(relay set, filter list)` request.
fn fingerprint(relays: &BTreeSet<RelayUrl>, filters: &[Filter]) -> String {
    let mut filter_parts: Vec<String> = filters.iter().map(Filter::to_string).collect();
    filter_parts.sort();
    filter_parts.dedup();

    let relay_parts: Vec<&str> = relays.iter().map(RelayUrl::as_str).collect();
    format!("{}|{}", relay_parts.join(","), filter_parts.join(","))
}

/// Canonical filter list serialization used for listings and logs.
fn summarize(filters: &[Filter]) -> String {
    let mut parts: Vec<String> = filters.iter().map(Filter::to_string).collect();
    parts.sort();
    parts.dedup();
    parts.join(",")
}

/// Per-subscription pump: consumes the transport stream, writes events
/// through the store, fans them out, and aggregates EOSE.
async fn pump(
    store: Arc<EventStore>,
    shared: Arc<Mutex<SubShared>>,
    mut rx: mpsc::Receiver<TransportMessage>,
    relays: BTreeSet<RelayUrl>,
    eose_timeout: Duration,
) {
    let mut awaiting_eose = relays;
    let deadline = tokio::time::sleep(eose_timeout);
    tokio::pin!(deadline);

    loop {
        let eose_seen = shared.lock().eose_seen;
        tokio::select! {
            message = rx.recv() => match message {
                Some(TransportMessage::Event { event, .. }) => {
                    let event = Arc::new(event);
                    // Store admission and listener delivery are independent:
                    // an exact-id duplicate from a second relay is still a
                    // live delivery for listeners.
                    store.add_event_arc(event.clone());
                    fan_out(&shared, SubscriptionMessage::Event(event));
                    counter!("subs_events_forwarded_total").increment(1);
                }
                Some(TransportMessage::Eose { relay }) => {
                    awaiting_eose.remove(&relay);
                    if awaiting_eose.is_empty() {
                        signal_eose(&shared);
                    }
                }
                Some(TransportMessage::Disconnected { relay }) => {
                    tracing::debug!(%relay, "relay dropped mid-subscription");
                    awaiting_eose.remove(&relay);
                    if awaiting_eose.is_empty() {
                        signal_eose(&shared);
                    }
                }
                None => break,
            },
            _ = &mut deadline, if !eose_seen => {
                tracing::debug!(
                    outstanding = awaiting_eose.len(),
                    "EOSE timeout reached before full relay coverage"
                );
                signal_eose(&shared);
            }
        }
    }
}

/// Deliver a message to every attached listener.
///
/// A listener whose channel is full loses the message (counted); delivery
/// to the others is unaffected.
fn fan_out(shared: &Mutex<SubShared>, message: SubscriptionMessage) {
    let shared = shared.lock();
    for sender in shared.listeners.values() {
        if let Err(mpsc::error::TrySendError::Full(_)) = sender.try_send(message.clone()) {
            counter!("subs_listener_lagged_total").increment(1);
        }
    }
}

/// Fire the aggregate EOSE exactly once.
fn signal_eose(shared: &Mutex<SubShared>) {
    let mut shared = shared.lock();
    if shared.eose_seen {
        return;
    }
    shared.eose_seen = true;
    for sender in shared.listeners.values() {
        let _ = sender.try_send(SubscriptionMessage::Eose);
    }
}
