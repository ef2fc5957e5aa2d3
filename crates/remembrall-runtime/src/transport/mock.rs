//! In-memory transport for tests and offline development.
//!
//! [`MockTransport`] records every `open` and `publish` call and lets the
//! caller script relay behavior: emit events, signal per-relay EOSE, drop
//! relays, reject publishes. Events are delivered to every live subscription
//! whose filter list matches, mirroring how a real relay evaluates REQ
//! filters.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use remembrall_core::{Event, Filter};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{PublishOutcome, RelayTransport, RelayUrl, TransportMessage, TransportSub};

/// Channel capacity for mock subscriptions; large enough that tests never
/// hit backpressure.
const CHANNEL_CAPACITY: usize = 1024;

struct OpenRecord {
    relays: Vec<RelayUrl>,
    filters: Vec<Filter>,
    sender: Arc<Mutex<Option<mpsc::Sender<TransportMessage>>>>,
    token: CancellationToken,
}

#[derive(Default)]
struct MockInner {
    opens: Mutex<Vec<OpenRecord>>,
    published: Mutex<Vec<(Vec<RelayUrl>, Event)>>,
    reject: Mutex<HashSet<RelayUrl>>,
    auto_eose: AtomicBool,
}

/// Scriptable in-memory [`RelayTransport`].
#[derive(Clone, Default)]
pub struct MockTransport {
    inner: Arc<MockInner>,
}

impl MockTransport {
    /// Create a mock transport with no scripted behavior.
    pub fn new() -> Self {
        Self::default()
    }

    /// When set, every `open` receives an immediate EOSE from each relay.
    pub fn set_auto_eose(&self, enabled: bool) {
        self.inner.auto_eose.store(enabled, Ordering::SeqCst);
    }

    /// Make subsequent publishes to `relay` fail.
    pub fn reject_publishes_to(&self, relay: RelayUrl) {
        self.inner.reject.lock().insert(relay);
    }

    /// Total number of `open` calls seen, including closed ones.
    pub fn open_count(&self) -> usize {
        self.inner.opens.lock().len()
    }

    /// Number of subscriptions that have not been closed.
    pub fn live_count(&self) -> usize {
        self.inner
            .opens
            .lock()
            .iter()
            .filter(|open| !open.token.is_cancelled())
            .count()
    }

    /// The filters of the `idx`-th `open` call.
    pub fn open_filters(&self, idx: usize) -> Vec<Filter> {
        self.inner.opens.lock()[idx].filters.clone()
    }

    /// The relay set of the `idx`-th `open` call.
    pub fn open_relays(&self, idx: usize) -> Vec<RelayUrl> {
        self.inner.opens.lock()[idx].relays.clone()
    }

    /// Deliver an event from each subscription's first relay.
    ///
    /// The event is delivered to every live subscription whose filter list
    /// matches it. Returns the number of deliveries.
    pub fn emit(&self, event: Event) -> usize {
        let opens = self.inner.opens.lock();
        let mut delivered = 0;
        for open in opens.iter() {
            let relay = match open.relays.first() {
                Some(relay) => relay.clone(),
                None => continue,
            };
            delivered += Self::deliver(open, relay, event.clone());
        }
        delivered
    }

    /// Deliver an event attributed to a specific relay.
    ///
    /// Only subscriptions whose relay set contains `relay` are considered.
    pub fn emit_from(&self, relay: &RelayUrl, event: Event) -> usize {
        let opens = self.inner.opens.lock();
        let mut delivered = 0;
        for open in opens.iter() {
            if !open.relays.contains(relay) {
                continue;
            }
            delivered += Self::deliver(open, relay.clone(), event.clone());
        }
        delivered
    }

    /// Signal EOSE from every relay of every live subscription.
    pub fn eose_all(&self) {
        let opens = self.inner.opens.lock();
        for open in opens.iter() {
            if let Some(sender) = open.sender.lock().as_ref() {
                for relay in &open.relays {
                    let _ = sender.try_send(TransportMessage::Eose {
                        relay: relay.clone(),
                    });
                }
            }
        }
    }

    /// Signal EOSE from one relay on every subscription that includes it.
    pub fn eose_from(&self, relay: &RelayUrl) {
        let opens = self.inner.opens.lock();
        for open in opens.iter() {
            if !open.relays.contains(relay) {
                continue;
            }
            if let Some(sender) = open.sender.lock().as_ref() {
                let _ = sender.try_send(TransportMessage::Eose {
                    relay: relay.clone(),
                });
            }
        }
    }

    /// Drop a relay from every subscription that includes it.
    pub fn disconnect(&self, relay: &RelayUrl) {
        let opens = self.inner.opens.lock();
        for open in opens.iter() {
            if !open.relays.contains(relay) {
                continue;
            }
            if let Some(sender) = open.sender.lock().as_ref() {
                let _ = sender.try_send(TransportMessage::Disconnected {
                    relay: relay.clone(),
                });
            }
        }
    }

    /// Every `(relays, event)` pair submitted via `publish`.
    pub fn published(&self) -> Vec<(Vec<RelayUrl>, Event)> {
        self.inner.published.lock().clone()
    }

    fn deliver(open: &OpenRecord, relay: RelayUrl, event: Event) -> usize {
        if !Filter::any_match(&open.filters, &event) {
            return 0;
        }
        match open.sender.lock().as_ref() {
            Some(sender) => {
                let _ = sender.try_send(TransportMessage::Event { relay, event });
                1
            }
            None => 0,
        }
    }
}

#[async_trait]
impl RelayTransport for MockTransport {
    fn open(&self, relays: &[RelayUrl], filters: &[Filter]) -> TransportSub {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let token = CancellationToken::new();

        if self.inner.auto_eose.load(Ordering::SeqCst) {
            for relay in relays {
                let _ = tx.try_send(TransportMessage::Eose {
                    relay: relay.clone(),
                });
            }
        }

        let sender = Arc::new(Mutex::new(Some(tx)));

        // Drop the sender when the subscription is closed so the message
        // stream ends for the consumer.
        let watcher_sender = sender.clone();
        let watcher_token = token.clone();
        tokio::spawn(async move {
            watcher_token.cancelled().await;
            watcher_sender.lock().take();
        });

        self.inner.opens.lock().push(OpenRecord {
            relays: relays.to_vec(),
            filters: filters.to_vec(),
            sender,
            token: token.clone(),
        });

        TransportSub::new(rx, token)
    }

    async fn publish(&self, relays: &[RelayUrl], event: &Event) -> PublishOutcome {
        self.inner
            .published
            .lock()
            .push((relays.to_vec(), event.clone()));

        let reject = self.inner.reject.lock();
        let mut outcome = PublishOutcome {
            accepted: 0,
            total: relays.len(),
            failures: Vec::new(),
        };
        for relay in relays {
            if reject.contains(relay) {
                outcome
                    .failures
                    .push((relay.clone(), "rejected by mock".to_string()));
            } else {
                outcome.accepted += 1;
            }
        }
        outcome
    }
}
