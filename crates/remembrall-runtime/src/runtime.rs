//! The runtime facade: the four-method contract UI code builds on.
//!
//! A [`Runtime`] composes the event store, the subscription manager and the
//! request batcher behind the entry points every consumer calls: `query`,
//! `subscribe`, `add_event(s)`, `get`, plus the batched fetch path, publish,
//! and debug introspection.
//!
//! A runtime is an explicit dependency: construct one and pass it around
//! (tests instantiate isolated instances freely). Nothing here is a
//! process-wide global.

use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use remembrall_core::{Event, Filter};
use tokio::task::JoinHandle;

use crate::batch::{Purpose, RequestBatcher};
use crate::config::RuntimeConfig;
use crate::store::{EventStore, StoreStats};
use crate::subs::{Subscription, SubscriptionInfo, SubscriptionManager};
use crate::transport::{PublishOutcome, RelayTransport, RelayUrl};

/// Options for [`Runtime::subscribe`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SubscribeOptions {
    /// Serve the subscription from the cache only: replay matching events,
    /// signal EOSE, and end the stream without touching the network.
    pub local_only: bool,
}

/// The composed cache runtime.
pub struct Runtime {
    store: Arc<EventStore>,
    subs: SubscriptionManager,
    batcher: RequestBatcher,
    transport: Arc<dyn RelayTransport>,
    config: RuntimeConfig,
}

impl Runtime {
    /// Create a runtime over `transport` with default configuration.
    pub fn new(transport: Arc<dyn RelayTransport>) -> Self {
        Self::with_config(transport, RuntimeConfig::default())
    }

    /// Create a runtime over `transport` with explicit configuration.
    pub fn with_config(transport: Arc<dyn RelayTransport>, config: RuntimeConfig) -> Self {
        let store = Arc::new(EventStore::new());
        let subs = SubscriptionManager::new(store.clone(), transport.clone(), config.subs());
        let batcher = RequestBatcher::new(store.clone(), subs.clone(), config.batch.clone());
        Self {
            store,
            subs,
            batcher,
            transport,
            config,
        }
    }

    /// Evaluate a filter list against the cache. Synchronous; never touches
    /// the network.
    pub fn query(&self, filters: &[Filter]) -> Vec<Arc<Event>> {
        self.store.query(filters)
    }

    /// Look up a cached event by id.
    pub fn get(&self, id: &str) -> Option<Arc<Event>> {
        self.store.get(id)
    }

    /// Admit an event into the cache (e.g. one just signed locally).
    ///
    /// Returns `false` for structurally invalid events, duplicates, and
    /// superseded replaceable events.
    pub fn add_event(&self, event: Event) -> bool {
        self.store.add_event(event)
    }

    /// Admit a batch of events; returns how many were inserted.
    pub fn add_events(&self, events: Vec<Event>) -> usize {
        self.store.add_events(events)
    }

    /// Subscribe to `filters` across `relays`.
    ///
    /// Matching cached events are replayed first, in query order (newest
    /// first). The listener then attaches to the deduplicated network
    /// subscription, or - with `local_only`, or an empty relay set - gets
    /// an immediate EOSE and end of stream instead.
    pub fn subscribe(
        &self,
        relays: &[RelayUrl],
        filters: &[Filter],
        options: SubscribeOptions,
    ) -> Subscription {
        let mut subscription = if options.local_only || relays.is_empty() {
            Subscription::local()
        } else {
            self.subs.subscribe(relays, filters)
        };

        // Replay after attaching: an event that lands in the gap is
        // delivered twice rather than lost.
        for event in self.store.query(filters) {
            subscription.push_replay(event);
        }
        subscription
    }

    /// Fetch a single event by id, coalesced with concurrent callers.
    ///
    /// Cache hits resolve immediately. Misses join a shared window (see
    /// [`BatchConfig::single_window`](crate::BatchConfig)); ids not found by
    /// EOSE or timeout resolve to `None`.
    pub async fn fetch_batched(&self, relays: &[RelayUrl], id: &str) -> Option<Arc<Event>> {
        self.batcher.fetch(relays, id).await
    }

    /// Queue a purpose-keyed lookup (profile, comments, reactions, ...) for
    /// the next debounced batch flush. Results land in the cache and reach
    /// consumers through their subscriptions.
    pub fn prefetch(&self, purpose: Purpose, relays: &[RelayUrl], key: impl Into<String>) {
        self.batcher.add(purpose, relays, key);
    }

    /// Publish an event: write it through the cache, then submit it to
    /// every relay in the set.
    ///
    /// Failure is data: the outcome reports per-relay acceptance and the
    /// caller decides what counts as success.
    pub async fn publish(&self, relays: &[RelayUrl], event: Event) -> PublishOutcome {
        counter!("publish_attempts_total").increment(1);
        self.store.add_event(event.clone());

        let outcome = self.transport.publish(relays, &event).await;
        if !outcome.failures.is_empty() {
            counter!("publish_relay_failures_total").increment(outcome.failures.len() as u64);
            tracing::debug!(
                accepted = outcome.accepted,
                total = outcome.total,
                "publish accepted by a subset of relays"
            );
        }
        outcome
    }

    /// Aggregate statistics over the cache contents.
    pub fn stats(&self) -> StoreStats {
        self.store.stats()
    }

    /// Debug view over every live network subscription.
    pub fn list_subscriptions(&self) -> Vec<SubscriptionInfo> {
        self.subs.list_subscriptions()
    }

    /// Remove events older than `days` days. Returns the removed count.
    pub fn prune_old_events(&self, days: u64) -> usize {
        self.store.prune_older_than(Duration::from_secs(days * 86400))
    }

    /// Forcibly close every live subscription (shutdown, test teardown).
    pub fn close_all(&self) {
        self.subs.close_all();
    }

    /// Spawn the background pruner: every `prune_interval`, events older
    /// than `prune_max_age` are removed.
    pub fn spawn_pruner(&self) -> JoinHandle<()> {
        let store = self.store.clone();
        let interval = self.config.prune_interval;
        let max_age = self.config.prune_max_age;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The immediate first tick would prune an empty store
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let removed = store.prune_older_than(max_age);
                if removed > 0 {
                    tracing::info!(removed, "pruned old events");
                }
            }
        })
    }
}
