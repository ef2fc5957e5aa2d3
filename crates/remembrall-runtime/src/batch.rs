//! Request coalescing for on-demand lookups.
//!
//! Rendering a page of comments can trigger dozens of individual "fetch this
//! profile" and "fetch reactions to this note" lookups within a few
//! milliseconds. Issuing one relay round trip per key would hammer the
//! relays and the connection pool; the [`RequestBatcher`] coalesces keys
//! arriving within a short per-purpose debounce window into one filter
//! query.
//!
//! Each [`Purpose`] has its own window (shorter for ad-hoc single fetches,
//! longer for bulk refreshes under heavy scroll) and its natural filter
//! shape: profile lookups become `{kinds:[0], authors:[...]}`, reaction
//! refreshes become `{kinds:[7], "#e":[...]}`, and so on.
//!
//! A flush subscribes through the [`SubscriptionManager`], drains until the
//! aggregate EOSE (results land in the store via the normal write-through
//! path), then unsubscribes. Keys pending or in flight are never requested
//! twice.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use parking_lot::Mutex;
use remembrall_core::{Event, Filter};
use tokio::sync::oneshot;

use crate::store::EventStore;
use crate::subs::{SubscriptionManager, SubscriptionMessage};
use crate::transport::RelayUrl;

/// What a batched lookup is for. Determines the debounce window and the
/// filter shape of the flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Purpose {
    /// Author profiles (kind 0), keyed by pubkey.
    Profile,
    /// Comments on an event (kinds 1 and 1111), keyed by parent event id.
    Comment,
    /// Reactions (kind 7), keyed by reacted-to event id.
    Reaction,
    /// Zap receipts (kind 9735), keyed by zapped event id.
    Zap,
    /// Reposts (kind 6), keyed by reposted event id.
    Repost,
    /// Ad-hoc single event fetches, keyed by event id.
    Single,
}

impl Purpose {
    /// Stable label for logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            Purpose::Profile => "profile",
            Purpose::Comment => "comment",
            Purpose::Reaction => "reaction",
            Purpose::Zap => "zap",
            Purpose::Repost => "repost",
            Purpose::Single => "single",
        }
    }

    /// The flush filter for a set of keys of this purpose.
    fn filter(&self, keys: &BTreeSet<String>) -> Filter {
        let keys = keys.iter().cloned();
        match self {
            Purpose::Profile => Filter::new().kinds([0]).authors(keys),
            Purpose::Comment => Filter::new().kinds([1, 1111]).tag("e", keys),
            Purpose::Reaction => Filter::new().kinds([7]).tag("e", keys),
            Purpose::Zap => Filter::new().kinds([9735]).tag("e", keys),
            Purpose::Repost => Filter::new().kinds([6]).tag("e", keys),
            Purpose::Single => Filter::new().ids(keys),
        }
    }
}

/// Debounce windows and flush bounds for the batcher.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Window for ad-hoc single fetches. Short: these sit on the critical
    /// path of rendering a quoted note.
    pub single_window: Duration,
    /// Window for profile lookups.
    pub profile_window: Duration,
    /// Window for comment refreshes.
    pub comment_window: Duration,
    /// Window for reaction refreshes.
    pub reaction_window: Duration,
    /// Window for zap receipt refreshes.
    pub zap_window: Duration,
    /// Window for repost refreshes.
    pub repost_window: Duration,
    /// Upper bound on draining one flush before giving up on EOSE.
    pub flush_timeout: Duration,
    /// Upper bound on a single waiter; an unresolved fetch yields "not
    /// found" rather than hanging.
    pub fetch_timeout: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            single_window: Duration::from_millis(50),
            profile_window: Duration::from_millis(250),
            comment_window: Duration::from_millis(500),
            reaction_window: Duration::from_millis(500),
            zap_window: Duration::from_millis(500),
            repost_window: Duration::from_millis(500),
            flush_timeout: Duration::from_secs(8),
            fetch_timeout: Duration::from_secs(10),
        }
    }
}

impl BatchConfig {
    /// The debounce window for a purpose.
    fn window(&self, purpose: Purpose) -> Duration {
        match purpose {
            Purpose::Single => self.single_window,
            Purpose::Profile => self.profile_window,
            Purpose::Comment => self.comment_window,
            Purpose::Reaction => self.reaction_window,
            Purpose::Zap => self.zap_window,
            Purpose::Repost => self.repost_window,
        }
    }
}

/// One queue exists per `(purpose, relay set)` pair, so callers against
/// different relay sets never contaminate each other's flushes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct QueueKey {
    purpose: Purpose,
    relays: Vec<RelayUrl>,
}

#[derive(Default)]
struct QueueState {
    /// Keys waiting for the next flush.
    pending: BTreeSet<String>,
    /// Keys currently being fetched.
    in_flight: BTreeSet<String>,
    /// Bumped on every add; a debounce timer only flushes if it is still
    /// the latest one.
    epoch: u64,
    /// Waiters to resolve from flush results (Single purpose only).
    waiters: HashMap<String, Vec<oneshot::Sender<Option<Arc<Event>>>>>,
}

struct BatcherInner {
    store: Arc<EventStore>,
    subs: SubscriptionManager,
    config: BatchConfig,
    queues: Mutex<HashMap<QueueKey, QueueState>>,
}

/// Debouncing request coalescer.
///
/// Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct RequestBatcher {
    inner: Arc<BatcherInner>,
}

impl RequestBatcher {
    /// Create a batcher flushing through `subs`, with store short-circuits.
    pub fn new(store: Arc<EventStore>, subs: SubscriptionManager, config: BatchConfig) -> Self {
        Self {
            inner: Arc::new(BatcherInner {
                store,
                subs,
                config,
                queues: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Queue a key for the next flush of `purpose` against `relays`.
    ///
    /// No-op when the key is already satisfied by the store (Single and
    /// Profile purposes), already pending, or already in flight. Each call
    /// restarts the purpose's debounce window.
    pub fn add(&self, purpose: Purpose, relays: &[RelayUrl], key: impl Into<String>) {
        let key = key.into();
        if self.satisfied_by_store(purpose, &key) {
            return;
        }
        self.enqueue(purpose, relays, key);
    }

    /// Fetch a single event by id, coalesced with concurrent callers.
    ///
    /// Resolves from the store immediately on a cache hit. On a miss, joins
    /// the shared `Single` window for `relays`; the future resolves once the
    /// flush completes, to `None` if the id was not found by EOSE or the
    /// fetch timeout elapses. Never errors, never hangs.
    pub async fn fetch(&self, relays: &[RelayUrl], id: &str) -> Option<Arc<Event>> {
        if let Some(event) = self.inner.store.get(id) {
            counter!("fetch_cache_hits_total").increment(1);
            return Some(event);
        }

        let (tx, rx) = oneshot::channel();
        {
            let mut queues = self.inner.queues.lock();
            let state = queues.entry(self.queue_key(Purpose::Single, relays)).or_default();
            state.waiters.entry(id.to_string()).or_default().push(tx);
        }
        self.enqueue(Purpose::Single, relays, id.to_string());

        let result = tokio::time::timeout(self.inner.config.fetch_timeout, rx)
            .await
            .ok()
            .and_then(|received| received.ok())
            .flatten();
        if result.is_none() {
            counter!("fetch_not_found_total").increment(1);
        }
        result
    }

    /// Whether the store already answers this key.
    ///
    /// Only Single and Profile lookups have a meaningful completeness check;
    /// comment/reaction/zap/repost refreshes always go to the network (the
    /// cache cannot know whether it has *all* children of an event).
    fn satisfied_by_store(&self, purpose: Purpose, key: &str) -> bool {
        match purpose {
            Purpose::Single => self.inner.store.get(key).is_some(),
            Purpose::Profile => !self
                .inner
                .store
                .query(&[Filter::new().kinds([0]).author(key).limit(1)])
                .is_empty(),
            _ => false,
        }
    }

    fn queue_key(&self, purpose: Purpose, relays: &[RelayUrl]) -> QueueKey {
        let relays: BTreeSet<RelayUrl> = relays.iter().cloned().collect();
        QueueKey {
            purpose,
            relays: relays.into_iter().collect(),
        }
    }

    fn enqueue(&self, purpose: Purpose, relays: &[RelayUrl], key: String) {
        let queue_key = self.queue_key(purpose, relays);
        let epoch = {
            let mut queues = self.inner.queues.lock();
            let state = queues.entry(queue_key.clone()).or_default();
            if state.in_flight.contains(&key) || !state.pending.insert(key) {
                return;
            }
            counter!("batch_keys_queued_total", "purpose" => purpose.as_str()).increment(1);
            state.epoch += 1;
            state.epoch
        };

        let batcher = self.clone();
        let window = self.inner.config.window(purpose);
        tokio::spawn(async move {
            tokio::time::sleep(window).await;
            batcher.flush_if_current(queue_key, epoch).await;
        });
    }

    /// Flush a queue if no later add has restarted its window.
    async fn flush_if_current(&self, queue_key: QueueKey, epoch: u64) {
        let keys = {
            let mut queues = self.inner.queues.lock();
            let Some(state) = queues.get_mut(&queue_key) else {
                return;
            };
            if state.epoch != epoch || state.pending.is_empty() {
                // A later add restarted the window; its timer will flush.
                return;
            }
            let keys = std::mem::take(&mut state.pending);
            state.in_flight.extend(keys.iter().cloned());
            keys
        };

        let purpose = queue_key.purpose;
        counter!("batch_flushes_total", "purpose" => purpose.as_str()).increment(1);
        tracing::debug!(
            purpose = purpose.as_str(),
            keys = keys.len(),
            "flushing batch queue"
        );

        let filter = purpose.filter(&keys);
        let mut sub = self.inner.subs.subscribe(&queue_key.relays, &[filter]);

        // Drain until the aggregate EOSE; results reach the store via the
        // subscription pump's write-through.
        let deadline = tokio::time::sleep(self.inner.config.flush_timeout);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                message = sub.recv() => match message {
                    Some(SubscriptionMessage::Event(event)) => {
                        if purpose == Purpose::Single {
                            self.resolve_waiters(&queue_key, &event.id, Some(event.clone()));
                        }
                    }
                    Some(SubscriptionMessage::Eose) | None => break,
                },
                _ = &mut deadline => {
                    tracing::debug!(purpose = purpose.as_str(), "flush timed out before EOSE");
                    break;
                }
            }
        }
        drop(sub);

        // Clear in-flight bookkeeping and settle remaining waiters so a
        // subsequent burst starts a fresh window.
        let mut queues = self.inner.queues.lock();
        if let Some(state) = queues.get_mut(&queue_key) {
            for key in &keys {
                state.in_flight.remove(key);
                if let Some(waiters) = state.waiters.remove(key) {
                    let found = self.inner.store.get(key);
                    for waiter in waiters {
                        let _ = waiter.send(found.clone());
                    }
                }
            }
            if state.pending.is_empty() && state.in_flight.is_empty() && state.waiters.is_empty() {
                queues.remove(&queue_key);
            }
        }
    }

    fn resolve_waiters(&self, queue_key: &QueueKey, key: &str, event: Option<Arc<Event>>) {
        let mut queues = self.inner.queues.lock();
        if let Some(state) = queues.get_mut(queue_key) {
            if let Some(waiters) = state.waiters.remove(key) {
                for waiter in waiters {
                    let _ = waiter.send(event.clone());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subs::SubsConfig;
    use crate::transport::mock::MockTransport;

    fn test_event(id_byte: u8, kind: u16, created_at: u64) -> Event {
        Event {
            id: format!("{:02x}", id_byte).repeat(32),
            pubkey: "ab".repeat(32),
            created_at,
            kind,
            tags: vec![],
            content: String::new(),
            sig: "cd".repeat(64),
        }
    }

    fn relay(host: &str) -> RelayUrl {
        RelayUrl::parse(&format!("wss://{}", host)).unwrap()
    }

    fn batcher(transport: &MockTransport) -> (RequestBatcher, Arc<EventStore>) {
        let store = Arc::new(EventStore::new());
        let subs = SubscriptionManager::new(
            store.clone(),
            Arc::new(transport.clone()),
            SubsConfig::default(),
        );
        (
            RequestBatcher::new(store.clone(), subs, BatchConfig::default()),
            store,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_fetches_coalesce_into_one_query() {
        let transport = MockTransport::new();
        let (batcher, _store) = batcher(&transport);
        let relays = [relay("r1")];

        let a = test_event(0x01, 1, 100);
        let b = test_event(0x02, 1, 200);
        let c = test_event(0x03, 1, 300);

        let (ra, rb, rc) = tokio::join!(
            batcher.fetch(&relays, &a.id),
            batcher.fetch(&relays, &b.id),
            async {
                // Third caller joins within the window, then the relay
                // answers two of the three ids and signals EOSE
                let fut = batcher.fetch(&relays, &c.id);
                let transport = transport.clone();
                let (a, b) = (a.clone(), b.clone());
                tokio::spawn(async move {
                    // Wait for the window to elapse and the flush to open
                    while transport.open_count() == 0 {
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                    transport.emit(a);
                    transport.emit(b);
                    transport.eose_all();
                });
                fut.await
            }
        );

        // Exactly one network query, containing all three ids
        assert_eq!(transport.open_count(), 1);
        let filters = transport.open_filters(0);
        assert_eq!(filters.len(), 1);
        let ids = filters[0].ids.as_ref().unwrap();
        assert_eq!(ids.len(), 3);
        assert!(ids.contains(&a.id) && ids.contains(&b.id) && ids.contains(&c.id));

        assert_eq!(ra.unwrap().id, a.id);
        assert_eq!(rb.unwrap().id, b.id);
        // Unresolved id settles to None at EOSE
        assert!(rc.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_hits_store_without_network() {
        let transport = MockTransport::new();
        let (batcher, store) = batcher(&transport);

        let event = test_event(0x01, 1, 100);
        store.add_event(event.clone());

        let found = batcher.fetch(&[relay("r1")], &event.id).await;
        assert_eq!(found.unwrap().id, event.id);
        assert_eq!(transport.open_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_add_is_idempotent_before_flush() {
        let transport = MockTransport::new();
        transport.set_auto_eose(true);
        let (batcher, _store) = batcher(&transport);
        let relays = [relay("r1")];
        let parent = "aa".repeat(32);

        batcher.add(Purpose::Reaction, &relays, parent.clone());
        batcher.add(Purpose::Reaction, &relays, parent.clone());
        batcher.add(Purpose::Reaction, &relays, parent.clone());

        // Let the window elapse and the flush drain
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(transport.open_count(), 1);
        let filters = transport.open_filters(0);
        let values = filters[0].tags.get("#e").unwrap();
        assert_eq!(values.len(), 1);
        assert!(values.contains(&parent));
    }

    #[tokio::test(start_paused = true)]
    async fn test_purposes_flush_separately_with_their_own_shapes() {
        let transport = MockTransport::new();
        transport.set_auto_eose(true);
        let (batcher, _store) = batcher(&transport);
        let relays = [relay("r1")];

        batcher.add(Purpose::Profile, &relays, "ab".repeat(32));
        batcher.add(Purpose::Reaction, &relays, "aa".repeat(32));

        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(transport.open_count(), 2);
        let mut saw_profile = false;
        let mut saw_reaction = false;
        for idx in 0..2 {
            let filter = &transport.open_filters(idx)[0];
            if filter.authors.is_some() {
                assert_eq!(filter.kinds.as_ref().unwrap().iter().next(), Some(&0));
                saw_profile = true;
            } else {
                assert_eq!(filter.kinds.as_ref().unwrap().iter().next(), Some(&7));
                assert!(filter.tags.contains_key("#e"));
                saw_reaction = true;
            }
        }
        assert!(saw_profile && saw_reaction);
    }

    #[tokio::test(start_paused = true)]
    async fn test_profile_add_skipped_when_cached() {
        let transport = MockTransport::new();
        let (batcher, store) = batcher(&transport);

        let mut profile = test_event(0x01, 0, 100);
        profile.content = "{\"name\":\"alice\"}".to_string();
        store.add_event(profile.clone());

        batcher.add(Purpose::Profile, &[relay("r1")], profile.pubkey.clone());
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(transport.open_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_later_add_restarts_window() {
        let transport = MockTransport::new();
        transport.set_auto_eose(true);
        let (batcher, _store) = batcher(&transport);
        let relays = [relay("r1")];

        batcher.add(Purpose::Reaction, &relays, "aa".repeat(32));
        // Second key lands mid-window and restarts it
        tokio::time::sleep(Duration::from_millis(300)).await;
        batcher.add(Purpose::Reaction, &relays, "bb".repeat(32));

        // The original window would have fired by now; the restarted one
        // has not
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(transport.open_count(), 0);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(transport.open_count(), 1);
        // Both keys went out in the single restarted flush
        let filters = transport.open_filters(0);
        assert_eq!(filters[0].tags.get("#e").unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_timeout_resolves_none() {
        let transport = MockTransport::new();
        let (batcher, _store) = batcher(&transport);

        // No relay ever answers and none signals EOSE
        let found = batcher.fetch(&[relay("silent")], &"aa".repeat(32)).await;
        assert!(found.is_none());
    }
}
