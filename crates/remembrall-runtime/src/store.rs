//! In-memory multi-indexed event store.
//!
//! The store is the cache every query and subscription replay reads from. It
//! holds events in a primary id index plus secondary indices by kind, by
//! author, and by `(tag name, tag value)` pair, so the common lookups (a
//! feed's kinds, a profile's authors, reactions referencing an event) cost
//! O(result size) instead of O(store size).
//!
//! # Index Invariant
//!
//! Every insert and evict updates all indices before the write lock is
//! released. [`EventStore::add_event`] and the pruning entry points are the
//! only mutation paths; no query can observe a partially indexed event.
//!
//! # Replaceable Events
//!
//! At most one event is held per replaceable key. An incoming event for an
//! occupied key either evicts the holder from every index or is rejected,
//! per [`supersedes`] ordering: greater `created_at` wins, ties go to the
//! lexicographically greatest id.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::ops::Bound::{Excluded, Included, Unbounded};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use metrics::{counter, gauge};
use parking_lot::RwLock;
use remembrall_core::{supersedes, Event, Filter, ReplaceableKey};
use serde::Serialize;

/// Aggregate statistics over the store contents.
#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    /// Events currently held.
    pub total_events: usize,
    /// Event count per kind.
    pub events_by_kind: BTreeMap<u16, usize>,
    /// Distinct authors across all held events.
    pub total_authors: usize,
}

#[derive(Default)]
struct StoreInner {
    /// Primary index: event id to the event.
    by_id: HashMap<String, Arc<Event>>,
    /// Kind to ids of events with that kind.
    by_kind: HashMap<u16, HashSet<String>>,
    /// Author pubkey to ids of their events.
    by_author: HashMap<String, HashSet<String>>,
    /// Tag name to tag value to ids of events carrying that pair.
    /// Only single-letter tag names are indexed (the queryable tags).
    by_tag: HashMap<String, HashMap<String, HashSet<String>>>,
    /// `(created_at, id)` ordered set, for time-range scans and pruning.
    by_time: BTreeSet<(u64, String)>,
    /// Replaceable key to the id of its current holder.
    replaceable: HashMap<ReplaceableKey, String>,
}

impl StoreInner {
    /// Insert an already-validated event into every index.
    fn insert(&mut self, event: Arc<Event>) {
        let id = event.id.clone();
        self.by_kind
            .entry(event.kind)
            .or_default()
            .insert(id.clone());
        self.by_author
            .entry(event.pubkey.clone())
            .or_default()
            .insert(id.clone());
        for (name, value) in indexable_tags(&event) {
            self.by_tag
                .entry(name.to_string())
                .or_default()
                .entry(value.to_string())
                .or_default()
                .insert(id.clone());
        }
        self.by_time.insert((event.created_at, id.clone()));
        self.by_id.insert(id, event);
    }

    /// Remove an event from every index. Returns the removed event.
    fn remove(&mut self, id: &str) -> Option<Arc<Event>> {
        let event = self.by_id.remove(id)?;

        if let Some(set) = self.by_kind.get_mut(&event.kind) {
            set.remove(id);
            if set.is_empty() {
                self.by_kind.remove(&event.kind);
            }
        }
        if let Some(set) = self.by_author.get_mut(&event.pubkey) {
            set.remove(id);
            if set.is_empty() {
                self.by_author.remove(&event.pubkey);
            }
        }
        for (name, value) in indexable_tags(&event) {
            if let Some(values) = self.by_tag.get_mut(name) {
                if let Some(set) = values.get_mut(value) {
                    set.remove(id);
                    if set.is_empty() {
                        values.remove(value);
                    }
                }
                if values.is_empty() {
                    self.by_tag.remove(name);
                }
            }
        }
        self.by_time.remove(&(event.created_at, id.to_string()));
        if let Some(key) = ReplaceableKey::for_event(&event) {
            if self.replaceable.get(&key).map(String::as_str) == Some(id) {
                self.replaceable.remove(&key);
            }
        }

        Some(event)
    }

    /// Candidate events for one filter, drawn from the smallest applicable
    /// index. Candidates still need a [`Filter::matches`] screen.
    fn candidates(&self, filter: &Filter) -> Vec<Arc<Event>> {
        // Exact ids are the cheapest possible path
        if let Some(ids) = &filter.ids {
            return ids
                .iter()
                .filter_map(|id| self.by_id.get(id).cloned())
                .collect();
        }

        // Union the id set each indexed field admits, keep the smallest
        let mut unions: Vec<Vec<&String>> = Vec::new();
        if let Some(kinds) = &filter.kinds {
            unions.push(
                kinds
                    .iter()
                    .flat_map(|kind| self.by_kind.get(kind).into_iter().flatten())
                    .collect(),
            );
        }
        if let Some(authors) = &filter.authors {
            unions.push(
                authors
                    .iter()
                    .flat_map(|author| self.by_author.get(author).into_iter().flatten())
                    .collect(),
            );
        }
        for (name, values) in filter.tag_entries() {
            // Multi-letter tag names are not indexed; they are screened by
            // matches() on whatever the other fields narrow down to.
            if name.len() != 1 {
                continue;
            }
            let by_value = self.by_tag.get(name);
            unions.push(
                values
                    .iter()
                    .flat_map(|value| {
                        by_value
                            .and_then(|map| map.get(value))
                            .into_iter()
                            .flatten()
                    })
                    .collect(),
            );
        }

        if let Some(smallest) = unions.into_iter().min_by_key(|union| union.len()) {
            return smallest
                .into_iter()
                .filter_map(|id| self.by_id.get(id).cloned())
                .collect();
        }

        // No indexed field: a time range scan if bounded, else everything
        if filter.since.is_some() || filter.until.is_some() {
            let lower = Included((filter.since.unwrap_or(0), String::new()));
            let upper = match filter.until {
                Some(until) if until < u64::MAX => Excluded((until + 1, String::new())),
                _ => Unbounded,
            };
            return self
                .by_time
                .range((lower, upper))
                .filter_map(|(_, id)| self.by_id.get(id).cloned())
                .collect();
        }

        self.by_id.values().cloned().collect()
    }
}

/// The in-memory event cache.
///
/// Cheap to share: clone an `Arc<EventStore>`. All mutation serializes on an
/// internal write lock; reads run concurrently.
#[derive(Default)]
pub struct EventStore {
    inner: RwLock<StoreInner>,
}

impl EventStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit an event into the store.
    ///
    /// Returns `false` without error for structurally invalid events, exact
    /// id duplicates, and replaceable events superseded by the held event
    /// for their key. Returns `true` after the event is present in every
    /// index.
    pub fn add_event(&self, event: Event) -> bool {
        self.add_event_arc(Arc::new(event))
    }

    /// [`EventStore::add_event`] for an event already behind an `Arc`.
    ///
    /// Used by the subscription pump, which shares the same allocation with
    /// every listener.
    pub fn add_event_arc(&self, event: Arc<Event>) -> bool {
        if let Err(err) = event.validate() {
            tracing::debug!(error = %err, "rejecting invalid event");
            counter!("store_events_rejected_total", "reason" => "invalid").increment(1);
            return false;
        }

        let mut inner = self.inner.write();

        if inner.by_id.contains_key(&event.id) {
            counter!("store_events_rejected_total", "reason" => "duplicate").increment(1);
            return false;
        }

        if let Some(key) = ReplaceableKey::for_event(&event) {
            if let Some(existing_id) = inner.replaceable.get(&key).cloned() {
                let existing = inner
                    .by_id
                    .get(&existing_id)
                    .cloned()
                    .expect("replaceable index points at a held event");
                if !supersedes(&event, &existing) {
                    counter!("store_events_rejected_total", "reason" => "superseded")
                        .increment(1);
                    return false;
                }
                inner.remove(&existing_id);
                counter!("store_events_replaced_total").increment(1);
            }
            inner.replaceable.insert(key, event.id.clone());
        }

        inner.insert(event);
        counter!("store_events_total").increment(1);
        gauge!("store_events").set(inner.by_id.len() as f64);
        true
    }

    /// Admit a batch of events; returns how many were inserted.
    ///
    /// Order within the batch does not matter: replaceable events converge
    /// on the same survivor regardless of arrival order.
    pub fn add_events(&self, events: Vec<Event>) -> usize {
        events
            .into_iter()
            .map(|event| self.add_event(event))
            .filter(|added| *added)
            .count()
    }

    /// Look up an event by id.
    pub fn get(&self, id: &str) -> Option<Arc<Event>> {
        self.inner.read().by_id.get(id).cloned()
    }

    /// Evaluate a filter list against the cache.
    ///
    /// Filters are OR'd; results are deduplicated by id, sorted by
    /// `created_at` descending (ties by id descending), and truncated to the
    /// minimum `limit` any filter specifies.
    pub fn query(&self, filters: &[Filter]) -> Vec<Arc<Event>> {
        let inner = self.inner.read();

        let mut results: Vec<Arc<Event>> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        let mut min_limit: Option<usize> = None;

        for filter in filters {
            if let Some(limit) = filter.limit {
                min_limit = Some(min_limit.map_or(limit, |current| current.min(limit)));
            }
            for event in inner.candidates(filter) {
                if filter.matches(&event) && seen.insert(event.id.clone()) {
                    results.push(event);
                }
            }
        }

        results.sort_by(|a, b| {
            (b.created_at, b.id.as_str()).cmp(&(a.created_at, a.id.as_str()))
        });
        if let Some(limit) = min_limit {
            results.truncate(limit);
        }
        results
    }

    /// Remove every event with `created_at` strictly before `cutoff`.
    ///
    /// The removal is atomic: one write lock spans the whole sweep, so no
    /// query observes a partially pruned store. Returns the removed count.
    pub fn prune_before(&self, cutoff: u64) -> usize {
        let mut inner = self.inner.write();

        let doomed: Vec<String> = inner
            .by_time
            .range(..(cutoff, String::new()))
            .map(|(_, id)| id.clone())
            .collect();
        for id in &doomed {
            inner.remove(id);
        }

        let removed = doomed.len();
        if removed > 0 {
            counter!("store_events_pruned_total").increment(removed as u64);
            gauge!("store_events").set(inner.by_id.len() as f64);
            tracing::debug!(removed, cutoff, "pruned old events");
        }
        removed
    }

    /// Remove every event older than `max_age`, measured from now.
    pub fn prune_older_than(&self, max_age: Duration) -> usize {
        let cutoff = unix_now().saturating_sub(max_age.as_secs());
        self.prune_before(cutoff)
    }

    /// Number of events currently held.
    pub fn len(&self) -> usize {
        self.inner.read().by_id.len()
    }

    /// Whether the store holds no events.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Aggregate statistics over the store contents.
    pub fn stats(&self) -> StoreStats {
        let inner = self.inner.read();
        StoreStats {
            total_events: inner.by_id.len(),
            events_by_kind: inner
                .by_kind
                .iter()
                .map(|(kind, ids)| (*kind, ids.len()))
                .collect(),
            total_authors: inner.by_author.len(),
        }
    }
}

/// The `(name, value)` pairs of an event's indexable tags.
///
/// Single-letter tag names only: those are the queryable tags, and indexing
/// arbitrary names would let one event grow the index without bound.
fn indexable_tags(event: &Event) -> impl Iterator<Item = (&str, &str)> {
    event.tags.iter().filter_map(|tag| match tag.as_slice() {
        [name, value, ..] if name.len() == 1 => Some((name.as_str(), value.as_str())),
        _ => None,
    })
}

/// Current Unix time in seconds.
pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(id_byte: u8, kind: u16, created_at: u64) -> Event {
        event_by("ab", id_byte, kind, created_at)
    }

    fn event_by(pubkey_byte: &str, id_byte: u8, kind: u16, created_at: u64) -> Event {
        Event {
            id: format!("{:02x}", id_byte).repeat(32),
            pubkey: pubkey_byte.repeat(32),
            created_at,
            kind,
            tags: vec![],
            content: String::new(),
            sig: "cd".repeat(64),
        }
    }

    fn tagged(mut event: Event, name: &str, value: &str) -> Event {
        event.tags.push(vec![name.to_string(), value.to_string()]);
        event
    }

    #[test]
    fn test_add_event_is_idempotent() {
        let store = EventStore::new();
        let e = event(0x01, 1, 100);

        assert!(store.add_event(e.clone()));
        assert_eq!(store.len(), 1);

        assert!(!store.add_event(e));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_rejects_invalid_event_silently() {
        let store = EventStore::new();
        let mut bad = event(0x01, 1, 100);
        bad.pubkey = "nope".to_string();

        assert!(!store.add_event(bad));
        assert!(store.is_empty());
    }

    #[test]
    fn test_get_by_id() {
        let store = EventStore::new();
        let e = event(0x01, 1, 100);
        store.add_event(e.clone());

        assert_eq!(store.get(&e.id).unwrap().as_ref(), &e);
        assert!(store.get(&"00".repeat(32)).is_none());
    }

    #[test]
    fn test_replaceable_keeps_latest() {
        let store = EventStore::new();
        let older = event(0x01, 0, 1000);
        let newer = event(0x02, 0, 2000);

        assert!(store.add_event(older.clone()));
        assert!(store.add_event(newer.clone()));

        let results = store.query(&[Filter::new().kind(0).author(older.pubkey.clone())]);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, newer.id);
        // The evicted event is gone from the primary index too
        assert!(store.get(&older.id).is_none());
    }

    #[test]
    fn test_replaceable_out_of_order_arrival() {
        let store = EventStore::new();
        let older = event(0x01, 0, 1000);
        let newer = event(0x02, 0, 2000);

        assert!(store.add_event(newer.clone()));
        assert!(!store.add_event(older));

        let results = store.query(&[Filter::new().kind(0)]);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, newer.id);
    }

    #[test]
    fn test_replaceable_tie_breaks_on_id() {
        let store = EventStore::new();
        let low = event(0x01, 0, 1000);
        let high = event(0xff, 0, 1000);

        assert!(store.add_event(low.clone()));
        assert!(store.add_event(high.clone()));
        assert_eq!(store.query(&[Filter::new().kind(0)])[0].id, high.id);

        // Same pair in the other order converges on the same survivor
        let store = EventStore::new();
        assert!(store.add_event(high.clone()));
        assert!(!store.add_event(low));
        assert_eq!(store.query(&[Filter::new().kind(0)])[0].id, high.id);
    }

    #[test]
    fn test_parameterized_replaceable_keyed_by_d_tag() {
        let store = EventStore::new();
        let first = tagged(event(0x01, 30023, 1000), "d", "alpha");
        let second = tagged(event(0x02, 30023, 2000), "d", "beta");
        let third = tagged(event(0x03, 30023, 3000), "d", "alpha");

        assert!(store.add_event(first.clone()));
        // Different d tag: separate slot, no eviction
        assert!(store.add_event(second.clone()));
        assert_eq!(store.len(), 2);
        // Same d tag, newer: evicts the first
        assert!(store.add_event(third.clone()));
        assert_eq!(store.len(), 2);
        assert!(store.get(&first.id).is_none());
        assert!(store.get(&third.id).is_some());
    }

    #[test]
    fn test_query_by_kind_and_tag() {
        let store = EventStore::new();
        let note = event(0x0a, 1, 10);
        let reaction = tagged(event_by("cd", 0x0b, 7, 20), "e", &note.id);
        store.add_event(note.clone());
        store.add_event(reaction.clone());

        let notes = store.query(&[Filter::new().kind(1)]);
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].id, note.id);

        let reactions = store.query(&[Filter::new().kind(7).tag("e", [note.id.clone()])]);
        assert_eq!(reactions.len(), 1);
        assert_eq!(reactions[0].id, reaction.id);

        // Tag value with no match
        let none = store.query(&[Filter::new().kind(7).tag("e", ["00".repeat(32)])]);
        assert!(none.is_empty());
    }

    #[test]
    fn test_query_or_across_filters_dedups() {
        let store = EventStore::new();
        let e = event(0x01, 1, 100);
        store.add_event(e.clone());

        // Both filters match the same event; it appears once
        let results = store.query(&[
            Filter::new().kind(1),
            Filter::new().author(e.pubkey.clone()),
        ]);
        assert_eq!(results.len(), 1);
    }

    #[test]
    fn test_query_sorts_newest_first_with_id_tie_break() {
        let store = EventStore::new();
        let a = event(0x01, 1, 100);
        let b = event(0x02, 1, 300);
        let c = event(0x03, 1, 200);
        let d = event(0x04, 1, 200);
        for e in [&a, &b, &c, &d] {
            store.add_event(e.clone());
        }

        let results = store.query(&[Filter::new().kind(1)]);
        let ids: Vec<&str> = results.iter().map(|e| e.id.as_str()).collect();
        // 300 first, then the two 200s by descending id, then 100
        assert_eq!(ids, vec![&b.id, &d.id, &c.id, &a.id]);
    }

    #[test]
    fn test_query_applies_minimum_limit() {
        let store = EventStore::new();
        for i in 0..10u8 {
            store.add_event(event(i + 1, 1, 100 + i as u64));
        }

        let results = store.query(&[
            Filter::new().kind(1).limit(8),
            Filter::new().kind(1).limit(3),
        ]);
        assert_eq!(results.len(), 3);
    }

    #[test]
    fn test_query_time_bounds() {
        let store = EventStore::new();
        store.add_event(event(0x01, 1, 100));
        store.add_event(event(0x02, 1, 200));
        store.add_event(event(0x03, 1, 300));

        let results = store.query(&[Filter::new().since(150).until(250)]);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].created_at, 200);

        // Bounds are inclusive
        let results = store.query(&[Filter::new().since(200).until(200)]);
        assert_eq!(results.len(), 1);
    }

    #[test]
    fn test_query_by_ids() {
        let store = EventStore::new();
        let a = event(0x01, 1, 100);
        let b = event(0x02, 7, 200);
        store.add_event(a.clone());
        store.add_event(b.clone());

        let results = store.query(&[Filter::new().ids([a.id.clone(), b.id.clone()])]);
        assert_eq!(results.len(), 2);
    }

    #[test]
    fn test_prune_removes_old_events_from_all_indices() {
        let store = EventStore::new();
        let now = unix_now();
        let old = tagged(event(0x01, 1, now - 10 * 86400), "e", &"aa".repeat(32));
        let recent = event(0x02, 1, now - 2 * 86400);
        store.add_event(old.clone());
        store.add_event(recent.clone());

        let removed = store.prune_older_than(Duration::from_secs(7 * 86400));
        assert_eq!(removed, 1);

        // The survivor is still fully queryable
        let results = store.query(&[Filter::new().kind(1)]);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, recent.id);

        // The pruned event is gone from the tag index too
        assert!(store
            .query(&[Filter::new().tag("e", ["aa".repeat(32)])])
            .is_empty());

        assert_eq!(store.stats().total_events, 1);
    }

    #[test]
    fn test_stats() {
        let store = EventStore::new();
        store.add_event(event_by("aa", 0x01, 1, 100));
        store.add_event(event_by("aa", 0x02, 1, 200));
        store.add_event(event_by("bb", 0x03, 7, 300));

        let stats = store.stats();
        assert_eq!(stats.total_events, 3);
        assert_eq!(stats.events_by_kind.get(&1), Some(&2));
        assert_eq!(stats.events_by_kind.get(&7), Some(&1));
        assert_eq!(stats.total_authors, 2);
    }

    #[test]
    fn test_add_events_counts_insertions() {
        let store = EventStore::new();
        let a = event(0x01, 1, 100);
        let b = event(0x02, 1, 200);

        let inserted = store.add_events(vec![a.clone(), b, a]);
        assert_eq!(inserted, 2);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_multiple_tag_values_all_indexed() {
        let store = EventStore::new();
        let root = "aa".repeat(32);
        let reply = "bb".repeat(32);
        let mut e = event(0x01, 1, 100);
        e.tags.push(vec!["e".to_string(), root.clone()]);
        e.tags.push(vec!["e".to_string(), reply.clone()]);
        store.add_event(e.clone());

        assert_eq!(store.query(&[Filter::new().tag("e", [root])]).len(), 1);
        assert_eq!(store.query(&[Filter::new().tag("e", [reply])]).len(), 1);
    }
}
