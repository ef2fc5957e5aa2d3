//! Filter type and matching.
//!
//! A [`Filter`] is a declarative query over events: optional id/author/kind
//! sets, tag constraints, an inclusive `since`/`until` time range and a
//! result `limit`. Fields within one filter are AND'd; a list of filters is
//! OR'd by callers.
//!
//! Set-valued fields are `BTreeSet`s, so a filter is canonical by
//! construction (sorted, deduplicated). The subscription fingerprint relies
//! on this: two filters built from the same constraints in any order
//! serialize to the same JSON.
//!
//! On the wire (NIP-01), tag constraints appear as `"#<name>"` keys, e.g.
//! `{"kinds":[7],"#e":["abc..."]}`. The flattened `tags` map carries those
//! keys verbatim; [`Filter::tag`] adds the `#` prefix for you.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::event::Event;

/// A declarative query over events.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    /// Exact event ids to match.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ids: Option<BTreeSet<String>>,

    /// Author public keys to match.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authors: Option<BTreeSet<String>>,

    /// Event kinds to match.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kinds: Option<BTreeSet<u16>>,

    /// Earliest `created_at` to match (inclusive).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<u64>,

    /// Latest `created_at` to match (inclusive).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub until: Option<u64>,

    /// Maximum number of results, applied after sorting.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,

    /// Tag constraints, keyed by `"#<name>"` (wire form).
    ///
    /// An event matches an entry if any of its tags has that name and a
    /// value in the set. Non-`#` keys that arrive via deserialization are
    /// carried but ignored by [`Filter::matches`].
    #[serde(flatten)]
    pub tags: BTreeMap<String, BTreeSet<String>>,
}

impl Filter {
    /// Create an empty filter (matches everything).
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict to a single event id.
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.ids.get_or_insert_with(BTreeSet::new).insert(id.into());
        self
    }

    /// Restrict to a set of event ids.
    pub fn ids<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ids
            .get_or_insert_with(BTreeSet::new)
            .extend(ids.into_iter().map(Into::into));
        self
    }

    /// Restrict to a single author.
    pub fn author(mut self, pubkey: impl Into<String>) -> Self {
        self.authors
            .get_or_insert_with(BTreeSet::new)
            .insert(pubkey.into());
        self
    }

    /// Restrict to a set of authors.
    pub fn authors<I, S>(mut self, pubkeys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.authors
            .get_or_insert_with(BTreeSet::new)
            .extend(pubkeys.into_iter().map(Into::into));
        self
    }

    /// Restrict to a single kind.
    pub fn kind(mut self, kind: u16) -> Self {
        self.kinds.get_or_insert_with(BTreeSet::new).insert(kind);
        self
    }

    /// Restrict to a set of kinds.
    pub fn kinds<I>(mut self, kinds: I) -> Self
    where
        I: IntoIterator<Item = u16>,
    {
        self.kinds.get_or_insert_with(BTreeSet::new).extend(kinds);
        self
    }

    /// Add a tag constraint: match events with a `name` tag whose value is
    /// one of `values`.
    ///
    /// `name` is the bare tag name (`"e"`, `"p"`, ...); the `#` wire prefix
    /// is added here.
    pub fn tag<I, S>(mut self, name: &str, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags
            .entry(format!("#{}", name))
            .or_default()
            .extend(values.into_iter().map(Into::into));
        self
    }

    /// Set the inclusive lower time bound.
    pub fn since(mut self, since: u64) -> Self {
        self.since = Some(since);
        self
    }

    /// Set the inclusive upper time bound.
    pub fn until(mut self, until: u64) -> Self {
        self.until = Some(until);
        self
    }

    /// Set the result limit.
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Tag constraint entries as `(name, values)` pairs, `#` prefix stripped.
    ///
    /// Skips any flattened keys that are not tag constraints.
    pub fn tag_entries(&self) -> impl Iterator<Item = (&str, &BTreeSet<String>)> {
        self.tags
            .iter()
            .filter_map(|(key, values)| key.strip_prefix('#').map(|name| (name, values)))
    }

    /// Whether the filter has no constraints at all (matches everything).
    pub fn is_empty(&self) -> bool {
        self.ids.is_none()
            && self.authors.is_none()
            && self.kinds.is_none()
            && self.since.is_none()
            && self.until.is_none()
            && self.limit.is_none()
            && self.tag_entries().next().is_none()
    }

    /// Whether an event satisfies every constraint of this filter.
    pub fn matches(&self, event: &Event) -> bool {
        if let Some(ids) = &self.ids {
            if !ids.contains(&event.id) {
                return false;
            }
        }
        if let Some(authors) = &self.authors {
            if !authors.contains(&event.pubkey) {
                return false;
            }
        }
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&event.kind) {
                return false;
            }
        }
        if let Some(since) = self.since {
            if event.created_at < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if event.created_at > until {
                return false;
            }
        }
        for (name, values) in self.tag_entries() {
            let hit = event.tags.iter().any(|tag| {
                tag.len() >= 2 && tag[0] == name && values.contains(&tag[1])
            });
            if !hit {
                return false;
            }
        }
        true
    }

    /// Whether any filter in a list matches the event (filters are OR'd).
    pub fn any_match(filters: &[Filter], event: &Event) -> bool {
        filters.iter().any(|f| f.matches(event))
    }
}

impl fmt::Display for Filter {
    /// Compact canonical JSON, used in logs and subscription listings.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let json = serde_json::to_string(self).map_err(|_| fmt::Error)?;
        f.write_str(&json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::test_event;

    #[test]
    fn test_empty_filter_matches_everything() {
        let filter = Filter::new();
        assert!(filter.is_empty());
        assert!(filter.matches(&test_event(0x01, 1, 100)));
        assert!(filter.matches(&test_event(0x02, 30023, 1700000000)));
    }

    #[test]
    fn test_kind_and_author_constraints() {
        let event = test_event(0x01, 1, 100);
        assert!(Filter::new().kind(1).matches(&event));
        assert!(!Filter::new().kind(7).matches(&event));
        assert!(Filter::new().author(event.pubkey.clone()).matches(&event));
        assert!(!Filter::new().author("ff".repeat(32)).matches(&event));
        // AND across fields
        assert!(!Filter::new().kind(1).author("ff".repeat(32)).matches(&event));
    }

    #[test]
    fn test_time_bounds_inclusive() {
        let event = test_event(0x01, 1, 100);
        assert!(Filter::new().since(100).matches(&event));
        assert!(Filter::new().until(100).matches(&event));
        assert!(!Filter::new().since(101).matches(&event));
        assert!(!Filter::new().until(99).matches(&event));
    }

    #[test]
    fn test_tag_constraint() {
        let mut reaction = test_event(0x02, 7, 200);
        let target = "aa".repeat(32);
        reaction.tags = vec![vec!["e".to_string(), target.clone()]];

        assert!(Filter::new().tag("e", [target.clone()]).matches(&reaction));
        assert!(!Filter::new().tag("e", ["bb".repeat(32)]).matches(&reaction));
        // Tag name must match too
        assert!(!Filter::new().tag("p", [target]).matches(&reaction));
    }

    #[test]
    fn test_id_constraint() {
        let event = test_event(0x03, 1, 100);
        assert!(Filter::new().id(event.id.clone()).matches(&event));
        assert!(!Filter::new().id("00".repeat(32)).matches(&event));
    }

    #[test]
    fn test_any_match_is_or() {
        let note = test_event(0x01, 1, 100);
        let filters = vec![Filter::new().kind(7), Filter::new().kind(1)];
        assert!(Filter::any_match(&filters, &note));
        let filters = vec![Filter::new().kind(7), Filter::new().kind(6)];
        assert!(!Filter::any_match(&filters, &note));
    }

    #[test]
    fn test_wire_serialization_uses_hash_keys() {
        let filter = Filter::new().kinds([7]).tag("e", ["aa".repeat(32)]);
        let json = serde_json::to_string(&filter).unwrap();
        assert!(json.contains("\"#e\""));
        assert!(json.contains("\"kinds\":[7]"));

        let parsed: Filter = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, filter);
    }

    #[test]
    fn test_canonical_serialization_order_independent() {
        let a = Filter::new().kinds([1, 7]).authors(["bb".repeat(32), "aa".repeat(32)]);
        let b = Filter::new().kinds([7, 1]).authors(["aa".repeat(32), "bb".repeat(32)]);
        assert_eq!(
            serde_json::to_string(&a).unwrap(),
            serde_json::to_string(&b).unwrap()
        );
    }

    #[test]
    fn test_duplicate_values_collapse() {
        let filter = Filter::new().kinds([1, 1, 1]);
        assert_eq!(filter.kinds.as_ref().unwrap().len(), 1);
    }

    #[test]
    fn test_display_is_compact_json() {
        let filter = Filter::new().kind(0).limit(10);
        let shown = filter.to_string();
        assert!(shown.contains("\"kinds\":[0]"));
        assert!(shown.contains("\"limit\":10"));
    }
}
