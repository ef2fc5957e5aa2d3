//! Event model and structural validation.
//!
//! This module defines the immutable [`Event`] record and the structural
//! admission rules applied before an event may enter the cache:
//! - `id`, `pubkey`, `sig` present with the correct hex lengths
//! - `created_at` non-zero
//! - every tag non-empty (the first element is the tag name)
//!
//! Cryptographic verification (event ID hash, Schnorr signature) is NOT done
//! here. Events are assumed to be verified by the transport layer before they
//! reach this crate; the signature is carried as an opaque string.
//!
//! # Replaceable Events
//!
//! Kinds 0, 3 and 10000-19999 are replaceable: the cache keeps at most one
//! event per `(kind, pubkey)`. Kinds 30000-39999 are parameterized
//! replaceable (addressable): keyed by `(kind, pubkey, d-tag value)`.
//! [`ReplaceableKey::for_event`] derives the key; [`supersedes`] decides
//! which of two events for the same key survives.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// An immutable Nostr event.
///
/// Fields follow the NIP-01 wire shape. Once an event is admitted into the
/// store its fields never change; "updates" are new events with new ids.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Content-derived event fingerprint (64 lowercase hex chars).
    pub id: String,
    /// Author public key (64 lowercase hex chars).
    pub pubkey: String,
    /// Creation timestamp (Unix seconds).
    pub created_at: u64,
    /// Integer event category.
    pub kind: u16,
    /// Ordered list of tags; each tag's first element is its name.
    pub tags: Vec<Vec<String>>,
    /// Event payload.
    pub content: String,
    /// Schnorr signature (128 hex chars), opaque to this layer.
    pub sig: String,
}

impl Event {
    /// Parse an event from its NIP-01 JSON representation and validate it
    /// structurally.
    ///
    /// # Errors
    ///
    /// Returns an error if the JSON is malformed or any field fails the
    /// structural checks in [`Event::validate`].
    pub fn from_json(json: &str) -> Result<Self> {
        let event: Event = serde_json::from_str(json)?;
        event.validate()?;
        Ok(event)
    }

    /// Serialize the event to its NIP-01 JSON representation.
    pub fn as_json(&self) -> String {
        serde_json::to_string(self).expect("event serialization cannot fail")
    }

    /// Validate the event's structure.
    ///
    /// This is the single admission gate used by the store: events failing
    /// any of these checks are rejected. No cryptographic checks are done.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidField`] naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        if !is_lower_hex(&self.id, 64) {
            return Err(Error::InvalidField {
                field: "id",
                reason: "must be 64 lowercase hex characters".to_string(),
            });
        }
        if !is_lower_hex(&self.pubkey, 64) {
            return Err(Error::InvalidField {
                field: "pubkey",
                reason: "must be 64 lowercase hex characters".to_string(),
            });
        }
        if !is_lower_hex(&self.sig, 128) {
            return Err(Error::InvalidField {
                field: "sig",
                reason: "must be 128 lowercase hex characters".to_string(),
            });
        }
        if self.created_at == 0 {
            return Err(Error::InvalidField {
                field: "created_at",
                reason: "must be non-zero".to_string(),
            });
        }
        for (i, tag) in self.tags.iter().enumerate() {
            if tag.is_empty() || tag[0].is_empty() {
                return Err(Error::InvalidField {
                    field: "tags",
                    reason: format!("tag {} has no name", i),
                });
            }
        }
        Ok(())
    }

    /// The value of the first tag with the given name, if any.
    ///
    /// Tags with no value element (`["name"]`) yield `None`.
    pub fn tag_value(&self, name: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|tag| tag.first().map(String::as_str) == Some(name))
            .and_then(|tag| tag.get(1))
            .map(String::as_str)
    }

    /// The value of the first `d` tag, or the empty string if absent.
    ///
    /// Used to key parameterized replaceable events.
    pub fn d_tag(&self) -> &str {
        self.tag_value("d").unwrap_or("")
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Replaceable event keys
// ═══════════════════════════════════════════════════════════════════════════

/// Whether a kind is replaceable (at most one event per `(kind, pubkey)`).
pub fn is_replaceable_kind(kind: u16) -> bool {
    kind == 0 || kind == 3 || (10000..20000).contains(&kind)
}

/// Whether a kind is parameterized replaceable (keyed by the `d` tag too).
pub fn is_parameterized_kind(kind: u16) -> bool {
    (30000..40000).contains(&kind)
}

/// Derived key identifying the slot a replaceable event occupies.
///
/// The store holds at most one event per key: the one with the greatest
/// `created_at`, ties broken by lexicographically greatest `id` (see
/// [`supersedes`]).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ReplaceableKey {
    /// Key for kinds 0, 3 and 10000-19999.
    Replaceable {
        /// Event kind.
        kind: u16,
        /// Author public key.
        pubkey: String,
    },
    /// Key for kinds 30000-39999, parameterized by the `d` tag value.
    Parameterized {
        /// Event kind.
        kind: u16,
        /// Author public key.
        pubkey: String,
        /// Value of the first `d` tag (empty string if absent).
        d_tag: String,
    },
}

impl ReplaceableKey {
    /// Derive the replaceable key for an event, or `None` for regular kinds.
    pub fn for_event(event: &Event) -> Option<Self> {
        if is_replaceable_kind(event.kind) {
            Some(Self::Replaceable {
                kind: event.kind,
                pubkey: event.pubkey.clone(),
            })
        } else if is_parameterized_kind(event.kind) {
            Some(Self::Parameterized {
                kind: event.kind,
                pubkey: event.pubkey.clone(),
                d_tag: event.d_tag().to_string(),
            })
        } else {
            None
        }
    }
}

/// Whether `incoming` replaces `existing` for the same replaceable key.
///
/// Greater `created_at` wins; for equal timestamps the lexicographically
/// greatest id wins, so resolution is deterministic regardless of the order
/// in which relays deliver the two events.
pub fn supersedes(incoming: &Event, existing: &Event) -> bool {
    (incoming.created_at, incoming.id.as_str()) > (existing.created_at, existing.id.as_str())
}

fn is_lower_hex(s: &str, len: usize) -> bool {
    s.len() == len
        && s.bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

/// Build a structurally valid event for tests, with a recognizable id.
#[cfg(test)]
pub(crate) fn test_event(id_byte: u8, kind: u16, created_at: u64) -> Event {
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
