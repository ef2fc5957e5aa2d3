//! Transport boundary: the wire-level relay capability this crate builds on.
//!
//! The cache layer never speaks the relay protocol itself. It consumes an
//! opaque [`RelayTransport`]: something that can publish an event to a set of
//! relays and open a filtered subscription that yields events, per-relay
//! end-of-stored-events signals, and per-relay disconnect notices.
//!
//! # Implementations
//!
//! - [`SdkTransport`](sdk::SdkTransport) - production adapter over `nostr-sdk`
//! - [`MockTransport`](mock::MockTransport) - in-memory transport for tests
//!   and offline development
//!
//! # Failure Semantics
//!
//! A transport never surfaces per-relay failures as errors: a relay that
//! drops mid-subscription emits [`TransportMessage::Disconnected`] and simply
//! stops contributing events. Publish failures are reported as data in
//! [`PublishOutcome`].

pub mod mock;
pub mod sdk;
mod url;

pub use url::RelayUrl;

use async_trait::async_trait;
use remembrall_core::{Event, Filter};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Messages delivered on an open transport subscription.
#[derive(Debug, Clone)]
pub enum TransportMessage {
    /// An event arrived from a relay.
    Event {
        /// The relay that delivered the event.
        relay: RelayUrl,
        /// The event itself (already cryptographically verified upstream).
        event: Event,
    },
    /// A relay signaled that it has delivered all stored events.
    Eose {
        /// The relay that signaled.
        relay: RelayUrl,
    },
    /// A relay dropped or closed the subscription.
    ///
    /// The relay stops contributing events; it is not an error.
    Disconnected {
        /// The relay that dropped.
        relay: RelayUrl,
    },
}

/// An open network-level subscription.
///
/// Carries the message stream and a cancellation token; cancelling the token
/// closes the underlying subscription on every relay.
pub struct TransportSub {
    receiver: mpsc::Receiver<TransportMessage>,
    token: CancellationToken,
}

impl TransportSub {
    /// Bundle a message stream with its close token.
    pub fn new(receiver: mpsc::Receiver<TransportMessage>, token: CancellationToken) -> Self {
        Self { receiver, token }
    }

    /// A clone of the close token.
    ///
    /// Cancelling it closes the subscription; the message stream then ends.
    pub fn close_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Split into the message stream and the close token.
    pub fn into_parts(self) -> (mpsc::Receiver<TransportMessage>, CancellationToken) {
        (self.receiver, self.token)
    }
}

/// Structured result of publishing an event to a relay set.
///
/// Publish failure is data, not an exception: callers decide whether
/// "at least one relay accepted" is sufficient success.
#[derive(Debug, Clone, Default)]
pub struct PublishOutcome {
    /// Number of relays that accepted the event.
    pub accepted: usize,
    /// Number of relays the event was submitted to.
    pub total: usize,
    /// Per-relay failure reasons.
    pub failures: Vec<(RelayUrl, String)>,
}

impl PublishOutcome {
    /// Whether at least one relay accepted the event.
    pub fn any_accepted(&self) -> bool {
        self.accepted > 0
    }

    /// Whether every relay accepted the event.
    pub fn all_accepted(&self) -> bool {
        self.accepted == self.total && self.total > 0
    }
}

/// The wire-level relay capability.
///
/// Implementations own their connections. Both methods are non-blocking with
/// respect to network I/O: `open` returns a handle immediately and delivers
/// messages asynchronously; `publish` is async and resolves to a structured
/// per-relay outcome.
#[async_trait]
pub trait RelayTransport: Send + Sync + 'static {
    /// Open a subscription for `filters` across `relays`.
    ///
    /// The returned stream yields every matching event any relay delivers,
    /// one [`TransportMessage::Eose`] per relay that completes its stored
    /// backlog, and [`TransportMessage::Disconnected`] for relays that drop.
    /// The stream ends after the close token is cancelled.
    fn open(&self, relays: &[RelayUrl], filters: &[Filter]) -> TransportSub;

    /// Publish an event to every relay in the set.
    async fn publish(&self, relays: &[RelayUrl], event: &Event) -> PublishOutcome;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_outcome_accessors() {
        let outcome = PublishOutcome {
            accepted: 2,
            total: 3,
            failures: vec![(
                RelayUrl::parse("wss://r3.example.com").unwrap(),
                "rate limited".to_string(),
            )],
        };
        assert!(outcome.any_accepted());
        assert!(!outcome.all_accepted());

        let none = PublishOutcome::default();
        assert!(!none.any_accepted());
        assert!(!none.all_accepted());
    }
}
