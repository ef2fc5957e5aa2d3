//! Remembrall cache runtime.
//!
//! This crate is the local event cache and subscription multiplexing layer
//! of a Nostr client: everything between the UI and the raw relay
//! connections.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │                 Runtime                     │  query / subscribe /
//! │  (facade: the entry point consumers call)   │  add_event / get /
//! └──────┬──────────────┬──────────────┬────────┘  fetch_batched / publish
//!        │              │              │
//!        ▼              ▼              ▼
//! ┌────────────┐ ┌─────────────┐ ┌────────────┐
//! │ EventStore │ │Subscription │ │  Request   │
//! │ (multi-    │◄┤  Manager    │ │  Batcher   │
//! │  indexed)  │ │ (dedup +    │◄┤ (debounced │
//! └────────────┘ │  fan-out)   │ │  coalesce) │
//!                └──────┬──────┘ └────────────┘
//!                       │
//!                       ▼
//!                ┌─────────────┐
//!                │RelayTransport│  (nostr-sdk adapter, or a mock)
//!                └─────────────┘
//! ```
//!
//! Incoming events are written through the store before they are fanned out
//! to listeners, so the cache is always at least as fresh as anything a
//! consumer has seen. Identical `(relay set, filter list)` subscriptions
//! share one network subscription; single-id lookups coalesce into batched
//! filter queries.
//!
//! Nothing is persisted: the store is rebuilt from the network each process
//! lifetime.
//!
//! The runtime spawns background tasks (subscription pumps, debounce timers)
//! and therefore must be used from within a Tokio runtime.

pub mod batch;
mod config;
pub mod error;
pub mod store;
pub mod subs;
pub mod transport;

mod runtime;

pub use batch::{BatchConfig, Purpose, RequestBatcher};
pub use config::RuntimeConfig;
pub use error::{Error, Result};
pub use runtime::{Runtime, SubscribeOptions};
pub use store::{EventStore, StoreStats};
pub use subs::{
    Subscription, SubscriptionInfo, SubscriptionManager, SubscriptionMessage, SubsConfig,
};
pub use transport::{
    mock::MockTransport, sdk::SdkTransport, sdk::SdkTransportConfig, PublishOutcome,
    RelayTransport, RelayUrl, TransportMessage, TransportSub,
};

// Re-export the core types so consumers need a single dependency surface.
pub use remembrall_core::{Event, Filter};
