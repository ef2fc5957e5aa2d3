//! Error types for the cache runtime.

use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while setting up the runtime or its transport.
///
/// Steady-state operation does not error: malformed events are rejected via
/// boolean returns, relay failures are absorbed into coverage accounting,
/// and publish failures are reported as data.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid event, filter, or relay URL.
    #[error(transparent)]
    Core(#[from] remembrall_core::Error),

    /// Nostr SDK error (connection setup, subscription plumbing).
    #[error("Nostr SDK error: {0}")]
    NostrSdk(#[from] nostr_sdk::client::Error),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),
}
