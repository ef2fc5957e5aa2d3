//! Core types, validation, and shared utilities for the Remembrall cache
//! runtime.
//!
//! This crate provides:
//! - The immutable [`Event`] record and structural validation rules
//! - Replaceable-event key derivation and supersession ordering
//! - The [`Filter`] query type with NIP-01 wire serialization and matching
//! - Prometheus metrics helpers
//! - Shared error types
//!
//! Cryptographic verification of events is out of scope: transports verify
//! ids and signatures before events reach this layer.

mod error;
mod event;
mod filter;
pub mod metrics;

pub use error::{Error, Result};
pub use event::{
    is_parameterized_kind, is_replaceable_kind, supersedes, Event, ReplaceableKey,
};
pub use filter::Filter;
