//! Remembrall tail daemon.
//!
//! Debug binary for exercising the cache runtime against live relays: opens
//! a subscription for the requested kinds, tails matching events to the log,
//! reports store and subscription statistics on an interval, and serves
//! Prometheus metrics.
//!
//! # Usage
//!
//! ```bash
//! # Tail kind-1 notes from the default relays
//! remembrall-tail
//!
//! # Tail reactions and reposts from specific relays
//! remembrall-tail \
//!     --relays wss://relay.damus.io,wss://nos.lol \
//!     --kinds 6,7
//! ```
//!
//! # Graceful Shutdown
//!
//! SIGINT (Ctrl+C) closes every live subscription, prints final statistics
//! and exits cleanly.

use anyhow::{Context, Result};
use clap::Parser;
use remembrall_core::metrics::{init_metrics, start_metrics_server};
use remembrall_core::Filter;
use remembrall_runtime::{
    Runtime, SdkTransport, SdkTransportConfig, SubscribeOptions, SubscriptionMessage, RelayUrl,
};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Remembrall tail daemon.
#[derive(Parser, Debug)]
#[command(name = "remembrall-tail")]
#[command(about = "Tail Nostr events through the Remembrall cache runtime")]
#[command(version)]
struct Args {
    /// Relay URLs (comma-separated)
    #[arg(
        long,
        value_delimiter = ',',
        default_value = "wss://relay.damus.io,wss://nos.lol,wss://relay.primal.net"
    )]
    relays: Vec<String>,

    /// Event kinds to subscribe to (comma-separated)
    #[arg(long, value_delimiter = ',', default_value = "1")]
    kinds: Vec<u16>,

    /// Restrict to these author pubkeys (comma-separated hex)
    #[arg(long, value_delimiter = ',')]
    authors: Option<Vec<String>>,

    /// Only request events from the last N seconds
    #[arg(long)]
    since_secs: Option<u64>,

    /// How often to log store/subscription statistics (seconds)
    #[arg(long, default_value = "60")]
    stats_interval: u64,

    /// Prune events older than this many days
    #[arg(long, default_value = "7")]
    prune_days: u64,

    /// Metrics HTTP server port (0 to disable)
    #[arg(long, default_value = "9090")]
    metrics_port: u16,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Install rustls crypto provider (required when both ring and aws-lc-rs
    // are present)
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("info".parse().unwrap())
                .add_directive("remembrall_runtime=debug".parse().unwrap()),
        )
        .init();

    let args = Args::parse();

    tracing::info!("Remembrall tail daemon starting...");

    if args.metrics_port > 0 {
        let handle = init_metrics();
        start_metrics_server(args.metrics_port, handle).await?;
    }

    let relays: Vec<RelayUrl> = args
        .relays
        .iter()
        .map(|url| RelayUrl::parse(url))
        .collect::<remembrall_core::Result<_>>()
        .context("invalid relay URL")?;

    let transport = SdkTransport::connect(&relays, SdkTransportConfig::default())
        .await
        .context("failed to connect relay pool")?;
    let runtime = Runtime::new(Arc::new(transport));
    let _pruner = runtime.spawn_pruner();

    let mut filter = Filter::new().kinds(args.kinds.iter().copied());
    if let Some(authors) = &args.authors {
        filter = filter.authors(authors.iter().cloned());
    }
    if let Some(secs) = args.since_secs {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        filter = filter.since(now.saturating_sub(secs));
    }
    tracing::info!(relays = relays.len(), filter = %filter, "subscribing");

    let mut sub = runtime.subscribe(&relays, &[filter], SubscribeOptions::default());

    let mut stats_ticker = tokio::time::interval(Duration::from_secs(args.stats_interval));
    stats_ticker.tick().await; // immediate first tick

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutdown requested");
                break;
            }
            _ = stats_ticker.tick() => {
                log_stats(&runtime);
            }
            message = sub.recv() => match message {
                Some(SubscriptionMessage::Event(event)) => {
                    let when = chrono::DateTime::from_timestamp(event.created_at as i64, 0)
                        .map(|dt| dt.format("%H:%M:%S").to_string())
                        .unwrap_or_else(|| "?".to_string());
                    tracing::info!(
                        kind = event.kind,
                        author = &event.pubkey[..8],
                        at = %when,
                        "{}",
                        truncate(&event.content, 80)
                    );
                }
                Some(SubscriptionMessage::Eose) => {
                    tracing::info!("end of stored events; now tailing live");
                }
                None => {
                    tracing::warn!("subscription stream ended");
                    break;
                }
            }
        }
    }

    runtime.close_all();
    let removed = runtime.prune_old_events(args.prune_days);
    if removed > 0 {
        tracing::info!(removed, "pruned before exit");
    }
    log_stats(&runtime);
    if let Ok(json) = serde_json::to_string_pretty(&runtime.stats()) {
        println!("{}", json);
    }

    Ok(())
}

fn log_stats(runtime: &Runtime) {
    let stats = runtime.stats();
    let subs = runtime.list_subscriptions();
    tracing::info!(
        events = stats.total_events,
        authors = stats.total_authors,
        kinds = stats.events_by_kind.len(),
        subscriptions = subs.len(),
        "cache statistics"
    );
    for info in subs {
        tracing::debug!(
            id = info.id,
            relays = info.relay_count,
            listeners = info.listener_count,
            age_secs = info.age.as_secs(),
            filters = %info.filters,
            "live subscription"
        );
    }
}

/// Single-line preview of event content for the log.
fn truncate(content: &str, max: usize) -> String {
    let line = content.replace('\n', " ");
    if line.chars().count() <= max {
        line
    } else {
        let cut: String = line.chars().take(max).collect();
        format!("{}…", cut)
    }
}
