//! Production transport adapter over `nostr-sdk`.
//!
//! [`SdkTransport`] drives a `nostr_sdk::Client` relay pool and translates
//! its notification stream into [`TransportMessage`]s. One adapter instance
//! owns one pool; every `open` call becomes a set of SDK subscriptions (the
//! SDK takes one filter per subscription, so a multi-filter open issues one
//! per filter and aggregates per-relay EOSE across them).
//!
//! Events delivered by the SDK have already had their id and signature
//! verified; this adapter only converts shapes.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use nostr_sdk::prelude::*;
use remembrall_core::Filter as CoreFilter;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{PublishOutcome, RelayTransport, TransportMessage, TransportSub};
use crate::error::Result;

/// Per-`open` channel capacity toward the subscription pump.
const CHANNEL_CAPACITY: usize = 1024;

/// Configuration for the SDK transport.
#[derive(Debug, Clone)]
pub struct SdkTransportConfig {
    /// Size of the SDK notification channel buffer. Heavy subscriptions can
    /// overflow the default and drop notifications as `Lagged`.
    pub notification_channel_size: usize,

    /// How long to wait after `connect` for relay connections to establish
    /// before the transport is handed out.
    pub connect_grace: std::time::Duration,
}

impl Default for SdkTransportConfig {
    fn default() -> Self {
        Self {
            notification_channel_size: 16384,
            connect_grace: std::time::Duration::from_secs(2),
        }
    }
}

/// [`RelayTransport`] implementation over a `nostr_sdk::Client` relay pool.
pub struct SdkTransport {
    client: Client,
}

impl SdkTransport {
    /// Build a client pool, add the seed relays and connect.
    ///
    /// # Errors
    ///
    /// Returns an error if a relay cannot be added to the pool. Connection
    /// failures after that are per-relay and absorbed at runtime.
    pub async fn connect(
        relays: &[super::RelayUrl],
        config: SdkTransportConfig,
    ) -> Result<Self> {
        let pool_opts =
            RelayPoolOptions::default().notification_channel_size(config.notification_channel_size);
        let opts = ClientOptions::new().pool(pool_opts);
        let client = Client::builder().opts(opts).build();

        for relay in relays {
            client.add_relay(relay.as_str()).await?;
            tracing::debug!(relay = %relay, "added relay");
        }
        client.connect().await;

        // Give the websockets a moment so the first subscription does not
        // race an empty pool
        tokio::time::sleep(config.connect_grace).await;

        Ok(Self { client })
    }

    /// Wrap an already-configured client.
    pub fn from_client(client: Client) -> Self {
        Self { client }
    }

    /// Disconnect the underlying pool.
    pub async fn shutdown(&self) {
        self.client.disconnect().await;
    }
}

#[async_trait]
impl RelayTransport for SdkTransport {
    fn open(&self, relays: &[super::RelayUrl], filters: &[CoreFilter]) -> TransportSub {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let token = CancellationToken::new();

        tokio::spawn(run_subscription(
            self.client.clone(),
            relays.to_vec(),
            filters.to_vec(),
            tx,
            token.clone(),
        ));

        TransportSub::new(rx, token)
    }

    async fn publish(
        &self,
        relays: &[super::RelayUrl],
        event: &remembrall_core::Event,
    ) -> PublishOutcome {
        let total = relays.len();
        let all_failed = |reason: String| PublishOutcome {
            accepted: 0,
            total,
            failures: relays.iter().map(|r| (r.clone(), reason.clone())).collect(),
        };

        let sdk_event = match Event::from_json(event.as_json()) {
            Ok(event) => event,
            Err(err) => return all_failed(format!("invalid event: {}", err)),
        };

        // Relays outside the pool are added on the fly
        for relay in relays {
            if let Err(err) = self.client.add_relay(relay.as_str()).await {
                tracing::debug!(relay = %relay, error = %err, "failed to add relay for publish");
            }
        }

        let urls: Vec<String> = relays.iter().map(|r| r.as_str().to_string()).collect();
        match self.client.send_event_to(urls, &sdk_event).await {
            Ok(output) => PublishOutcome {
                accepted: output.success.len(),
                total,
                failures: output
                    .failed
                    .into_iter()
                    .filter_map(|(url, reason)| {
                        super::RelayUrl::parse(&url.to_string())
                            .ok()
                            .map(|relay| (relay, reason))
                    })
                    .collect(),
            },
            Err(err) => all_failed(err.to_string()),
        }
    }
}

/// Drive one logical subscription: issue the SDK subscriptions, translate
/// notifications, aggregate per-relay EOSE across the per-filter
/// subscription ids, and unsubscribe when the close token fires.
async fn run_subscription(
    client: Client,
    relays: Vec<super::RelayUrl>,
    filters: Vec<CoreFilter>,
    tx: mpsc::Sender<TransportMessage>,
    token: CancellationToken,
) {
    // Make sure every relay in the set is in the pool and connecting
    let mut sdk_relays: Vec<RelayUrl> = Vec::with_capacity(relays.len());
    for relay in &relays {
        if let Err(err) = client.add_relay(relay.as_str()).await {
            tracing::warn!(relay = %relay, error = %err, "failed to add relay");
            continue;
        }
        if let Err(err) = client.connect_relay(relay.as_str()).await {
            tracing::debug!(relay = %relay, error = %err, "connect_relay failed");
        }
        match RelayUrl::parse(relay.as_str()) {
            Ok(url) => sdk_relays.push(url),
            Err(err) => tracing::warn!(relay = %relay, error = %err, "unparseable relay URL"),
        }
    }

    // The SDK takes one filter per subscription
    let mut sub_ids: HashSet<SubscriptionId> = HashSet::new();
    for filter in &filters {
        let sdk_filter = match Filter::from_json(filter.to_string()) {
            Ok(filter) => filter,
            Err(err) => {
                tracing::warn!(error = %err, "filter did not convert, skipping");
                continue;
            }
        };
        match client
            .subscribe_to(sdk_relays.clone(), sdk_filter, None)
            .await
        {
            Ok(output) => {
                sub_ids.insert(output.val);
            }
            Err(err) => tracing::warn!(error = %err, "subscribe failed"),
        }
    }

    if sub_ids.is_empty() {
        // Nothing is live; report every relay as done so the pump's EOSE
        // accounting is not left hanging until the timeout
        for relay in &relays {
            let _ = tx
                .send(TransportMessage::Disconnected {
                    relay: relay.clone(),
                })
                .await;
        }
        return;
    }

    // A relay has finished its backlog once every per-filter subscription
    // on it has signaled EOSE
    let mut awaiting: HashMap<super::RelayUrl, HashSet<SubscriptionId>> = relays
        .iter()
        .map(|relay| (relay.clone(), sub_ids.clone()))
        .collect();

    let mut notifications = client.notifications();

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            notification = notifications.recv() => match notification {
                Ok(RelayPoolNotification::Event { relay_url, subscription_id, event }) => {
                    if !sub_ids.contains(&subscription_id) {
                        continue;
                    }
                    let relay = match super::RelayUrl::parse(&relay_url.to_string()) {
                        Ok(relay) => relay,
                        Err(_) => continue,
                    };
                    let event = match remembrall_core::Event::from_json(&event.as_json()) {
                        Ok(event) => event,
                        Err(err) => {
                            tracing::debug!(error = %err, "dropping unconvertible event");
                            continue;
                        }
                    };
                    if tx.send(TransportMessage::Event { relay, event }).await.is_err() {
                        break;
                    }
                }
                Ok(RelayPoolNotification::Message { relay_url, message }) => {
                    let relay = match super::RelayUrl::parse(&relay_url.to_string()) {
                        Ok(relay) => relay,
                        Err(_) => continue,
                    };
                    match message {
                        RelayMessage::EndOfStoredEvents(sid) => {
                            if !sub_ids.contains(sid.as_ref()) {
                                continue;
                            }
                            if let Some(pending) = awaiting.get_mut(&relay) {
                                pending.remove(sid.as_ref());
                                if pending.is_empty() {
                                    awaiting.remove(&relay);
                                    if tx.send(TransportMessage::Eose { relay }).await.is_err() {
                                        break;
                                    }
                                }
                            }
                        }
                        RelayMessage::Closed { subscription_id, message } => {
                            if !sub_ids.contains(subscription_id.as_ref()) {
                                continue;
                            }
                            tracing::debug!(relay = %relay, reason = %message, "relay closed subscription");
                            awaiting.remove(&relay);
                            if tx
                                .send(TransportMessage::Disconnected { relay })
                                .await
                                .is_err()
                            {
                                break;
                            }
                        }
                        _ => {}
                    }
                }
                Ok(RelayPoolNotification::Shutdown) => break,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(count)) => {
                    tracing::warn!(count, "notification receiver lagged, messages dropped");
                    continue;
                }
            }
        }
    }

    for sub_id in &sub_ids {
        client.unsubscribe(sub_id).await;
    }
}
