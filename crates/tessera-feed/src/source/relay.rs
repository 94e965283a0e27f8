//! nostr-sdk backed [`Transport`].
//!
//! One `Client` is shared by every live subscription and historical query.
//! Pool notifications are filtered by subscription id and converted into
//! [`TransportMessage`]s; a subscription counts as closed once every relay
//! in the pool has sent `CLOSED` for it, or when the pool shuts down.

use std::collections::HashSet;
use std::time::Duration;

use nostr_sdk::prelude::*;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;

use super::{Subscription, TimelineFilter, Transport, TransportMessage};
use crate::Result;
use tessera_core::TimelineEvent;

/// Configuration for the relay transport.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Relay URLs to connect to.
    pub relays: Vec<String>,

    /// How long to wait for initial connections before subscribing.
    pub connect_grace: Duration,

    /// Timeout for historical queries.
    pub query_timeout: Duration,

    /// Size of the pool notification buffer.
    ///
    /// Default: 16384 (4x the nostr-sdk default of 4096)
    pub notification_channel_size: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            relays: vec![
                "wss://relay.damus.io".to_string(),
                "wss://nos.lol".to_string(),
                "wss://relay.primal.net".to_string(),
                "wss://relay.snort.social".to_string(),
            ],
            connect_grace: Duration::from_secs(2),
            query_timeout: Duration::from_secs(10),
            notification_channel_size: 16384,
        }
    }
}

/// Per-relay outcome of a publish.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishReport {
    /// Relays that accepted the event.
    pub accepted: Vec<String>,
    /// Relays that rejected it, with their reason.
    pub rejected: Vec<(String, String)>,
}

/// Relay transport over a nostr-sdk `Client`.
pub struct NostrTransport {
    client: Client,
    config: RelayConfig,
}

impl NostrTransport {
    /// Add the configured relays and connect.
    pub async fn connect(config: RelayConfig) -> Result<Self> {
        let pool_opts =
            RelayPoolOptions::default().notification_channel_size(config.notification_channel_size);
        let client = Client::builder()
            .opts(ClientOptions::new().pool(pool_opts))
            .build();

        let mut added = 0usize;
        for relay_url in &config.relays {
            if let Err(e) = client.add_relay(relay_url).await {
                tracing::warn!("Failed to add relay {}: {}", relay_url, e);
            } else {
                tracing::debug!("Added relay: {}", relay_url);
                added += 1;
            }
        }
        if added == 0 {
            return Err(crate::Error::Config("no usable relay URLs".to_string()));
        }

        client.connect().await;

        // Give connections a moment so the first REQ is not queued behind them
        tokio::time::sleep(config.connect_grace).await;

        let relays = client.relays().await;
        let connected = relays
            .values()
            .filter(|relay| relay.status() == RelayStatus::Connected)
            .count();
        tracing::info!("Connected to {}/{} relays", connected, relays.len());

        Ok(Self { client, config })
    }

    /// The underlying client.
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Send an already-signed event to every connected relay.
    pub async fn publish(&self, event: &TimelineEvent) -> Result<PublishReport> {
        let json = serde_json::to_string(event)?;
        let event = Event::from_json(&json).map_err(tessera_core::Error::from)?;
        let output = self.client.send_event(&event).await?;

        let mut report = PublishReport {
            accepted: output.success.iter().map(|url| url.to_string()).collect(),
            rejected: output
                .failed
                .iter()
                .map(|(url, reason)| (url.to_string(), reason.clone()))
                .collect(),
        };
        report.accepted.sort();
        report.rejected.sort();

        tracing::info!(
            id = %output.val,
            accepted = report.accepted.len(),
            rejected = report.rejected.len(),
            "Published event"
        );
        Ok(report)
    }

    /// Disconnect from all relays.
    pub async fn disconnect(&self) {
        self.client.disconnect().await;
    }
}

impl Transport for NostrTransport {
    async fn subscribe(&self, filter: &TimelineFilter) -> Result<Subscription> {
        // Take the receiver first so nothing sent right after REQ is missed
        let mut notifications = self.client.notifications();
        let output = self.client.subscribe(to_nostr_filter(filter), None).await?;
        let subscription_id = output.val;
        tracing::info!("Subscribed with ID: {}", subscription_id);

        let (tx, rx) = mpsc::unbounded_channel();
        let client = self.client.clone();
        let forward_id = subscription_id.clone();

        let forwarder = tokio::spawn(async move {
            let mut closed_by: HashSet<RelayUrl> = HashSet::new();
            loop {
                let notification = match notifications.recv().await {
                    Ok(n) => n,
                    Err(RecvError::Lagged(count)) => {
                        metrics::counter!("relay_notifications_lagged_total").increment(count);
                        tracing::warn!("Notification receiver lagged, dropped {} messages", count);
                        continue;
                    }
                    Err(RecvError::Closed) => {
                        let _ = tx.send(TransportMessage::Closed(
                            "notification channel closed".to_string(),
                        ));
                        break;
                    }
                };

                match notification {
                    RelayPoolNotification::Event {
                        subscription_id,
                        event,
                        ..
                    } => {
                        if subscription_id != forward_id {
                            continue;
                        }
                        let event = TimelineEvent::from(event.as_ref());
                        if tx.send(TransportMessage::Event(event)).is_err() {
                            break;
                        }
                    }
                    RelayPoolNotification::Message {
                        relay_url,
                        message:
                            RelayMessage::Closed {
                                subscription_id,
                                message,
                            },
                    } => {
                        if subscription_id.to_string() != forward_id.to_string() {
                            continue;
                        }
                        tracing::debug!("Relay {} closed subscription: {}", relay_url, message);
                        closed_by.insert(relay_url);

                        let total = client.relays().await.len();
                        if closed_by.len() >= total {
                            let _ = tx.send(TransportMessage::Closed(message.to_string()));
                            break;
                        }
                    }
                    RelayPoolNotification::Message { .. } => {}
                    RelayPoolNotification::Shutdown => {
                        tracing::info!("Relay pool shutdown notification received");
                        let reason = "relay pool shutdown".to_string();
                        let _ = tx.send(TransportMessage::Closed(reason));
                        break;
                    }
                }
            }
        });

        let client = self.client.clone();
        Ok(
            Subscription::new(subscription_id.to_string(), rx).on_drop(move || {
                forwarder.abort();
                if let Ok(handle) = tokio::runtime::Handle::try_current() {
                    handle.spawn(async move {
                        client.unsubscribe(&subscription_id).await;
                    });
                }
            }),
        )
    }

    async fn query(&self, filter: &TimelineFilter) -> Result<Vec<TimelineEvent>> {
        let events = self
            .client
            .fetch_events(to_nostr_filter(filter), self.config.query_timeout)
            .await?;
        Ok(events.iter().map(TimelineEvent::from).collect())
    }
}

/// Translate a [`TimelineFilter`] into a nostr filter.
///
/// Malformed author keys and non-single-letter tag names are skipped.
fn to_nostr_filter(filter: &TimelineFilter) -> Filter {
    let mut out = Filter::new().kinds(filter.kinds.iter().map(|k| Kind::from(*k)));

    if let Some(authors) = &filter.authors {
        let keys: Vec<PublicKey> = authors
            .iter()
            .filter_map(|hex| match PublicKey::from_hex(hex) {
                Ok(pk) => Some(pk),
                Err(e) => {
                    tracing::debug!("Skipping author {}: {}", hex, e);
                    None
                }
            })
            .collect();
        out = out.authors(keys);
    }

    for (name, values) in &filter.tags {
        let mut chars = name.chars();
        let tag = match (chars.next(), chars.next()) {
            (Some(c), None) => SingleLetterTag::from_char(c).ok(),
            _ => None,
        };
        match tag {
            Some(tag) => out = out.custom_tags(tag, values.iter().cloned()),
            None => tracing::debug!("Skipping unsupported tag filter {:?}", name),
        }
    }

    if let Some(limit) = filter.limit {
        out = out.limit(limit);
    }
    if let Some(until) = filter.until {
        out = out.until(Timestamp::from(until));
    }
    out
}
