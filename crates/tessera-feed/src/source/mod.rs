//! Transport boundary and live ingestion.
//!
//! The relay layer is consumed through the [`Transport`] trait: open a
//! filtered subscription that yields [`TransportMessage`]s, or run a one-shot
//! historical query. [`NostrTransport`] implements it over nostr-sdk;
//! [`IngestSource`] owns one logical subscription on top of any transport and
//! keeps it alive with exponential backoff.
//!
//! Events cross this boundary already converted into the closed
//! [`TimelineEvent`] type; malformed payloads are rejected by the adapter.

mod ingest;
mod relay;

pub use ingest::{
    BackoffConfig, CloseHandler, EventHandler, IngestSource, IngestStatus, TimelineRequest,
};
pub use relay::{NostrTransport, PublishReport, RelayConfig};

use std::collections::BTreeMap;
use std::future::Future;

use tessera_core::TimelineEvent;
use tokio::sync::mpsc;

use crate::Result;

/// A relay filter, independent of any client library.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TimelineFilter {
    /// Event kinds to match.
    pub kinds: Vec<u16>,
    /// Author pubkeys (hex); `None` matches any author.
    pub authors: Option<Vec<String>>,
    /// Single-letter tag filters, e.g. `"t" -> ["rust"]`.
    pub tags: BTreeMap<String, Vec<String>>,
    /// Maximum number of stored events to return.
    pub limit: Option<usize>,
    /// Inclusive upper bound on `created_at`.
    pub until: Option<u64>,
}

/// A message delivered on a live subscription.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportMessage {
    /// A new event matching the subscription.
    Event(TimelineEvent),
    /// The transport closed the subscription.
    Closed(String),
}

/// A live subscription handle.
///
/// Dropping the handle unsubscribes.
pub struct Subscription {
    id: String,
    messages: mpsc::UnboundedReceiver<TransportMessage>,
    on_drop: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    /// Wrap a message channel as a subscription.
    pub fn new(id: impl Into<String>, messages: mpsc::UnboundedReceiver<TransportMessage>) -> Self {
        Self {
            id: id.into(),
            messages,
            on_drop: None,
        }
    }

    /// Run `f` when the subscription is dropped.
    pub fn on_drop(mut self, f: impl FnOnce() + Send + 'static) -> Self {
        self.on_drop = Some(Box::new(f));
        self
    }

    /// Subscription identifier assigned by the transport.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Receive the next message; `None` once the transport side is gone.
    pub async fn recv(&mut self) -> Option<TransportMessage> {
        self.messages.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(f) = self.on_drop.take() {
            f();
        }
    }
}

/// The relay layer as seen by the timeline engine.
pub trait Transport: Send + Sync + 'static {
    /// Open a live subscription.
    fn subscribe(
        &self,
        filter: &TimelineFilter,
    ) -> impl Future<Output = Result<Subscription>> + Send;

    /// Fetch stored events matching the filter.
    fn query(
        &self,
        filter: &TimelineFilter,
    ) -> impl Future<Output = Result<Vec<TimelineEvent>>> + Send;
}
