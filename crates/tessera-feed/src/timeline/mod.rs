//! Timeline consolidation.
//!
//! [`TimelineConsolidator`] turns a live event stream plus paged historical
//! queries into a single bounded, ordered, de-duplicated timeline, and pushes
//! immutable snapshots to a [`TimelineObserver`].
//!
//! ```text
//!  IngestSource ──► policy ──► IdentityIndex ──┬─► merge ──► observer.on_update
//!                                              │       └──► profiles / verifier
//!                                              └─► pending (when paused)
//!
//!  load_older ──► Transport::query(until = oldest - 1) ──► merge
//! ```

mod consolidator;
mod merge;

pub use consolidator::{ConsolidatorBuilder, FeedStats, TimelineConsolidator};
pub use merge::{IdentityIndex, merge_events};

use std::collections::BTreeMap;
use std::sync::Arc;

use tessera_core::TimelineEvent;

use crate::profile::ProfileMap;
use crate::source::TimelineFilter;

/// Immutable timeline snapshot, newest first.
pub type Snapshot = Arc<[TimelineEvent]>;

/// Timeline sizing and content.
#[derive(Debug, Clone, PartialEq)]
pub struct TimelineConfig {
    /// Maximum events held in the timeline.
    pub max_events: usize,
    /// Maximum events held in the pending buffer while paused.
    pub max_buffer: usize,
    /// Events requested per historical page.
    pub page_size: usize,
    /// Kinds included in the feed.
    pub kinds: Vec<u16>,
}

impl Default for TimelineConfig {
    fn default() -> Self {
        Self {
            max_events: 300,
            max_buffer: 400,
            page_size: 50,
            kinds: vec![1, 6, 30023],
        }
    }
}

/// Which part of the network the timeline follows.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionContext {
    /// Restrict to these authors (hex pubkeys).
    pub authors: Option<Vec<String>>,
    /// Single-letter tag filters.
    pub tags: BTreeMap<String, Vec<String>>,
}

impl SubscriptionContext {
    /// Everything matching the configured kinds.
    pub fn global() -> Self {
        Self::default()
    }

    /// Events by the given authors.
    pub fn authors(authors: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            authors: Some(authors.into_iter().map(Into::into).collect()),
            ..Default::default()
        }
    }

    /// Events carrying the given hashtag.
    pub fn hashtag(tag: impl Into<String>) -> Self {
        let mut tags = BTreeMap::new();
        tags.insert("t".to_string(), vec![tag.into().to_lowercase()]);
        Self {
            authors: None,
            tags,
        }
    }

    pub(crate) fn filter(
        &self,
        kinds: &[u16],
        limit: Option<usize>,
        until: Option<u64>,
    ) -> TimelineFilter {
        TimelineFilter {
            kinds: kinds.to_vec(),
            authors: self.authors.clone(),
            tags: self.tags.clone(),
            limit,
            until,
        }
    }
}

/// Receives timeline output.
///
/// Callbacks run on the delivering task, never while internal locks are
/// held, so they may call back into the consolidator.
pub trait TimelineObserver: Send + Sync + 'static {
    /// A new timeline snapshot.
    fn on_update(&self, snapshot: Snapshot);

    /// A new profile map snapshot.
    fn on_profiles(&self, profiles: Arc<ProfileMap>);

    /// The pending buffer size changed.
    fn on_pending_count(&self, _count: usize) {}

    /// Signature verification finished for a delivered event.
    fn on_verified(&self, _id: &str, _verified: bool) {}
}

/// Consumer-supplied moderation predicates.
pub trait AccessPolicy: Send + Sync + 'static {
    /// Events by this author are dropped.
    fn is_blocked(&self, author: &str) -> bool;

    /// This event is dropped.
    fn is_muted(&self, event: &TimelineEvent) -> bool;
}

/// Policy that admits everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl AccessPolicy for AllowAll {
    fn is_blocked(&self, _author: &str) -> bool {
        false
    }

    fn is_muted(&self, _event: &TimelineEvent) -> bool {
        false
    }
}

/// Receives per-event delivery and verification status.
pub trait TransportStatus: Send + Sync + 'static {
    /// The event was delivered to the observer.
    fn mark_seen(&self, id: &str);

    /// Signature verification finished.
    fn mark_verified(&self, id: &str, verified: bool);
}
