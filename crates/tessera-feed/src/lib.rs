//! Tessera live timeline engine.
//!
//! This crate turns a stream of Nostr events from relays into a bounded,
//! ordered, de-duplicated timeline that a UI can render without blocking on
//! the network.
//!
//! # Modules
//!
//! - [`timeline`] - Merge rules and the [`TimelineConsolidator`]
//! - [`source`] - Transport boundary, nostr-sdk adapter, self-healing ingest
//! - [`verify`] - Coalescing, time-sliced signature verification
//! - [`profile`] - Rate-limited kind 0 profile hydration
//! - [`cache`] - Bounded TTL cache with an optional SQLite backing store
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │  NostrTransport │  nostr-sdk Client, live REQ + historical fetch
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │  IngestSource   │  resubscribes with exponential backoff
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐     ┌──────────────────────┐
//! │  Consolidator   │────►│ AsyncVerifier        │
//! │  dedupe / merge │     │ ProfileHydrationQueue│──► BoundedCache ──► SQLite
//! └────────┬────────┘     └──────────────────────┘
//!          │
//!          ▼
//!   TimelineObserver (snapshots, profiles, pending count)
//! ```

pub mod cache;
pub mod config;
pub mod error;
pub mod profile;
pub mod source;
pub mod timeline;
pub mod verify;

// Re-export commonly used types at crate root
pub use error::{Error, Result};

pub use cache::{BoundedCache, CacheConfig, CacheStore, EvictionPolicy, SqliteCacheStore};
pub use config::FeedConfig;
pub use profile::{HydrationConfig, ProfileFetcher, ProfileHydrationQueue, ProfileMap};
pub use source::{
    BackoffConfig, IngestSource, IngestStatus, NostrTransport, PublishReport, RelayConfig,
    TimelineFilter, Transport, TransportMessage,
};
pub use timeline::{
    AccessPolicy, AllowAll, FeedStats, Snapshot, SubscriptionContext, TimelineConfig,
    TimelineConsolidator, TimelineObserver, TransportStatus,
};
pub use verify::{AsyncVerifier, VerifierConfig};
