//! Live timeline runner.
//!
//! Connects to relays, follows a global, author or hashtag feed and logs
//! every snapshot. Profiles are cached in SQLite so later runs start warm.
//!
//! # Usage
//!
//! ```bash
//! # Global feed, two pages of history
//! tessera-feed --pages 2
//!
//! # Hashtag feed, holding live events back and flushing every 30s
//! tessera-feed --hashtag nostr --flush-interval 30
//!
//! # Specific authors through custom relays
//! tessera-feed --authors <hex>,<hex> --relays wss://nos.lol,wss://relay.damus.io
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use parking_lot::Mutex;
use tessera_core::TimelineEvent;
use tessera_core::metrics::{init_metrics, start_metrics_server};
use tessera_feed::{
    BoundedCache, FeedConfig, NostrTransport, ProfileMap, Snapshot, SqliteCacheStore,
    SubscriptionContext, TimelineConsolidator, TimelineObserver,
};
use tracing_subscriber::EnvFilter;

/// How often expired profile cache rows are swept.
const PURGE_INTERVAL: Duration = Duration::from_secs(600);

#[derive(Parser, Debug)]
#[command(name = "tessera-feed")]
#[command(about = "Follow a live Nostr timeline")]
#[command(version)]
struct Args {
    /// Relay URLs (comma-separated); overrides TESSERA_RELAYS
    #[arg(long, value_delimiter = ',')]
    relays: Option<Vec<String>>,

    /// Only follow these authors (hex pubkeys, comma-separated)
    #[arg(long, value_delimiter = ',', conflicts_with = "hashtag")]
    authors: Option<Vec<String>>,

    /// Only follow this hashtag
    #[arg(long)]
    hashtag: Option<String>,

    /// SQLite file for the profile cache
    #[arg(long, default_value = "./data/tessera-cache.db")]
    cache_path: PathBuf,

    /// Older pages to load once the first event is shown
    #[arg(long, default_value = "1")]
    pages: usize,

    /// Hold live events back and flush them every N seconds (0 = deliver immediately)
    #[arg(long, default_value = "0")]
    flush_interval: u64,

    /// Publish a signed event read from this JSON file before following
    #[arg(long)]
    publish: Option<PathBuf>,

    /// Metrics port (0 to disable)
    #[arg(long, default_value = "9091")]
    metrics_port: u16,
}

/// Logs snapshots with the best known author name.
#[derive(Default)]
struct LogObserver {
    profiles: Mutex<Arc<ProfileMap>>,
}

impl TimelineObserver for LogObserver {
    fn on_update(&self, snapshot: Snapshot) {
        let Some(newest) = snapshot.first() else {
            tracing::info!("Timeline is empty");
            return;
        };
        let author = self
            .profiles
            .lock()
            .get(&newest.author_key)
            .and_then(|p| p.label().map(str::to_string))
            .unwrap_or_else(|| newest.author_key.chars().take(12).collect());

        tracing::info!(
            len = snapshot.len(),
            kind = newest.kind,
            author = %author,
            "{}",
            preview(&newest.content)
        );
    }

    fn on_profiles(&self, profiles: Arc<ProfileMap>) {
        tracing::debug!(count = profiles.len(), "Profiles updated");
        *self.profiles.lock() = profiles;
    }

    fn on_pending_count(&self, count: usize) {
        if count > 0 && count % 25 == 0 {
            tracing::info!(pending = count, "Live events waiting");
        }
    }

    fn on_verified(&self, id: &str, verified: bool) {
        if !verified {
            tracing::warn!(id, "Event failed signature verification");
        }
    }
}

fn preview(content: &str) -> String {
    content
        .chars()
        .take(80)
        .map(|c| if c.is_control() { ' ' } else { c })
        .collect()
}

#[tokio::main]
async fn main() -> Result<()> {
    // nostr-sdk's websocket stack needs a process-wide crypto provider
    let _ = rustls::crypto::ring::default_provider().install_default();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("info".parse()?)
                .add_directive("tessera_feed=debug".parse()?),
        )
        .init();

    let args = Args::parse();

    tracing::info!("Tessera feed starting...");

    let mut config = FeedConfig::from_env().context("Invalid TESSERA_* configuration")?;
    if let Some(relays) = args.relays.clone() {
        config.relay.relays = relays;
    }

    if args.metrics_port > 0 {
        match init_metrics() {
            Some(handle) => start_metrics_server(args.metrics_port, handle)
                .await
                .context("Failed to start metrics server")?,
            None => tracing::warn!("Metrics recorder already installed"),
        }
    }

    // Set up graceful shutdown
    let running = Arc::new(AtomicBool::new(true));
    let running_clone = Arc::clone(&running);
    ctrlc::set_handler(move || {
        tracing::info!("Shutdown signal received, stopping gracefully...");
        running_clone.store(false, Ordering::SeqCst);
    })
    .context("Failed to set Ctrl+C handler")?;

    let store = SqliteCacheStore::open(&args.cache_path)
        .with_context(|| format!("Failed to open cache at {}", args.cache_path.display()))?;
    let profile_cache = BoundedCache::with_store(config.profile_cache.clone(), Arc::new(store));

    let transport = Arc::new(
        NostrTransport::connect(config.relay.clone())
            .await
            .context("Failed to connect to relays")?,
    );

    if let Some(path) = &args.publish {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let event = TimelineEvent::from_json(&json).context("Invalid event JSON")?;
        let report = transport.publish(&event).await.context("Publish failed")?;
        for (relay, reason) in &report.rejected {
            tracing::warn!("Relay {} rejected event: {}", relay, reason);
        }
    }

    let context = match (&args.authors, &args.hashtag) {
        (Some(authors), _) => SubscriptionContext::authors(authors.clone()),
        (None, Some(tag)) => SubscriptionContext::hashtag(tag.clone()),
        (None, None) => SubscriptionContext::global(),
    };

    tracing::info!("Configuration:");
    tracing::info!("  Relays: {}", config.relay.relays.len());
    tracing::info!("  Kinds: {:?}", config.timeline.kinds);
    tracing::info!("  Cache: {}", args.cache_path.display());
    tracing::info!("  Older pages: {}", args.pages);

    let feed = TimelineConsolidator::builder(Arc::clone(&transport))
        .feed_config(&config)
        .profile_cache(profile_cache.clone())
        .build();
    feed.subscribe(context, Arc::new(LogObserver::default()));

    let flush_every = (args.flush_interval > 0).then(|| Duration::from_secs(args.flush_interval));
    let mut pages_left = args.pages;
    let mut last_flush = Instant::now();
    let mut last_purge = Instant::now();
    let mut ticker = tokio::time::interval(Duration::from_secs(1));

    while running.load(Ordering::SeqCst) {
        ticker.tick().await;

        if pages_left > 0 && feed.oldest_cursor().is_some() {
            let added = feed.load_older().await;
            tracing::info!(added, "Loaded older page");
            pages_left -= 1;
        }

        if let Some(every) = flush_every {
            if !feed.is_paused() && feed.is_hydrated() {
                feed.set_paused(true);
                last_flush = Instant::now();
            }
            if feed.is_paused() && last_flush.elapsed() >= every {
                tracing::info!(pending = feed.pending_count(), "Flushing held events");
                feed.flush_pending();
                last_flush = Instant::now();
            }
        }

        if last_purge.elapsed() >= PURGE_INTERVAL {
            let purged = profile_cache.purge_expired().await;
            tracing::debug!(purged, "Swept expired profiles");
            last_purge = Instant::now();
        }
    }

    feed.stop();
    profile_cache.flush().await;
    transport.disconnect().await;

    let stats = feed.stats();
    tracing::info!("Session complete:");
    tracing::info!("  Events received: {}", stats.received);
    tracing::info!("  Duplicates: {}", stats.duplicates);
    tracing::info!("  Filtered: {}", stats.filtered);
    tracing::info!("  Snapshots delivered: {}", stats.deliveries);
    tracing::info!("  Overflow stops: {}", stats.overflow_stops);

    Ok(())
}
