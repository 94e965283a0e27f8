//! Background profile hydration.
//!
//! Authors seen in the timeline are queued for a kind 0 lookup. Fetches run
//! at most `max_inflight` at a time with a random pause between starts so a
//! burst of new authors does not flood relays. A resolved profile is only
//! published when it differs from the one already held, and every publish
//! hands the listener a fresh [`ProfileMap`] snapshot.
//!
//! Failures are logged and forgotten. The author can be queued again later.

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use parking_lot::Mutex;
use rand::Rng;
use tessera_core::{PROFILE_KIND, ProfileMetadata};
use tokio::sync::Semaphore;
use tokio::time::Instant;

use crate::Result;
use crate::cache::BoundedCache;
use crate::source::{TimelineFilter, Transport};

/// Author pubkey to resolved profile.
pub type ProfileMap = HashMap<String, ProfileMetadata>;

/// Listener for profile map updates.
pub type ProfilesListener = Arc<dyn Fn(Arc<ProfileMap>) + Send + Sync>;

/// Hydration tuning.
#[derive(Debug, Clone, PartialEq)]
pub struct HydrationConfig {
    /// Maximum concurrent fetches.
    pub max_inflight: usize,
    /// Lower bound of the pause between fetch starts.
    pub min_spacing: Duration,
    /// Upper bound of the pause between fetch starts.
    pub max_spacing: Duration,
}

impl Default for HydrationConfig {
    fn default() -> Self {
        Self {
            max_inflight: 2,
            min_spacing: Duration::from_millis(120),
            max_spacing: Duration::from_millis(400),
        }
    }
}

impl HydrationConfig {
    fn spacing(&self) -> Duration {
        let min = self.min_spacing.as_millis() as u64;
        let max = (self.max_spacing.as_millis() as u64).max(min);
        Duration::from_millis(rand::thread_rng().gen_range(min..=max))
    }
}

/// Fetches the latest profile for an author.
pub trait ProfileFetcher: Send + Sync + 'static {
    /// `Ok(None)` when the author has no usable kind 0 event.
    fn fetch_profile(
        &self,
        pubkey: &str,
    ) -> impl Future<Output = Result<Option<ProfileMetadata>>> + Send;
}

/// [`ProfileFetcher`] that queries a [`Transport`] for kind 0 events.
pub struct TransportProfiles<T> {
    transport: Arc<T>,
}

impl<T> TransportProfiles<T> {
    pub fn new(transport: Arc<T>) -> Self {
        Self { transport }
    }
}

impl<T: Transport> ProfileFetcher for TransportProfiles<T> {
    async fn fetch_profile(&self, pubkey: &str) -> Result<Option<ProfileMetadata>> {
        let filter = TimelineFilter {
            kinds: vec![PROFILE_KIND],
            authors: Some(vec![pubkey.to_string()]),
            limit: Some(1),
            ..Default::default()
        };
        let events = self.transport.query(&filter).await?;

        // Relays may return more than asked for; keep the newest
        let Some(latest) = events
            .into_iter()
            .filter(|e| e.kind == PROFILE_KIND && e.author_key == pubkey)
            .max_by(|a, b| a.cmp_recency(b))
        else {
            return Ok(None);
        };

        Ok(ProfileMetadata::from_json(&latest.content).map(|mut meta| {
            meta.updated_at = latest.created_at;
            meta
        }))
    }
}

/// Rate-limited, deduplicating profile hydration queue.
pub struct ProfileHydrationQueue<F> {
    inner: Arc<QueueInner<F>>,
}

impl<F> Clone for ProfileHydrationQueue<F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct QueueInner<F> {
    fetcher: F,
    config: HydrationConfig,
    cache: Option<BoundedCache<String, ProfileMetadata>>,
    /// Shared by every drain run so the cap covers all outstanding fetches.
    slots: Arc<Semaphore>,
    state: Mutex<QueueState>,
}

#[derive(Default)]
struct QueueState {
    queue: VecDeque<String>,
    queued: HashSet<String>,
    in_flight: HashSet<String>,
    /// Keys that bypass the already-resolved check once.
    refresh: HashSet<String>,
    profiles: Arc<ProfileMap>,
    listener: Option<ProfilesListener>,
    draining: bool,
    last_start: Option<Instant>,
}

impl<F: ProfileFetcher> ProfileHydrationQueue<F> {
    pub fn new(fetcher: F, config: HydrationConfig) -> Self {
        Self::build(fetcher, config, None)
    }

    /// Queue that consults `cache` before fetching and stores what it fetches.
    pub fn with_cache(
        fetcher: F,
        config: HydrationConfig,
        cache: BoundedCache<String, ProfileMetadata>,
    ) -> Self {
        Self::build(fetcher, config, Some(cache))
    }

    fn build(
        fetcher: F,
        config: HydrationConfig,
        cache: Option<BoundedCache<String, ProfileMetadata>>,
    ) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                fetcher,
                slots: Arc::new(Semaphore::new(config.max_inflight.max(1))),
                config,
                cache,
                state: Mutex::new(QueueState::default()),
            }),
        }
    }

    /// Replace the listener notified on profile map changes.
    pub fn set_listener(&self, listener: Option<ProfilesListener>) {
        self.inner.state.lock().listener = listener;
    }

    /// Queue an author for hydration.
    ///
    /// No-op if the author is already resolved, queued or in flight.
    /// Must be called from within a Tokio runtime.
    pub fn enqueue(&self, pubkey: &str) {
        self.push(pubkey, false);
    }

    /// Queue an author even if a profile is already held.
    pub fn refresh(&self, pubkey: &str) {
        self.push(pubkey, true);
    }

    fn push(&self, pubkey: &str, force: bool) {
        let spawn_drain = {
            let mut state = self.inner.state.lock();
            if state.queued.contains(pubkey) || state.in_flight.contains(pubkey) {
                return;
            }
            if !force && state.profiles.contains_key(pubkey) {
                return;
            }
            if force {
                state.refresh.insert(pubkey.to_string());
            }
            state.queued.insert(pubkey.to_string());
            state.queue.push_back(pubkey.to_string());
            !std::mem::replace(&mut state.draining, true)
        };

        if spawn_drain {
            tokio::spawn(drain(Arc::clone(&self.inner)));
        }
    }

    /// Current profile map snapshot.
    pub fn profiles(&self) -> Arc<ProfileMap> {
        Arc::clone(&self.inner.state.lock().profiles)
    }

    /// Whether a profile is held for the author.
    pub fn is_resolved(&self, pubkey: &str) -> bool {
        self.inner.state.lock().profiles.contains_key(pubkey)
    }

    /// Authors waiting for a fetch slot.
    pub fn queued(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    /// Drop queued work and forget in-flight fetches; their results will be
    /// ignored. Resolved profiles are kept.
    pub fn reset(&self) {
        let mut state = self.inner.state.lock();
        state.queue.clear();
        state.queued.clear();
        state.in_flight.clear();
        state.refresh.clear();
    }

    /// [`reset`](Self::reset) and also drop every resolved profile.
    pub fn clear(&self) {
        self.reset();
        self.inner.state.lock().profiles = Arc::new(ProfileMap::new());
    }
}

async fn drain<F: ProfileFetcher>(inner: Arc<QueueInner<F>>) {
    loop {
        let Ok(permit) = Arc::clone(&inner.slots).acquire_owned().await else {
            inner.state.lock().draining = false;
            return;
        };

        let last_start = inner.state.lock().last_start;
        if let Some(last) = last_start {
            tokio::time::sleep_until(last + inner.config.spacing()).await;
        }

        let (next, forced) = {
            let mut state = inner.state.lock();
            loop {
                let Some(pubkey) = state.queue.pop_front() else {
                    state.draining = false;
                    return;
                };
                state.queued.remove(&pubkey);
                let forced = state.refresh.remove(&pubkey);
                if state.in_flight.contains(&pubkey)
                    || (!forced && state.profiles.contains_key(&pubkey))
                {
                    continue;
                }
                state.in_flight.insert(pubkey.clone());
                state.last_start = Some(Instant::now());
                break (pubkey, forced);
            }
        };

        let inner = Arc::clone(&inner);
        tokio::spawn(async move {
            let _permit = permit;
            let result = resolve(&inner, &next, forced).await;
            complete(&inner, next, result);
        });
    }
}

async fn resolve<F: ProfileFetcher>(
    inner: &QueueInner<F>,
    pubkey: &str,
    forced: bool,
) -> Result<Option<ProfileMetadata>> {
    if let Some(cache) = &inner.cache
        && !forced
        && let Some(meta) = cache.get(&pubkey.to_string()).await
    {
        counter!("profile_fetches_total", "outcome" => "cached").increment(1);
        return Ok(Some(meta));
    }

    let fetched = inner.fetcher.fetch_profile(pubkey).await?;
    if let (Some(cache), Some(meta)) = (&inner.cache, &fetched) {
        cache.insert(pubkey.to_string(), meta.clone());
    }
    Ok(fetched)
}

fn complete<F>(inner: &QueueInner<F>, pubkey: String, result: Result<Option<ProfileMetadata>>) {
    let notify = {
        let mut state = inner.state.lock();
        if !state.in_flight.remove(&pubkey) {
            // Reset while the fetch was running
            return;
        }

        match result {
            Ok(Some(meta)) => {
                counter!("profile_fetches_total", "outcome" => "found").increment(1);
                if state.profiles.get(&pubkey) == Some(&meta) {
                    None
                } else {
                    let mut next = ProfileMap::clone(&state.profiles);
                    next.insert(pubkey, meta);
                    state.profiles = Arc::new(next);
                    state
                        .listener
                        .clone()
                        .map(|listener| (listener, Arc::clone(&state.profiles)))
                }
            }
            Ok(None) => {
                counter!("profile_fetches_total", "outcome" => "missing").increment(1);
                tracing::debug!(pubkey = %pubkey, "No profile metadata found");
                None
            }
            Err(e) => {
                counter!("profile_fetches_total", "outcome" => "error").increment(1);
                tracing::debug!(pubkey = %pubkey, error = %e, "Profile fetch failed");
                None
            }
        }
    };

    if let Some((listener, profiles)) = notify {
        listener(profiles);
    }
}
