//! The timeline consolidator.
//!
//! # Delivery
//!
//! A live event passes the access policy, then the identity index. Until
//! the first event after a subscribe has been shown (`hydrated`), or
//! whenever the consumer is not paused, it is merged immediately and a new
//! snapshot is pushed. While paused it waits in the pending buffer; if the
//! buffer outgrows `max_buffer` the oldest arrivals are dropped and live
//! ingestion is stopped until [`TimelineConsolidator::flush_pending`].
//!
//! Every delivered event is handed to profile hydration and to the
//! background verifier. Neither blocks the snapshot.
//!
//! # Locking
//!
//! All mutable feed state sits behind one mutex. Observer callbacks are
//! collected under the lock and invoked after it is released.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use metrics::{counter, gauge};
use parking_lot::Mutex;
use tessera_core::TimelineEvent;

use super::merge::{IdentityIndex, merge_events};
use super::{
    AccessPolicy, AllowAll, Snapshot, SubscriptionContext, TimelineConfig, TimelineObserver,
    TransportStatus,
};
use crate::cache::BoundedCache;
use crate::config::FeedConfig;
use crate::profile::{HydrationConfig, ProfileHydrationQueue, ProfileMap, TransportProfiles};
use crate::source::{
    BackoffConfig, CloseHandler, EventHandler, IngestSource, IngestStatus, TimelineRequest,
    Transport,
};
use crate::verify::{AsyncVerifier, SignatureCheck, VerifierConfig};
use tessera_core::ProfileMetadata;

/// Counters describing what the consolidator has done since creation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeedStats {
    /// Live events received from the source.
    pub received: u64,
    /// Live events rejected as already known or stale.
    pub duplicates: u64,
    /// Events dropped by the access policy.
    pub filtered: u64,
    /// Events placed in the pending buffer.
    pub buffered: u64,
    /// Pending events discarded on overflow.
    pub dropped: u64,
    /// Times live ingestion was stopped because the buffer overflowed.
    pub overflow_stops: u64,
    /// Snapshots pushed to the observer.
    pub deliveries: u64,
    /// Historical pages that added at least one event.
    pub older_pages: u64,
}

#[derive(Clone)]
struct Session {
    context: SubscriptionContext,
    observer: Arc<dyn TimelineObserver>,
}

struct FeedState {
    timeline: Snapshot,
    identities: IdentityIndex,
    pending: VecDeque<TimelineEvent>,
    paused: bool,
    hydrated: bool,
    stopped_for_overflow: bool,
    loading_older: bool,
    /// Bumped by subscribe, stop and reset so in-flight pages can tell they
    /// are stale.
    epoch: u64,
    session: Option<Session>,
    stats: FeedStats,
}

impl FeedState {
    fn new() -> Self {
        Self {
            timeline: Arc::from(Vec::new()),
            identities: IdentityIndex::default(),
            pending: VecDeque::new(),
            paused: false,
            hydrated: false,
            stopped_for_overflow: false,
            loading_older: false,
            epoch: 0,
            session: None,
            stats: FeedStats::default(),
        }
    }
}

/// Result of a merge, delivered after the lock is released.
struct Delivery {
    snapshot: Snapshot,
    /// Merged events that survived the cap.
    added: Vec<TimelineEvent>,
}

/// Builder for [`TimelineConsolidator`].
pub struct ConsolidatorBuilder<T> {
    transport: Arc<T>,
    timeline: TimelineConfig,
    backoff: BackoffConfig,
    verifier: VerifierConfig,
    hydration: HydrationConfig,
    policy: Arc<dyn AccessPolicy>,
    status: Option<Arc<dyn TransportStatus>>,
    profile_cache: Option<BoundedCache<String, ProfileMetadata>>,
    signature_check: Option<SignatureCheck>,
}

impl<T: Transport> ConsolidatorBuilder<T> {
    /// Apply every component setting from a [`FeedConfig`].
    pub fn feed_config(mut self, config: &FeedConfig) -> Self {
        self.timeline = config.timeline.clone();
        self.backoff = config.backoff.clone();
        self.verifier = config.verifier.clone();
        self.hydration = config.hydration.clone();
        self
    }

    pub fn timeline(mut self, config: TimelineConfig) -> Self {
        self.timeline = config;
        self
    }

    pub fn backoff(mut self, config: BackoffConfig) -> Self {
        self.backoff = config;
        self
    }

    pub fn hydration(mut self, config: HydrationConfig) -> Self {
        self.hydration = config;
        self
    }

    /// Moderation predicates; defaults to [`AllowAll`].
    pub fn policy(mut self, policy: Arc<dyn AccessPolicy>) -> Self {
        self.policy = policy;
        self
    }

    /// Per-event delivery and verification status sink.
    pub fn transport_status(mut self, status: Arc<dyn TransportStatus>) -> Self {
        self.status = Some(status);
        self
    }

    /// Cache consulted before fetching profiles.
    pub fn profile_cache(mut self, cache: BoundedCache<String, ProfileMetadata>) -> Self {
        self.profile_cache = Some(cache);
        self
    }

    /// Replace the signature check used by the verifier.
    pub fn signature_check(mut self, check: SignatureCheck) -> Self {
        self.signature_check = Some(check);
        self
    }

    pub fn build(self) -> TimelineConsolidator<T> {
        let verifier = match self.signature_check {
            Some(check) => AsyncVerifier::with_check(self.verifier, check),
            None => AsyncVerifier::new(self.verifier),
        };
        let fetcher = TransportProfiles::new(Arc::clone(&self.transport));
        let profiles = match self.profile_cache {
            Some(cache) => ProfileHydrationQueue::with_cache(fetcher, self.hydration, cache),
            None => ProfileHydrationQueue::new(fetcher, self.hydration),
        };

        TimelineConsolidator {
            inner: Arc::new(Inner {
                source: IngestSource::new(Arc::clone(&self.transport), self.backoff),
                transport: self.transport,
                config: self.timeline,
                verifier,
                profiles,
                policy: self.policy,
                status: self.status,
                state: Mutex::new(FeedState::new()),
            }),
        }
    }
}

/// Bounded, ordered, de-duplicated timeline over a live relay feed.
///
/// Cloning yields another handle to the same timeline.
pub struct TimelineConsolidator<T: Transport> {
    inner: Arc<Inner<T>>,
}

impl<T: Transport> Clone for TimelineConsolidator<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<T: Transport> {
    config: TimelineConfig,
    transport: Arc<T>,
    source: IngestSource<T>,
    verifier: AsyncVerifier,
    profiles: ProfileHydrationQueue<TransportProfiles<T>>,
    policy: Arc<dyn AccessPolicy>,
    status: Option<Arc<dyn TransportStatus>>,
    state: Mutex<FeedState>,
}

impl<T: Transport> TimelineConsolidator<T> {
    /// Start building a consolidator over `transport`.
    pub fn builder(transport: Arc<T>) -> ConsolidatorBuilder<T> {
        ConsolidatorBuilder {
            transport,
            timeline: TimelineConfig::default(),
            backoff: BackoffConfig::default(),
            verifier: VerifierConfig::default(),
            hydration: HydrationConfig::default(),
            policy: Arc::new(AllowAll),
            status: None,
            profile_cache: None,
            signature_check: None,
        }
    }

    /// Consolidator with default settings.
    pub fn new(transport: Arc<T>) -> Self {
        Self::builder(transport).build()
    }

    /// Begin (or restart) live ingestion for `context`.
    ///
    /// The current timeline is kept; its identities seed duplicate detection.
    /// The next accepted event is shown even if the consumer is paused.
    /// Must be called from within a Tokio runtime.
    pub fn subscribe(&self, context: SubscriptionContext, observer: Arc<dyn TimelineObserver>) {
        let inner = &self.inner;
        let had_pending = {
            let mut guard = inner.state.lock();
            let state = &mut *guard;
            state.session = Some(Session {
                context: context.clone(),
                observer: Arc::clone(&observer),
            });
            state.epoch += 1;
            state.hydrated = false;
            state.stopped_for_overflow = false;
            state.identities = IdentityIndex::from_events(state.timeline.iter());
            let had_pending = !state.pending.is_empty();
            state.pending.clear();
            had_pending
        };
        gauge!("timeline_pending").set(0.0);

        inner.profiles.reset();
        let listener = Arc::clone(&observer);
        inner
            .profiles
            .set_listener(Some(Arc::new(move |profiles| listener.on_profiles(profiles))));

        if had_pending {
            observer.on_pending_count(0);
        }

        tracing::info!(
            authors = context.authors.as_ref().map_or(0, Vec::len),
            tags = ?context.tags,
            kinds = ?inner.config.kinds,
            "Subscribing timeline"
        );
        inner.start_source(&context);
    }

    /// Pause or resume immediate delivery of live events.
    pub fn set_paused(&self, paused: bool) {
        let mut state = self.inner.state.lock();
        if state.paused != paused {
            tracing::debug!(paused, pending = state.pending.len(), "Delivery pause toggled");
        }
        state.paused = paused;
    }

    /// Merge every pending event into the timeline.
    ///
    /// Restarts live ingestion if it was stopped by a buffer overflow.
    pub fn flush_pending(&self) {
        let inner = &self.inner;
        let (session, delivery, restart) = {
            let mut guard = inner.state.lock();
            let state = &mut *guard;
            let Some(session) = state.session.clone() else {
                return;
            };
            let pending: Vec<TimelineEvent> = state.pending.drain(..).collect();
            let restart = std::mem::take(&mut state.stopped_for_overflow);
            let delivery = if pending.is_empty() {
                None
            } else {
                Some(inner.apply(state, pending))
            };
            (session, delivery, restart)
        };
        gauge!("timeline_pending").set(0.0);

        if let Some(delivery) = delivery {
            inner.deliver(&session.observer, delivery);
        }
        session.observer.on_pending_count(0);

        if restart {
            tracing::info!("Restarting live feed after pending buffer overflow");
            inner.start_source(&session.context);
        }
    }

    /// Fetch one page of events older than the oldest held event.
    ///
    /// Returns how many events were added to the timeline. Transport errors
    /// are logged and reported as zero; the call can simply be repeated.
    /// Concurrent calls and calls before any event has been shown are no-ops.
    pub async fn load_older(&self) -> usize {
        let inner = &self.inner;
        let (filter, cursor, epoch, observer) = {
            let mut state = inner.state.lock();
            let Some(session) = state.session.clone() else {
                return 0;
            };
            let Some(cursor) = state.timeline.last().map(|e| e.created_at) else {
                return 0;
            };
            if state.loading_older || cursor == 0 {
                return 0;
            }
            state.loading_older = true;
            let filter = session.context.filter(
                &inner.config.kinds,
                Some(inner.config.page_size),
                Some(cursor - 1),
            );
            (filter, cursor, state.epoch, session.observer)
        };
        let _loading = LoadingGuard(&inner.state);

        let events = match inner.transport.query(&filter).await {
            Ok(events) => events,
            Err(e) => {
                tracing::warn!(error = %e, cursor, "Failed to load older events");
                return 0;
            }
        };
        let fetched = events.len();

        let candidates: Vec<TimelineEvent> = events
            .into_iter()
            .filter(|e| e.created_at < cursor)
            .filter(|e| inner.admitted_by_policy(e))
            .collect();

        let delivery = {
            let mut guard = inner.state.lock();
            let state = &mut *guard;
            if state.epoch != epoch {
                tracing::debug!("Discarding older page fetched before resubscribe");
                return 0;
            }
            let admitted: Vec<TimelineEvent> = candidates
                .into_iter()
                .filter(|e| state.identities.admit(e))
                .collect();
            if admitted.is_empty() {
                None
            } else {
                state.stats.older_pages += 1;
                Some(inner.apply(state, admitted))
            }
        };

        let Some(delivery) = delivery else {
            tracing::debug!(fetched, cursor, "Older page added nothing");
            return 0;
        };
        let added = delivery.added.len();
        tracing::debug!(fetched, added, cursor, "Loaded older page");
        inner.deliver(&observer, delivery);
        added
    }

    /// Queue a profile lookup for `author_key`.
    ///
    /// Results reach the subscribed observer through `on_profiles`.
    pub fn ensure_profile(&self, author_key: &str) {
        self.inner.profiles.enqueue(author_key);
    }

    /// Re-fetch a profile even if one is already held.
    pub fn refresh_profile(&self, author_key: &str) {
        self.inner.profiles.refresh(author_key);
    }

    /// Stop live ingestion and forget hydration and pending state.
    ///
    /// The timeline and profile map are kept.
    pub fn stop(&self) {
        let inner = &self.inner;
        inner.source.stop();
        {
            let mut state = inner.state.lock();
            state.session = None;
            state.epoch += 1;
            state.hydrated = false;
            state.stopped_for_overflow = false;
            state.pending.clear();
        }
        gauge!("timeline_pending").set(0.0);
        inner.profiles.reset();
        inner.profiles.set_listener(None);
        tracing::info!("Timeline stopped");
    }

    /// Drop the timeline, pending buffer, known identities and profiles.
    ///
    /// Live ingestion, if running, continues; the next event is shown as the
    /// first of a fresh feed.
    pub fn reset(&self) {
        let inner = &self.inner;
        let observer = {
            let mut state = inner.state.lock();
            state.timeline = Arc::from(Vec::new());
            state.identities = IdentityIndex::default();
            state.pending.clear();
            state.hydrated = false;
            state.stopped_for_overflow = false;
            state.epoch += 1;
            state.session.as_ref().map(|s| Arc::clone(&s.observer))
        };
        gauge!("timeline_length").set(0.0);
        gauge!("timeline_pending").set(0.0);
        inner.profiles.clear();

        if let Some(observer) = observer {
            observer.on_update(self.snapshot());
            observer.on_pending_count(0);
        }
    }

    /// Current timeline snapshot.
    pub fn snapshot(&self) -> Snapshot {
        Arc::clone(&self.inner.state.lock().timeline)
    }

    /// Current profile map snapshot.
    pub fn profiles(&self) -> Arc<ProfileMap> {
        self.inner.profiles.profiles()
    }

    /// Events waiting in the pending buffer.
    pub fn pending_count(&self) -> usize {
        self.inner.state.lock().pending.len()
    }

    /// `created_at` of the oldest held event.
    pub fn oldest_cursor(&self) -> Option<u64> {
        self.inner.state.lock().timeline.last().map(|e| e.created_at)
    }

    pub fn is_paused(&self) -> bool {
        self.inner.state.lock().paused
    }

    /// Whether an event has been shown since the last subscribe.
    pub fn is_hydrated(&self) -> bool {
        self.inner.state.lock().hydrated
    }

    /// Lifecycle of the live subscription.
    pub fn ingest_status(&self) -> IngestStatus {
        self.inner.source.status()
    }

    pub fn stats(&self) -> FeedStats {
        self.inner.state.lock().stats
    }
}

impl<T: Transport> Inner<T> {
    fn start_source(self: &Arc<Self>, context: &SubscriptionContext) {
        let weak = Arc::downgrade(self);
        let on_event: EventHandler = Arc::new(move |event| {
            if let Some(inner) = weak.upgrade() {
                inner.handle_live(event);
            }
        });
        let on_close: CloseHandler = Arc::new(|reason: &str| {
            tracing::debug!(reason, "Live feed interrupted");
        });

        self.source.subscribe_timeline(TimelineRequest {
            filter: context.filter(&self.config.kinds, Some(self.config.page_size), None),
            on_event,
            on_close: Some(on_close),
        });
    }

    fn admitted_by_policy(&self, event: &TimelineEvent) -> bool {
        !(self.policy.is_blocked(&event.author_key) || self.policy.is_muted(event))
    }

    fn handle_live(self: &Arc<Self>, event: TimelineEvent) {
        counter!("timeline_events_received_total").increment(1);
        let allowed = self.admitted_by_policy(&event);

        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.stats.received += 1;

        if !allowed {
            state.stats.filtered += 1;
            counter!("timeline_events_filtered_total").increment(1);
            return;
        }
        let Some(session) = state.session.clone() else {
            return;
        };
        if !state.identities.admit(&event) {
            state.stats.duplicates += 1;
            counter!("timeline_events_duplicate_total").increment(1);
            return;
        }

        if state.hydrated && state.paused {
            state.pending.push_back(event);
            state.stats.buffered += 1;
            counter!("timeline_events_buffered_total").increment(1);
            let stop_source = self.trim_pending(state);
            let count = state.pending.len();
            drop(guard);

            gauge!("timeline_pending").set(count as f64);
            if stop_source {
                tracing::warn!(
                    max_buffer = self.config.max_buffer,
                    "Pending buffer overflowed, pausing live feed until flushed"
                );
                self.source.stop();
            }
            session.observer.on_pending_count(count);
            return;
        }

        state.hydrated = true;
        let delivery = self.apply(state, vec![event]);
        drop(guard);
        self.deliver(&session.observer, delivery);
    }

    /// Drop the oldest pending arrivals beyond `max_buffer`.
    ///
    /// Returns true the first time an overflow occurs since the last flush.
    fn trim_pending(&self, state: &mut FeedState) -> bool {
        let max = self.config.max_buffer;
        if state.pending.len() <= max {
            return false;
        }

        let excess = state.pending.len() - max;
        for dropped in state.pending.drain(..excess) {
            state.identities.forget(&dropped, &state.timeline);
        }
        state.stats.dropped += excess as u64;

        if state.stopped_for_overflow {
            return false;
        }
        state.stopped_for_overflow = true;
        state.stats.overflow_stops += 1;
        counter!("timeline_pending_overflow_total").increment(1);
        true
    }

    fn apply(&self, state: &mut FeedState, incoming: Vec<TimelineEvent>) -> Delivery {
        let merged = merge_events(&state.timeline, incoming.clone(), self.config.max_events);

        let added = {
            let kept: HashSet<&str> = merged.iter().map(|e| e.id.as_str()).collect();
            incoming
                .into_iter()
                .filter(|e| kept.contains(e.id.as_str()))
                .collect()
        };

        state.timeline = Arc::from(merged);
        state.stats.deliveries += 1;
        gauge!("timeline_length").set(state.timeline.len() as f64);

        Delivery {
            snapshot: Arc::clone(&state.timeline),
            added,
        }
    }

    fn deliver(&self, observer: &Arc<dyn TimelineObserver>, delivery: Delivery) {
        counter!("timeline_deliveries_total").increment(1);
        observer.on_update(delivery.snapshot);

        for event in delivery.added {
            self.profiles.enqueue(&event.author_key);
            if let Some(status) = &self.status {
                status.mark_seen(&event.id);
            }

            let status = self.status.clone();
            let observer = Arc::clone(observer);
            self.verifier.verify(event, move |id, verified| {
                if let Some(status) = &status {
                    status.mark_verified(id, verified);
                }
                observer.on_verified(id, verified);
            });
        }
    }
}

/// Clears the in-flight flag of `load_older`, including on cancellation.
struct LoadingGuard<'a>(&'a Mutex<FeedState>);

impl Drop for LoadingGuard<'_> {
    fn drop(&mut self) {
        self.0.lock().loading_older = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{Subscription, TimelineFilter, TransportMessage};
    use std::collections::HashMap;
    use std::time::Duration;
    use tessera_core::PROFILE_KIND;
    use tokio::sync::{Notify, mpsc};

    #[derive(Default)]
    struct MockTransport {
        subscribes: Mutex<Vec<TimelineFilter>>,
        senders: Mutex<Vec<mpsc::UnboundedSender<TransportMessage>>>,
        queries: Mutex<Vec<TimelineFilter>>,
        history: Mutex<VecDeque<crate::Result<Vec<TimelineEvent>>>>,
        profiles: Mutex<HashMap<String, TimelineEvent>>,
        /// When set, history queries wait for a notification before answering.
        gate: Mutex<Option<Arc<Notify>>>,
    }

    impl Transport for MockTransport {
        async fn subscribe(&self, filter: &TimelineFilter) -> crate::Result<Subscription> {
            self.subscribes.lock().push(filter.clone());
            let (tx, rx) = mpsc::unbounded_channel();
            self.senders.lock().push(tx);
            Ok(Subscription::new("live", rx))
        }

        async fn query(&self, filter: &TimelineFilter) -> crate::Result<Vec<TimelineEvent>> {
            if filter.kinds == [PROFILE_KIND] {
                let profiles = self.profiles.lock();
                return Ok(filter
                    .authors
                    .iter()
                    .flatten()
                    .filter_map(|a| profiles.get(a).cloned())
                    .collect());
            }
            self.queries.lock().push(filter.clone());
            let gate = self.gate.lock().clone();
            if let Some(gate) = gate {
                gate.notified().await;
            }
            self.history.lock().pop_front().unwrap_or(Ok(Vec::new()))
        }
    }

    #[derive(Default)]
    struct Recorder {
        updates: Mutex<Vec<Snapshot>>,
        profiles: Mutex<Vec<Arc<ProfileMap>>>,
        pending: Mutex<Vec<usize>>,
        verified: Mutex<Vec<(String, bool)>>,
    }

    impl TimelineObserver for Recorder {
        fn on_update(&self, snapshot: Snapshot) {
            self.updates.lock().push(snapshot);
        }
        fn on_profiles(&self, profiles: Arc<ProfileMap>) {
            self.profiles.lock().push(profiles);
        }
        fn on_pending_count(&self, count: usize) {
            self.pending.lock().push(count);
        }
        fn on_verified(&self, id: &str, verified: bool) {
            self.verified.lock().push((id.to_string(), verified));
        }
    }

    impl Recorder {
        fn update_count(&self) -> usize {
            self.updates.lock().len()
        }
        fn last_pending(&self) -> Option<usize> {
            self.pending.lock().last().copied()
        }
    }

    #[derive(Default)]
    struct StatusLog {
        seen: Mutex<Vec<String>>,
        verified: Mutex<Vec<(String, bool)>>,
    }

    impl TransportStatus for StatusLog {
        fn mark_seen(&self, id: &str) {
            self.seen.lock().push(id.to_string());
        }
        fn mark_verified(&self, id: &str, verified: bool) {
            self.verified.lock().push((id.to_string(), verified));
        }
    }

    #[derive(Default)]
    struct BlockList(Mutex<HashSet<String>>);

    impl AccessPolicy for BlockList {
        fn is_blocked(&self, author: &str) -> bool {
            self.0.lock().contains(author)
        }
        fn is_muted(&self, event: &TimelineEvent) -> bool {
            event.content.contains("spam")
        }
    }

    fn note(n: u64, created_at: u64) -> TimelineEvent {
        TimelineEvent {
            id: format!("{n:064x}"),
            author_key: format!("{:064x}", n % 3 + 1),
            created_at,
            kind: 1,
            tags: vec![],
            content: String::new(),
            signature: "0".repeat(128),
        }
    }

    fn article(n: u64, created_at: u64, d: &str) -> TimelineEvent {
        TimelineEvent {
            kind: 30023,
            author_key: "a".repeat(64),
            tags: vec![vec!["d".to_string(), d.to_string()]],
            ..note(n, created_at)
        }
    }

    fn builder(transport: &Arc<MockTransport>) -> ConsolidatorBuilder<MockTransport> {
        TimelineConsolidator::builder(Arc::clone(transport))
            .signature_check(Arc::new(|_: &TimelineEvent| true))
    }

    fn start(consolidator: &TimelineConsolidator<MockTransport>) -> Arc<Recorder> {
        let recorder = Arc::new(Recorder::default());
        consolidator.subscribe(SubscriptionContext::global(), recorder.clone());
        recorder
    }

    fn live(consolidator: &TimelineConsolidator<MockTransport>, event: TimelineEvent) {
        consolidator.inner.handle_live(event);
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    /// Hold history queries until the returned gate is notified.
    fn hold_history(transport: &MockTransport) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *transport.gate.lock() = Some(Arc::clone(&gate));
        gate
    }

    async fn wait_for_queries(transport: &MockTransport, count: usize) {
        for _ in 0..100 {
            if transport.queries.lock().len() >= count {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("history query never issued");
    }

    #[tokio::test]
    async fn test_first_event_shown_while_paused() {
        let transport = Arc::new(MockTransport::default());
        let feed = builder(&transport).build();
        let recorder = start(&feed);
        feed.set_paused(true);

        live(&feed, note(1, 10));
        assert_eq!(recorder.update_count(), 1);
        assert_eq!(feed.snapshot().len(), 1);
        assert!(feed.is_hydrated());

        live(&feed, note(2, 20));
        assert_eq!(recorder.update_count(), 1);
        assert_eq!(feed.pending_count(), 1);
        assert_eq!(recorder.last_pending(), Some(1));
    }

    #[tokio::test]
    async fn test_addressable_keeps_newest_version() {
        let transport = Arc::new(MockTransport::default());
        let feed = builder(&transport).build();
        start(&feed);

        live(&feed, article(1, 100, "post"));
        live(&feed, article(2, 150, "post"));
        live(&feed, article(3, 120, "post"));

        let snapshot = feed.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].created_at, 150);
        assert_eq!(feed.stats().duplicates, 1);
    }

    #[tokio::test]
    async fn test_timeline_capped_to_most_recent() {
        let transport = Arc::new(MockTransport::default());
        let feed = builder(&transport).build();
        start(&feed);

        // Deterministic shuffle of 350 distinct timestamps
        for i in 0..350u64 {
            let n = (i * 7919) % 350;
            live(&feed, note(n, 1_000 + n));
        }

        let snapshot = feed.snapshot();
        assert_eq!(snapshot.len(), 300);
        assert_eq!(snapshot[0].created_at, 1_349);
        assert_eq!(feed.oldest_cursor(), Some(1_050));
        assert!(snapshot.windows(2).all(|w| w[0].cmp_recency(&w[1]).is_gt()));
    }

    #[tokio::test]
    async fn test_pending_overflow_stops_source_once() {
        let transport = Arc::new(MockTransport::default());
        let feed = builder(&transport).build();
        let recorder = start(&feed);
        settle().await;
        assert_eq!(feed.ingest_status(), IngestStatus::Active);

        live(&feed, note(0, 1));
        feed.set_paused(true);
        for n in 1..=450 {
            live(&feed, note(n, 1 + n));
        }

        assert_eq!(feed.pending_count(), 400);
        assert_eq!(recorder.last_pending(), Some(400));
        let stats = feed.stats();
        assert_eq!(stats.overflow_stops, 1);
        assert_eq!(stats.dropped, 50);
        assert_eq!(feed.ingest_status(), IngestStatus::Idle);
        assert_eq!(
            feed.inner.state.lock().pending.front().map(|e| e.created_at),
            Some(52)
        );

        feed.flush_pending();
        assert_eq!(feed.pending_count(), 0);
        assert_eq!(recorder.last_pending(), Some(0));
        assert_eq!(feed.snapshot().len(), 300);
        assert_eq!(feed.snapshot()[0].created_at, 451);

        settle().await;
        assert_eq!(transport.subscribes.lock().len(), 2);
        assert_eq!(feed.ingest_status(), IngestStatus::Active);
    }

    #[tokio::test]
    async fn test_dropped_pending_events_can_return() {
        let transport = Arc::new(MockTransport::default());
        let feed = builder(&transport)
            .timeline(TimelineConfig {
                max_buffer: 2,
                ..Default::default()
            })
            .build();
        start(&feed);

        live(&feed, note(0, 1));
        feed.set_paused(true);
        live(&feed, note(1, 2));
        live(&feed, note(2, 3));
        live(&feed, note(3, 4));
        assert_eq!(feed.pending_count(), 2);

        // note(1) was dropped, so a re-delivery after restart is accepted
        feed.flush_pending();
        feed.set_paused(false);
        live(&feed, note(1, 2));
        assert_eq!(feed.snapshot().len(), 4);
    }

    #[tokio::test]
    async fn test_flush_without_overflow_keeps_subscription() {
        let transport = Arc::new(MockTransport::default());
        let feed = builder(&transport).build();
        let recorder = start(&feed);
        settle().await;

        live(&feed, note(1, 10));
        feed.set_paused(true);
        live(&feed, note(2, 20));
        live(&feed, note(2, 20));
        assert_eq!(feed.pending_count(), 1);

        feed.flush_pending();
        assert_eq!(feed.snapshot().len(), 2);
        assert_eq!(recorder.update_count(), 2);
        settle().await;
        assert_eq!(transport.subscribes.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_policy_rejections_are_not_remembered() {
        let transport = Arc::new(MockTransport::default());
        let policy = Arc::new(BlockList::default());
        let feed = builder(&transport).policy(policy.clone()).build();
        let recorder = start(&feed);

        let event = note(1, 10);
        policy.0.lock().insert(event.author_key.clone());
        live(&feed, event.clone());
        let mut spam = note(4, 11);
        spam.content = "buy spam now".to_string();
        live(&feed, spam);
        assert_eq!(recorder.update_count(), 0);
        assert_eq!(feed.stats().filtered, 2);

        policy.0.lock().clear();
        live(&feed, event);
        assert_eq!(feed.snapshot().len(), 1);
    }

    #[tokio::test]
    async fn test_load_older_merges_strictly_older_page() {
        let transport = Arc::new(MockTransport::default());
        let feed = builder(&transport).build();
        let recorder = start(&feed);
        live(&feed, note(1, 1_000));

        transport
            .history
            .lock()
            .push_back(Ok(vec![note(2, 900), note(1, 1_000), note(3, 1_200)]));

        assert_eq!(feed.load_older().await, 1);
        let filter = transport.queries.lock()[0].clone();
        assert_eq!(filter.until, Some(999));
        assert_eq!(filter.limit, Some(50));
        assert_eq!(filter.kinds, vec![1, 6, 30023]);

        assert_eq!(feed.snapshot().len(), 2);
        assert_eq!(feed.oldest_cursor(), Some(900));
        assert_eq!(recorder.update_count(), 2);
    }

    #[tokio::test]
    async fn test_load_older_skips_blocked_authors() {
        let transport = Arc::new(MockTransport::default());
        let policy = Arc::new(BlockList::default());
        let feed = builder(&transport).policy(policy.clone()).build();
        start(&feed);
        live(&feed, note(1, 1_000));

        let blocked = note(2, 900);
        policy.0.lock().insert(blocked.author_key.clone());
        let mut muted = note(5, 850);
        muted.content = "spam".to_string();
        transport
            .history
            .lock()
            .push_back(Ok(vec![blocked.clone(), muted, note(4, 800)]));

        assert_eq!(feed.load_older().await, 1);
        let ids: Vec<String> = feed.snapshot().iter().map(|e| e.id.clone()).collect();
        assert_eq!(ids, vec![note(1, 1_000).id, note(4, 800).id]);

        // Rejected events never enter the identity index
        assert!(!feed.inner.state.lock().identities.contains(&blocked.identity()));
    }

    #[tokio::test]
    async fn test_load_older_is_noop_while_in_flight() {
        let transport = Arc::new(MockTransport::default());
        let feed = builder(&transport).build();
        start(&feed);
        live(&feed, note(1, 1_000));
        transport.history.lock().push_back(Ok(vec![note(2, 900)]));
        let gate = hold_history(&transport);

        let first = tokio::spawn({
            let feed = feed.clone();
            async move { feed.load_older().await }
        });
        wait_for_queries(&transport, 1).await;

        assert_eq!(feed.load_older().await, 0);
        assert_eq!(transport.queries.lock().len(), 1);

        gate.notify_one();
        assert_eq!(first.await.unwrap(), 1);
        assert_eq!(feed.snapshot().len(), 2);

        // The in-flight flag is cleared once the page lands
        *transport.gate.lock() = None;
        transport.history.lock().push_back(Ok(vec![note(3, 800)]));
        assert_eq!(feed.load_older().await, 1);
    }

    #[tokio::test]
    async fn test_older_page_discarded_after_resubscribe() {
        let transport = Arc::new(MockTransport::default());
        let feed = builder(&transport).build();
        start(&feed);
        live(&feed, note(1, 1_000));
        transport.history.lock().push_back(Ok(vec![note(2, 900)]));
        let gate = hold_history(&transport);

        let pending_page = tokio::spawn({
            let feed = feed.clone();
            async move { feed.load_older().await }
        });
        wait_for_queries(&transport, 1).await;

        let recorder = start(&feed);
        gate.notify_one();
        assert_eq!(pending_page.await.unwrap(), 0);
        assert_eq!(feed.snapshot().len(), 1);
        assert_eq!(recorder.update_count(), 0);

        // Same for a page that lands after stop
        transport.history.lock().push_back(Ok(vec![note(2, 900)]));
        let pending_page = tokio::spawn({
            let feed = feed.clone();
            async move { feed.load_older().await }
        });
        wait_for_queries(&transport, 2).await;
        feed.stop();
        gate.notify_one();
        assert_eq!(pending_page.await.unwrap(), 0);
        assert_eq!(feed.snapshot().len(), 1);
    }

    #[tokio::test]
    async fn test_load_older_needs_a_cursor() {
        let transport = Arc::new(MockTransport::default());
        let feed = builder(&transport).build();
        start(&feed);

        assert_eq!(feed.load_older().await, 0);
        assert!(transport.queries.lock().is_empty());
    }

    #[tokio::test]
    async fn test_load_older_failure_can_be_retried() {
        let transport = Arc::new(MockTransport::default());
        let feed = builder(&transport).build();
        start(&feed);
        live(&feed, note(1, 1_000));

        {
            let mut history = transport.history.lock();
            history.push_back(Err(crate::Error::Transport("timeout".to_string())));
            history.push_back(Ok(vec![note(2, 500)]));
        }

        assert_eq!(feed.load_older().await, 0);
        assert_eq!(feed.snapshot().len(), 1);
        assert_eq!(feed.load_older().await, 1);
        assert_eq!(feed.snapshot().len(), 2);
    }

    #[tokio::test]
    async fn test_snapshots_are_immutable() {
        let transport = Arc::new(MockTransport::default());
        let feed = builder(&transport).build();
        let recorder = start(&feed);

        live(&feed, note(1, 10));
        live(&feed, note(2, 20));

        let updates = recorder.updates.lock();
        assert_eq!(updates[0].len(), 1);
        assert_eq!(updates[1].len(), 2);
        assert!(!Arc::ptr_eq(&updates[0], &updates[1]));
    }

    #[tokio::test]
    async fn test_delivery_triggers_profiles_and_verification() {
        let transport = Arc::new(MockTransport::default());
        let event = note(1, 10);
        transport.profiles.lock().insert(
            event.author_key.clone(),
            TimelineEvent {
                id: "e".repeat(64),
                kind: PROFILE_KIND,
                content: r#"{"name":"alice"}"#.to_string(),
                ..event.clone()
            },
        );
        let status = Arc::new(StatusLog::default());
        let feed = builder(&transport).transport_status(status.clone()).build();
        let recorder = start(&feed);

        live(&feed, event.clone());
        assert_eq!(*status.seen.lock(), vec![event.id.clone()]);

        for _ in 0..50 {
            if !recorder.profiles.lock().is_empty() && !recorder.verified.lock().is_empty() {
                break;
            }
            settle().await;
        }

        let profiles = recorder.profiles.lock().last().cloned().unwrap();
        let profile = &profiles[&event.author_key];
        assert_eq!(profile.name.as_deref(), Some("alice"));
        assert_eq!(profile.updated_at, 10);
        assert_eq!(*recorder.verified.lock(), vec![(event.id.clone(), true)]);
        assert_eq!(*status.verified.lock(), vec![(event.id, true)]);
        assert_eq!(feed.profiles().len(), 1);
    }

    #[tokio::test]
    async fn test_resubscribe_keeps_timeline_and_rehydrates() {
        let transport = Arc::new(MockTransport::default());
        let feed = builder(&transport).build();
        start(&feed);
        live(&feed, note(1, 10));
        feed.set_paused(true);
        live(&feed, note(2, 20));
        assert_eq!(feed.pending_count(), 1);

        let recorder = start(&feed);
        assert_eq!(feed.pending_count(), 0);
        assert!(!feed.is_hydrated());

        // Already in the timeline
        live(&feed, note(1, 10));
        assert_eq!(recorder.update_count(), 0);
        // Shown despite the pause
        live(&feed, note(2, 20));
        assert_eq!(recorder.update_count(), 1);
        assert_eq!(feed.snapshot().len(), 2);
    }

    #[tokio::test]
    async fn test_live_events_flow_from_transport() {
        let transport = Arc::new(MockTransport::default());
        let feed = builder(&transport).build();
        let recorder = start(&feed);
        settle().await;

        let filter = transport.subscribes.lock()[0].clone();
        assert_eq!(filter.limit, Some(50));
        let tx = transport.senders.lock()[0].clone();
        tx.send(TransportMessage::Event(note(1, 10))).unwrap();
        tx.send(TransportMessage::Event(note(2, 20))).unwrap();
        settle().await;

        assert_eq!(recorder.update_count(), 2);
        assert_eq!(feed.snapshot()[0].created_at, 20);

        feed.stop();
        assert_eq!(feed.ingest_status(), IngestStatus::Idle);
        assert_eq!(feed.snapshot().len(), 2);
    }

    #[tokio::test]
    async fn test_reset_clears_everything() {
        let transport = Arc::new(MockTransport::default());
        let feed = builder(&transport).build();
        let recorder = start(&feed);
        live(&feed, note(1, 10));

        feed.reset();
        assert!(feed.snapshot().is_empty());
        assert_eq!(feed.oldest_cursor(), None);
        assert!(recorder.updates.lock().last().unwrap().is_empty());

        // Known identities were forgotten too
        live(&feed, note(1, 10));
        assert_eq!(feed.snapshot().len(), 1);
    }
}
