//! Live ingestion with automatic resubscription.
//!
//! [`IngestSource`] keeps one logical subscription open against a
//! [`Transport`]. Events are handed to the caller's handler in arrival order;
//! when the transport closes the subscription the source waits
//! `min(base * multiplier^n + jitter, ceiling)` and subscribes again, where
//! `n` counts consecutive closes since the last call to
//! [`IngestSource::subscribe_timeline`].
//!
//! Each subscription runs in its own task tagged with a generation number.
//! [`IngestSource::stop`] and a fresh subscribe both bump the generation, so a
//! superseded task stops delivering even if it still has messages buffered.

use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use parking_lot::Mutex;
use rand::Rng;
use tokio::task::JoinHandle;

use super::{TimelineFilter, Transport, TransportMessage};
use tessera_core::TimelineEvent;

/// Handler invoked for every live event.
pub type EventHandler = Arc<dyn Fn(TimelineEvent) + Send + Sync>;

/// Handler invoked with the close reason before each reconnect.
pub type CloseHandler = Arc<dyn Fn(&str) + Send + Sync>;

/// Reconnect backoff parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    /// Delay after the first close.
    pub base: Duration,
    /// Growth factor per consecutive close.
    pub multiplier: f64,
    /// Upper bound on any delay, jitter included.
    pub ceiling: Duration,
    /// Jitter is drawn uniformly from `[0, max_jitter]`.
    pub max_jitter: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(600),
            multiplier: 1.7,
            ceiling: Duration::from_secs(30),
            max_jitter: Duration::from_millis(250),
        }
    }
}

impl BackoffConfig {
    /// Deterministic part of the delay after `attempt` prior consecutive closes.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let millis = self.base.as_millis() as f64 * self.multiplier.powi(exponent);
        let ceiling = self.ceiling.as_millis() as f64;
        Duration::from_millis(millis.min(ceiling).round() as u64)
    }

    /// Full delay with the given jitter, clamped to the ceiling.
    pub fn delay(&self, attempt: u32, jitter: Duration) -> Duration {
        (self.base_delay(attempt) + jitter).min(self.ceiling)
    }

    fn random_jitter(&self) -> Duration {
        let max = self.max_jitter.as_millis() as u64;
        if max == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=max))
    }
}

/// Lifecycle of the live subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestStatus {
    /// No subscription requested, or stopped.
    Idle,
    /// Waiting for the transport to accept the subscription.
    Subscribing,
    /// Receiving events.
    Active,
    /// Closed by the transport; a reconnect is scheduled.
    Closed,
}

/// What to subscribe to and where to deliver it.
#[derive(Clone)]
pub struct TimelineRequest {
    /// Relay filter for the live stream.
    pub filter: TimelineFilter,
    /// Called synchronously for every event, in arrival order.
    pub on_event: EventHandler,
    /// Called once per close, before the reconnect delay.
    pub on_close: Option<CloseHandler>,
}

struct IngestState {
    status: IngestStatus,
    generation: u64,
    consecutive_closes: u32,
    last_delay: Option<Duration>,
    task: Option<JoinHandle<()>>,
}

/// Owns a single self-healing live subscription.
pub struct IngestSource<T> {
    transport: Arc<T>,
    backoff: BackoffConfig,
    state: Arc<Mutex<IngestState>>,
}

impl<T: Transport> IngestSource<T> {
    /// Create an idle source over the given transport.
    pub fn new(transport: Arc<T>, backoff: BackoffConfig) -> Self {
        Self {
            transport,
            backoff,
            state: Arc::new(Mutex::new(IngestState {
                status: IngestStatus::Idle,
                generation: 0,
                consecutive_closes: 0,
                last_delay: None,
                task: None,
            })),
        }
    }

    /// Start (or replace) the live subscription.
    ///
    /// Any previous subscription is cancelled and the backoff counter resets.
    /// Must be called from within a Tokio runtime.
    pub fn subscribe_timeline(&self, request: TimelineRequest) {
        let generation = {
            let mut state = self.state.lock();
            if let Some(task) = state.task.take() {
                task.abort();
            }
            state.generation += 1;
            state.consecutive_closes = 0;
            state.last_delay = None;
            state.status = IngestStatus::Subscribing;
            state.generation
        };

        tracing::debug!(generation, kinds = ?request.filter.kinds, "Starting live subscription");

        let task = tokio::spawn(run_subscription(
            Arc::clone(&self.transport),
            self.backoff.clone(),
            Arc::clone(&self.state),
            request,
            generation,
        ));

        let mut state = self.state.lock();
        if state.generation == generation {
            state.task = Some(task);
        } else {
            task.abort();
        }
    }

    /// Stop the live subscription. Idempotent.
    pub fn stop(&self) {
        let mut state = self.state.lock();
        state.generation += 1;
        state.status = IngestStatus::Idle;
        if let Some(task) = state.task.take() {
            task.abort();
            tracing::debug!("Live subscription stopped");
        }
    }

    /// Current lifecycle state.
    pub fn status(&self) -> IngestStatus {
        self.state.lock().status
    }

    /// Delay chosen for the most recent reconnect, if any.
    pub fn last_retry_delay(&self) -> Option<Duration> {
        self.state.lock().last_delay
    }
}

impl<T> Drop for IngestSource<T> {
    fn drop(&mut self) {
        if let Some(task) = self.state.lock().task.take() {
            task.abort();
        }
    }
}

fn is_current(state: &Mutex<IngestState>, generation: u64) -> bool {
    state.lock().generation == generation
}

fn set_status(state: &Mutex<IngestState>, generation: u64, status: IngestStatus) -> bool {
    let mut state = state.lock();
    if state.generation != generation {
        return false;
    }
    state.status = status;
    true
}

async fn run_subscription<T: Transport>(
    transport: Arc<T>,
    backoff: BackoffConfig,
    state: Arc<Mutex<IngestState>>,
    request: TimelineRequest,
    generation: u64,
) {
    loop {
        if !set_status(&state, generation, IngestStatus::Subscribing) {
            return;
        }
        counter!("ingest_subscriptions_total").increment(1);

        let reason = match transport.subscribe(&request.filter).await {
            Ok(mut subscription) => {
                if !set_status(&state, generation, IngestStatus::Active) {
                    return;
                }
                tracing::debug!(id = subscription.id(), "Subscription active");

                loop {
                    match subscription.recv().await {
                        Some(TransportMessage::Event(event)) => {
                            if !is_current(&state, generation) {
                                return;
                            }
                            (request.on_event)(event);
                        }
                        Some(TransportMessage::Closed(reason)) => break reason,
                        None => break "transport channel closed".to_string(),
                    }
                }
            }
            Err(e) => e.to_string(),
        };

        let delay = {
            let mut s = state.lock();
            if s.generation != generation {
                return;
            }
            s.status = IngestStatus::Closed;
            let attempt = s.consecutive_closes;
            s.consecutive_closes = s.consecutive_closes.saturating_add(1);
            let delay = backoff.delay(attempt, backoff.random_jitter());
            s.last_delay = Some(delay);
            delay
        };

        counter!("ingest_closes_total").increment(1);
        tracing::info!(
            reason = %reason,
            delay_ms = delay.as_millis() as u64,
            "Subscription closed, resubscribing"
        );

        if let Some(on_close) = &request.on_close {
            on_close(&reason);
        }

        tokio::time::sleep(delay).await;
    }
}
