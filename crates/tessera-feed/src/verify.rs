//! Off-path signature verification.
//!
//! Verification never blocks delivery: events are queued and checked by a
//! background drain task that processes at most `max_per_tick` items or
//! `tick_budget` of wall time per slice, then yields to the runtime.
//! Concurrent requests for the same event id share one check, and settled
//! results are remembered in a FIFO memo so re-deliveries are answered
//! without re-hashing.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::counter;
use parking_lot::Mutex;
use tessera_core::TimelineEvent;

use crate::cache::{BoundedCache, CacheConfig, EvictionPolicy};

/// Signature check used by the verifier.
pub type SignatureCheck = Arc<dyn Fn(&TimelineEvent) -> bool + Send + Sync>;

type VerifyCallback = Box<dyn FnOnce(&str, bool) + Send>;

/// Verifier tuning.
#[derive(Debug, Clone, PartialEq)]
pub struct VerifierConfig {
    /// Maximum checks per slice.
    pub max_per_tick: usize,
    /// Wall-time budget per slice.
    pub tick_budget: Duration,
    /// Settled results remembered per event id.
    pub memo_entries: usize,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            max_per_tick: 12,
            tick_budget: Duration::from_millis(8),
            memo_entries: 5000,
        }
    }
}

/// Coalescing, time-sliced signature verifier.
#[derive(Clone)]
pub struct AsyncVerifier {
    inner: Arc<VerifierInner>,
}

struct VerifierInner {
    config: VerifierConfig,
    check: SignatureCheck,
    memo: BoundedCache<String, bool>,
    state: Mutex<VerifierState>,
}

#[derive(Default)]
struct VerifierState {
    queue: VecDeque<TimelineEvent>,
    waiters: HashMap<String, Vec<VerifyCallback>>,
    draining: bool,
}

impl AsyncVerifier {
    /// Verifier using [`tessera_core::verify_signature`].
    pub fn new(config: VerifierConfig) -> Self {
        Self::with_check(config, Arc::new(tessera_core::verify_signature))
    }

    /// Verifier with a custom check.
    pub fn with_check(config: VerifierConfig, check: SignatureCheck) -> Self {
        let memo = BoundedCache::new(CacheConfig {
            name: "verify".to_string(),
            max_entries: config.memo_entries,
            policy: EvictionPolicy::Fifo,
            ..Default::default()
        });
        Self {
            inner: Arc::new(VerifierInner {
                config,
                check,
                memo,
                state: Mutex::new(VerifierState::default()),
            }),
        }
    }

    /// Schedule verification of `event`; `on_result` receives the event id
    /// and outcome exactly once.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn verify(
        &self,
        event: TimelineEvent,
        on_result: impl FnOnce(&str, bool) + Send + 'static,
    ) {
        if let Some(verified) = self.inner.memo.get_memory(&event.id) {
            on_result(&event.id, verified);
            return;
        }

        let spawn_drain = {
            let mut state = self.inner.state.lock();
            match state.waiters.entry(event.id.clone()) {
                Entry::Occupied(mut waiting) => {
                    waiting.get_mut().push(Box::new(on_result));
                    counter!("verifier_coalesced_total").increment(1);
                    false
                }
                Entry::Vacant(slot) => {
                    slot.insert(vec![Box::new(on_result)]);
                    state.queue.push_back(event);
                    !std::mem::replace(&mut state.draining, true)
                }
            }
        };

        if spawn_drain {
            tokio::spawn(drain(Arc::clone(&self.inner)));
        }
    }

    /// Number of queued, unchecked events.
    pub fn pending(&self) -> usize {
        self.inner.state.lock().queue.len()
    }
}

async fn drain(inner: Arc<VerifierInner>) {
    loop {
        let started = Instant::now();
        let mut processed = 0usize;

        loop {
            let event = {
                let mut state = inner.state.lock();
                match state.queue.pop_front() {
                    Some(event) => event,
                    None => {
                        state.draining = false;
                        return;
                    }
                }
            };

            // A panicking check counts as a failed verification
            let verified =
                catch_unwind(AssertUnwindSafe(|| (inner.check)(&event))).unwrap_or(false);
            let result = if verified { "valid" } else { "invalid" };
            counter!("verifier_checks_total", "result" => result).increment(1);
            if !verified {
                tracing::debug!(id = %event.id, "Signature verification failed");
            }

            inner.memo.insert(event.id.clone(), verified);
            let callbacks = inner
                .state
                .lock()
                .waiters
                .remove(&event.id)
                .unwrap_or_default();
            let id = event.id.as_str();
            for callback in callbacks {
                // The drain outlives a panicking subscriber
                if catch_unwind(AssertUnwindSafe(move || callback(id, verified))).is_err() {
                    tracing::warn!(id, "Verification callback panicked");
                }
            }

            processed += 1;
            if processed >= inner.config.max_per_tick
                || started.elapsed() >= inner.config.tick_budget
            {
                break;
            }
        }

        tokio::task::yield_now().await;
    }
}
