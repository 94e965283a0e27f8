//! Pure timeline merge and admission bookkeeping.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};

use tessera_core::{EventIdentity, TimelineEvent};

/// Merge `incoming` into `existing`, keeping one event per identity.
///
/// For addressable identities the newer version wins (ties broken by the
/// greater id). The result is ordered newest first by `(created_at, id)`
/// and truncated to `max_events`.
pub fn merge_events(
    existing: &[TimelineEvent],
    incoming: Vec<TimelineEvent>,
    max_events: usize,
) -> Vec<TimelineEvent> {
    let mut best: HashMap<EventIdentity, TimelineEvent> =
        HashMap::with_capacity(existing.len() + incoming.len());

    for event in existing.iter().cloned().chain(incoming) {
        match best.entry(event.identity()) {
            Entry::Vacant(slot) => {
                slot.insert(event);
            }
            Entry::Occupied(mut slot) => {
                if event.supersedes(slot.get()) {
                    slot.insert(event);
                }
            }
        }
    }

    let mut merged: Vec<TimelineEvent> = best.into_values().collect();
    merged.sort_by(|a, b| b.cmp_recency(a));
    merged.truncate(max_events);
    merged
}

/// Identities admitted into the timeline or currently pending.
///
/// Immutable events are admitted once. Addressable events are admitted
/// whenever they are strictly newer than the best version seen so far.
#[derive(Debug, Default)]
pub struct IdentityIndex {
    known: HashSet<EventIdentity>,
    versions: HashMap<EventIdentity, (u64, String)>,
}

impl IdentityIndex {
    /// Index seeded from the given events.
    pub fn from_events<'a>(events: impl IntoIterator<Item = &'a TimelineEvent>) -> Self {
        let mut index = Self::default();
        for event in events {
            index.admit(event);
        }
        index
    }

    /// Record `event` if it is new or supersedes the known version.
    ///
    /// Returns whether the event was admitted.
    pub fn admit(&mut self, event: &TimelineEvent) -> bool {
        let identity = event.identity();
        if !identity.is_address() {
            return self.known.insert(identity);
        }

        let newer = match self.versions.get(&identity) {
            Some((created_at, id)) => (event.created_at, &event.id) > (*created_at, id),
            None => true,
        };
        if newer {
            self.versions
                .insert(identity.clone(), (event.created_at, event.id.clone()));
            self.known.insert(identity);
        }
        newer
    }

    /// Undo the admission of a pending event that was discarded.
    ///
    /// An addressable identity falls back to the version held in `timeline`,
    /// if any, so older re-deliveries stay suppressed.
    pub fn forget(&mut self, event: &TimelineEvent, timeline: &[TimelineEvent]) {
        let identity = event.identity();
        if !identity.is_address() {
            self.known.remove(&identity);
            return;
        }

        let is_current = self
            .versions
            .get(&identity)
            .is_some_and(|(created_at, id)| *created_at == event.created_at && *id == event.id);
        if !is_current {
            return;
        }

        match timeline.iter().find(|e| e.identity() == identity) {
            Some(held) => {
                self.versions
                    .insert(identity, (held.created_at, held.id.clone()));
            }
            None => {
                self.versions.remove(&identity);
                self.known.remove(&identity);
            }
        }
    }

    /// Whether the identity has been admitted.
    pub fn contains(&self, identity: &EventIdentity) -> bool {
        self.known.contains(identity)
    }

    pub fn len(&self) -> usize {
        self.known.len()
    }

    pub fn is_empty(&self) -> bool {
        self.known.is_empty()
    }
}
