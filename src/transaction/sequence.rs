//! Per-aggregate sequence-number cache
//!
//! The cache maps aggregate ids to the next expected sequence number so
//! concurrent appenders cannot claim the same range twice. Mutation is
//! guarded per key; entries beyond the configured capacity are evicted in
//! LRU order, and evicting a live entry simply forces the next reservation
//! to reread the engine.

use crate::config::SequenceValidationStrategy;
use crate::core::event::Event;
use crate::error::{EngineError, Result};
use dashmap::DashMap;
use lru::LruCache;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::warn;

#[derive(Debug, Default)]
struct Slot {
    /// Next expected sequence reflecting persisted events
    committed: Option<u64>,
    /// Next expected sequence including in-flight reservations
    reserved: Option<u64>,
}

/// Process-wide reservation table shared across writers
pub struct SequenceNumberCache {
    slots: DashMap<String, Arc<Mutex<Slot>>>,
    recency: Mutex<LruCache<String, ()>>,
    capacity: usize,
}

impl SequenceNumberCache {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            slots: DashMap::new(),
            recency: Mutex::new(LruCache::unbounded()),
            capacity,
        })
    }

    /// Drop every entry; registered as the engine's close listener
    pub fn clear(&self) {
        self.slots.clear();
        self.recency.lock().expect("recency lock poisoned").clear();
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn touch(&self, aggregate: &str) {
        let mut recency = self.recency.lock().expect("recency lock poisoned");
        recency.put(aggregate.to_string(), ());
        while recency.len() > self.capacity {
            let Some((victim, _)) = recency.pop_lru() else {
                break;
            };
            let in_flight = self
                .slots
                .get(&victim)
                .map(|slot| slot.lock().expect("slot poisoned").reserved.is_some())
                .unwrap_or(false);
            if in_flight {
                // Never drop a pending reservation; retry on a later touch
                recency.put(victim, ());
                break;
            }
            self.slots.remove(&victim);
        }
    }

    /// Claim sequence ranges for every distinct aggregate in the batch.
    ///
    /// `lookup` supplies the engine's last stored sequence number for
    /// aggregates that are not cached. On a mismatch nothing stays reserved.
    pub fn reserve<F>(
        self: &Arc<Self>,
        events: &[Event],
        strategy: SequenceValidationStrategy,
        lookup: F,
    ) -> Result<SequenceReservation>
    where
        F: Fn(&str) -> Result<Option<u64>>,
    {
        if strategy == SequenceValidationStrategy::Off {
            return Ok(SequenceReservation::empty(self.clone()));
        }

        // First declared sequence and event count per aggregate, in batch order
        let mut order: Vec<&str> = Vec::new();
        let mut per_aggregate: HashMap<&str, (u64, u64)> = HashMap::new();
        for event in events.iter().filter(|e| e.is_domain_event()) {
            per_aggregate
                .entry(event.aggregate_identifier.as_str())
                .and_modify(|(_, count)| *count += 1)
                .or_insert_with(|| {
                    order.push(event.aggregate_identifier.as_str());
                    (event.aggregate_sequence_number, 1)
                });
        }

        let mut reservation = SequenceReservation::empty(self.clone());
        for aggregate in order {
            let (declared, count) = per_aggregate[aggregate];
            let slot = self
                .slots
                .entry(aggregate.to_string())
                .or_default()
                .clone();
            let mut guard = slot.lock().expect("slot poisoned");

            let expected = match guard.reserved.or(guard.committed) {
                Some(next) => next,
                None => lookup(aggregate)?.map(|last| last + 1).unwrap_or(0),
            };
            if guard.committed.is_none() {
                guard.committed = Some(expected);
            }

            let base = if declared == expected {
                expected
            } else {
                match strategy {
                    SequenceValidationStrategy::Fail => {
                        drop(guard);
                        // Dropping the partial reservation rolls it back
                        return Err(EngineError::InvalidSequence {
                            aggregate: aggregate.to_string(),
                            expected,
                            got: declared,
                        });
                    }
                    SequenceValidationStrategy::Log => {
                        warn!(
                            aggregate,
                            expected, declared, "accepting out-of-order sequence number"
                        );
                        declared
                    }
                    SequenceValidationStrategy::Off => unreachable!(),
                }
            };

            reservation.claims.push(Claim {
                aggregate: aggregate.to_string(),
                end: base + count,
                previous_reserved: guard.reserved,
            });
            guard.reserved = Some(base + count);
            drop(guard);
            self.touch(aggregate);
        }
        Ok(reservation)
    }

    fn slot(&self, aggregate: &str) -> Option<Arc<Mutex<Slot>>> {
        self.slots.get(aggregate).map(|slot| slot.clone())
    }
}

#[derive(Debug)]
struct Claim {
    aggregate: String,
    /// Sequence number just past the claimed range
    end: u64,
    previous_reserved: Option<u64>,
}

/// Holder of claimed sequence ranges.
///
/// Dropping the handle before `commit` releases the claims so an aborted
/// write leaves no holes in the cached sequence space.
pub struct SequenceReservation {
    cache: Arc<SequenceNumberCache>,
    claims: Vec<Claim>,
    committed: bool,
}

impl SequenceReservation {
    fn empty(cache: Arc<SequenceNumberCache>) -> Self {
        Self {
            cache,
            claims: Vec::new(),
            committed: false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.claims.is_empty()
    }

    /// Make the claimed ranges permanent after a successful write
    pub fn commit(mut self) {
        for claim in &self.claims {
            if let Some(slot) = self.cache.slot(&claim.aggregate) {
                let mut guard = slot.lock().expect("slot poisoned");
                guard.committed = Some(guard.committed.unwrap_or(0).max(claim.end));
                if guard.reserved == Some(claim.end) {
                    guard.reserved = None;
                }
            }
        }
        self.committed = true;
    }

    fn rollback(&mut self) {
        for claim in self.claims.drain(..).rev() {
            if let Some(slot) = self.cache.slot(&claim.aggregate) {
                let mut guard = slot.lock().expect("slot poisoned");
                // Only unwind if no later reservation stacked on top of ours
                if guard.reserved == Some(claim.end) {
                    guard.reserved = claim.previous_reserved;
                }
            }
        }
    }
}

impl Drop for SequenceReservation {
    fn drop(&mut self) {
        if !self.committed {
            self.rollback();
        }
    }
}

impl std::fmt::Debug for SequenceReservation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SequenceReservation")
            .field("claims", &self.claims)
            .field("committed", &self.committed)
            .finish()
    }
}
