//! Transaction manager: reservation-then-persist append path
//!
//! Reservation and persistence are separate steps so a replication layer can
//! confirm quorum between them without burning sequence-number space on
//! aborted writes.

use crate::core::event::Token;
use crate::core::Event;
use crate::error::{EngineError, Result};
use crate::storage::StorageEngine;
use crate::transaction::sequence::{SequenceNumberCache, SequenceReservation};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Coordinates sequence reservation and batch persistence for one engine
pub struct TransactionManager {
    engine: Arc<StorageEngine>,
    cache: Arc<SequenceNumberCache>,
}

impl TransactionManager {
    /// Create a manager over the engine; the sequence cache registers a
    /// close listener so engine shutdown drops all cached entries
    pub fn new(engine: Arc<StorageEngine>) -> Self {
        let cache = SequenceNumberCache::new(engine.config().sequence_cache_capacity);
        let listener_cache = cache.clone();
        engine.register_close_listener(move || listener_cache.clear());
        Self { engine, cache }
    }

    /// Validate and claim sequence ranges for every aggregate in the batch.
    ///
    /// Fails with `InvalidSequence` when a declared first sequence does not
    /// match the next expected one; on failure nothing stays reserved. The
    /// returned handle releases the claims if dropped before `store_batch`
    /// succeeds.
    pub fn reserve_sequence_numbers(&self, events: &[Event]) -> Result<SequenceReservation> {
        let engine = self.engine.clone();
        self.cache.reserve(
            events,
            self.engine.config().sequence_validation_strategy,
            move |aggregate| engine.get_last_sequence_number(aggregate),
        )
    }

    /// Persist a batch whose reservations are held.
    ///
    /// Completes with the first assigned token once the write reaches fsync.
    /// On persistence failure the reservation rolls back; on success the
    /// cache advances permanently.
    pub async fn store_batch(
        &self,
        events: Vec<Event>,
        reservation: SequenceReservation,
    ) -> Result<Token> {
        match self.engine.store(events).await {
            Ok(token) => {
                reservation.commit();
                Ok(token)
            }
            Err(e) => Err(e),
        }
    }

    /// Reserve and persist in one step
    pub async fn append(&self, events: Vec<Event>) -> Result<Token> {
        let reservation = self.reserve_sequence_numbers(&events)?;
        self.store_batch(events, reservation).await
    }

    /// Like `append`, but gives up with `AppendCancelled` if `cancel` fires
    /// while the batch is still queued behind the writer. Once the write is
    /// in flight it runs to completion; the event may then be durable even
    /// though the caller saw a cancellation.
    pub async fn append_cancellable(
        &self,
        events: Vec<Event>,
        cancel: CancellationToken,
    ) -> Result<Token> {
        let reservation = self.reserve_sequence_numbers(&events)?;
        if cancel.is_cancelled() {
            return Err(EngineError::AppendCancelled);
        }
        tokio::select! {
            biased;
            result = self.store_batch(events, reservation) => result,
            _ = cancel.cancelled() => Err(EngineError::AppendCancelled),
        }
    }

    pub fn cache(&self) -> &Arc<SequenceNumberCache> {
        &self.cache
    }
}
