//! The narrow operation surface exposed to transports
//!
//! An `EventStore` owns two engines sharing one configuration: the event
//! store proper and a sibling snapshot store. Snapshots carry the sequence
//! number of the last event they summarize, so the snapshot store runs with
//! sequence validation off.

use crate::config::{SequenceValidationStrategy, StorageConfig};
use crate::core::event::{Event, EventWithToken, Token};
use crate::error::{EngineError, Result};
use crate::index::IndexEntry;
use crate::storage::{QueryOptions, SegmentId, StorageEngine};
use crate::streams::{EventStream, FlowControl};
use crate::transaction::TransactionManager;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Acknowledgement of a durable append
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Confirmation {
    /// Token of the first event in the appended batch
    pub token: Token,
}

/// Event store service: events plus snapshots for one context
pub struct EventStore {
    events: Arc<StorageEngine>,
    snapshots: Arc<StorageEngine>,
    transactions: TransactionManager,
}

impl EventStore {
    /// Open (or create) both stores of the context
    pub fn open(config: StorageConfig) -> Result<Self> {
        let events = StorageEngine::open_at(config.events_dir(), config.clone())?;
        let snapshots = StorageEngine::open_at(
            config.snapshots_dir(),
            config.with_sequence_validation(SequenceValidationStrategy::Off),
        )?;
        let transactions = TransactionManager::new(events.clone());
        Ok(Self {
            events,
            snapshots,
            transactions,
        })
    }

    /// Append a batch of domain events as one transaction
    pub async fn append_events(&self, events: Vec<Event>) -> Result<Confirmation> {
        let reservation = self.transactions.reserve_sequence_numbers(&events)?;
        let token = self.transactions.store_batch(events, reservation).await?;
        Ok(Confirmation { token })
    }

    /// Append an aggregate snapshot
    pub async fn append_snapshot(&self, mut snapshot: Event) -> Result<Confirmation> {
        if !snapshot.is_domain_event() {
            return Err(EngineError::Configuration(
                "a snapshot must carry an aggregate identifier".to_string(),
            ));
        }
        snapshot.snapshot = true;
        let token = self.snapshots.store(vec![snapshot]).await?;
        Ok(Confirmation { token })
    }

    /// Replay one aggregate's events with sequences in
    /// `[first_sequence, last_sequence)`.
    ///
    /// With `allow_snapshots` the stream starts at the newest snapshot inside
    /// the window and continues with the events recorded after it.
    pub fn list_aggregate_events(
        &self,
        aggregate: &str,
        first_sequence: u64,
        last_sequence: u64,
        allow_snapshots: bool,
    ) -> Result<EventStream<Event>> {
        let mut start = first_sequence;
        let mut seed = None;
        if allow_snapshots {
            if let Some(found) = self
                .snapshots
                .index()
                .last_index_entries(aggregate, last_sequence.saturating_sub(1))?
            {
                if let Some(entry) = found.entries.iter().max_by_key(|e| e.sequence_number) {
                    if entry.sequence_number >= first_sequence {
                        let source = self
                            .snapshots
                            .head_layer()
                            .get_event_source(found.segment)?;
                        seed = Some(source.read_event(entry.offset)?);
                        start = entry.sequence_number + 1;
                    }
                }
            }
        }

        let mut inner =
            self.events
                .events_per_aggregate(aggregate, start, last_sequence, 0);
        let (tx, rx) = mpsc::channel(8);
        tokio::spawn(async move {
            if let Some(snapshot) = seed {
                if tx.send(Ok(snapshot)).await.is_err() {
                    return;
                }
            }
            while let Some(item) = inner.next_event().await {
                if tx.send(item).await.is_err() {
                    return;
                }
            }
        });
        Ok(EventStream::new(rx))
    }

    /// Snapshots of one aggregate with sequences in
    /// `[first_sequence, last_sequence)`, newest first
    pub fn list_aggregate_snapshots(
        &self,
        aggregate: &str,
        first_sequence: u64,
        last_sequence: u64,
        max_results: usize,
    ) -> Result<EventStream<Event>> {
        let resolved = self.snapshots.index().lookup_aggregate(
            aggregate,
            first_sequence,
            last_sequence,
            max_results,
            0,
        )?;
        let mut descending: Vec<(SegmentId, Vec<IndexEntry>)> = resolved.into_iter().collect();
        descending.reverse();

        let snapshots = self.snapshots.clone();
        let (tx, rx) = mpsc::channel(8);
        tokio::spawn(async move {
            let layer = snapshots.head_layer();
            let mut remaining = max_results;
            for (segment, entries) in descending {
                let source = match layer.get_event_source(segment) {
                    Ok(source) => source,
                    Err(e) => {
                        let _ = tx.send(Err(e)).await;
                        return;
                    }
                };
                for entry in entries.iter().rev() {
                    if remaining == 0 {
                        return;
                    }
                    match source.read_event(entry.offset) {
                        Ok(event) => {
                            if tx.send(Ok(event)).await.is_err() {
                                return;
                            }
                            remaining -= 1;
                        }
                        Err(e) => {
                            let _ = tx.send(Err(e)).await;
                            return;
                        }
                    }
                }
            }
        });
        Ok(EventStream::new(rx))
    }

    /// Stream events with their tokens starting at `first_token`, bounded by
    /// the store's current end.
    ///
    /// Delivery is permit-driven: the producer sends one event per permit
    /// granted through the returned `FlowControl` and parks while the
    /// permit counter is empty. Cancelling releases the underlying segment
    /// sources within one event.
    pub fn list_events(
        &self,
        first_token: Token,
    ) -> Result<(EventStream<EventWithToken>, Arc<FlowControl>)> {
        let mut iterator = self
            .events
            .transaction_iterator(first_token, Token::MAX)?;
        let flow = FlowControl::new();
        let producer_flow = flow.clone();
        let (tx, rx) = mpsc::channel(self.events.config().events_per_segment_prefetch.max(1));

        tokio::spawn(async move {
            let mut buffer: VecDeque<EventWithToken> = VecDeque::new();
            loop {
                if !producer_flow.acquire().await {
                    return;
                }
                while buffer.is_empty() {
                    match iterator.next_transaction() {
                        Ok(None) => return,
                        Ok(Some(transaction)) => {
                            let first = transaction.token;
                            buffer.extend(
                                transaction
                                    .events
                                    .into_iter()
                                    .enumerate()
                                    .map(|(i, event)| {
                                        EventWithToken::new(first + i as u64, event)
                                    }),
                            );
                        }
                        Err(e) => {
                            let _ = tx.send(Err(e)).await;
                            return;
                        }
                    }
                }
                let event = buffer.pop_front().unwrap();
                if tx.send(Ok(event)).await.is_err() {
                    return;
                }
            }
        });
        Ok((EventStream::new(rx), flow))
    }

    /// Scan stored events against a predicate within token and timestamp
    /// bounds, newest segment first
    pub fn query_events<F>(&self, options: &QueryOptions, predicate: F) -> Result<()>
    where
        F: FnMut(&EventWithToken) -> bool,
    {
        self.events.query(options, predicate)
    }

    /// Highest stored sequence number of an aggregate
    pub fn read_highest_sequence_number(&self, aggregate: &str) -> Result<Option<u64>> {
        self.events.get_last_sequence_number(aggregate)
    }

    pub fn get_first_token(&self) -> Token {
        self.events.first_token()
    }

    pub fn get_last_token(&self) -> Option<Token> {
        self.events.last_token()
    }

    /// Token of the first event at or after the given instant
    pub fn get_token_at(&self, instant_millis: i64) -> Result<Token> {
        self.events.get_token_at(instant_millis)
    }

    /// Compare a replicated transaction against local storage
    pub fn validate_transaction(&self, token: Token, expected: &[Event]) -> Result<()> {
        self.events.validate_transaction(token, expected)
    }

    pub fn transactions(&self) -> &TransactionManager {
        &self.transactions
    }

    pub fn events_engine(&self) -> &Arc<StorageEngine> {
        &self.events
    }

    pub fn snapshots_engine(&self) -> &Arc<StorageEngine> {
        &self.snapshots
    }

    /// Close both engines
    pub fn close(&self) {
        self.events.close();
        self.snapshots.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    fn open_store(root: &std::path::Path) -> EventStore {
        let config = StorageConfig::new(root, "default").with_max_segment_size(64 * 1024);
        EventStore::open(config).unwrap()
    }

    fn event(aggregate: &str, seq: u64) -> Event {
        Event::builder(aggregate, seq)
            .aggregate_type("Order")
            .payload("OrderEvent", format!("payload-{seq}").into_bytes())
            .timestamp(1_000 + seq as i64)
            .build()
    }

    #[tokio::test]
    async fn test_append_and_replay() {
        let dir = TempDir::new().unwrap();
        let store = open_store(dir.path());

        let confirmation = store
            .append_events(vec![event("order-1", 0), event("order-1", 1)])
            .await
            .unwrap();
        assert_eq!(confirmation.token, 0);

        let replayed = store
            .list_aggregate_events("order-1", 0, u64::MAX, false)
            .unwrap()
            .collect_all()
            .await
            .unwrap();
        assert_eq!(replayed.len(), 2);
        assert_eq!(store.read_highest_sequence_number("order-1").unwrap(), Some(1));
        assert_eq!(store.get_first_token(), 0);
        assert_eq!(store.get_last_token(), Some(1));
    }

    #[tokio::test]
    async fn test_snapshot_seeds_aggregate_replay() {
        let dir = TempDir::new().unwrap();
        let store = open_store(dir.path());

        for seq in 0..6u64 {
            store.append_events(vec![event("order-1", seq)]).await.unwrap();
        }
        let snapshot = Event::builder("order-1", 3)
            .aggregate_type("Order")
            .payload("OrderState", b"state-at-3".to_vec())
            .build();
        store.append_snapshot(snapshot).await.unwrap();

        let replayed = store
            .list_aggregate_events("order-1", 0, u64::MAX, true)
            .unwrap()
            .collect_all()
            .await
            .unwrap();

        // Snapshot at sequence 3, then events 4 and 5
        assert_eq!(replayed.len(), 3);
        assert!(replayed[0].snapshot);
        assert_eq!(replayed[0].aggregate_sequence_number, 3);
        assert_eq!(replayed[1].aggregate_sequence_number, 4);
        assert_eq!(replayed[2].aggregate_sequence_number, 5);

        // Without snapshots the full history comes back
        let full = store
            .list_aggregate_events("order-1", 0, u64::MAX, false)
            .unwrap()
            .collect_all()
            .await
            .unwrap();
        assert_eq!(full.len(), 6);
        assert!(full.iter().all(|e| !e.snapshot));
    }

    #[tokio::test]
    async fn test_list_snapshots_newest_first() {
        let dir = TempDir::new().unwrap();
        let store = open_store(dir.path());

        for seq in 0..9u64 {
            store.append_events(vec![event("order-1", seq)]).await.unwrap();
        }
        for seq in [2u64, 5, 8] {
            let snapshot = Event::builder("order-1", seq)
                .payload("OrderState", format!("state-{seq}").into_bytes())
                .build();
            store.append_snapshot(snapshot).await.unwrap();
        }

        let snapshots = store
            .list_aggregate_snapshots("order-1", 0, u64::MAX, usize::MAX)
            .unwrap()
            .collect_all()
            .await
            .unwrap();
        let sequences: Vec<u64> = snapshots
            .iter()
            .map(|e| e.aggregate_sequence_number)
            .collect();
        assert_eq!(sequences, vec![8, 5, 2]);

        let capped = store
            .list_aggregate_snapshots("order-1", 0, u64::MAX, 1)
            .unwrap()
            .collect_all()
            .await
            .unwrap();
        assert_eq!(capped.len(), 1);
        assert_eq!(capped[0].aggregate_sequence_number, 8);
    }

    #[tokio::test]
    async fn test_list_events_is_permit_driven() {
        let dir = TempDir::new().unwrap();
        let store = open_store(dir.path());
        for seq in 0..5u64 {
            store.append_events(vec![event("order-1", seq)]).await.unwrap();
        }

        let (mut stream, flow) = store.list_events(0).unwrap();

        // No permits granted: nothing may arrive
        let starved = tokio::time::timeout(Duration::from_millis(50), stream.next_event()).await;
        assert!(starved.is_err());

        flow.request(2);
        let first = stream.next_event().await.unwrap().unwrap();
        let second = stream.next_event().await.unwrap().unwrap();
        assert_eq!(first.token, 0);
        assert_eq!(second.token, 1);

        // Both permits consumed: starved again
        let starved = tokio::time::timeout(Duration::from_millis(50), stream.next_event()).await;
        assert!(starved.is_err());

        flow.request(100);
        let mut rest = Vec::new();
        while let Some(item) = stream.next_event().await {
            rest.push(item.unwrap().token);
        }
        assert_eq!(rest, vec![2, 3, 4]);
    }

    #[tokio::test]
    async fn test_list_events_cancellation_releases_sources() {
        let dir = TempDir::new().unwrap();
        let store = open_store(dir.path());
        for seq in 0..3u64 {
            store.append_events(vec![event("order-1", seq)]).await.unwrap();
        }

        let (mut stream, flow) = store.list_events(0).unwrap();
        flow.request(1);
        stream.next_event().await.unwrap().unwrap();

        flow.cancel();
        assert!(stream.next_event().await.is_none());
        // Give the producer a beat to drop its iterator
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(store.events_engine().open_event_sources(), 0);
    }

    #[tokio::test]
    async fn test_query_events_and_validate_transaction() {
        let dir = TempDir::new().unwrap();
        let store = open_store(dir.path());
        let stored = vec![event("order-1", 0), event("order-1", 1)];
        store.append_events(stored.clone()).await.unwrap();

        let mut count = 0;
        store
            .query_events(&QueryOptions::default(), |_| {
                count += 1;
                true
            })
            .unwrap();
        assert_eq!(count, 2);

        store.validate_transaction(0, &stored).unwrap();
        let mut tampered = stored;
        tampered[1].meta_data = b"extra".to_vec();
        assert!(store.validate_transaction(0, &tampered).is_err());
    }

    #[tokio::test]
    async fn test_snapshot_store_ignores_sequence_gaps() {
        let dir = TempDir::new().unwrap();
        let store = open_store(dir.path());

        // Snapshots at arbitrary, non-dense sequences are fine
        for seq in [7u64, 3, 11] {
            let snapshot = Event::builder("order-1", seq)
                .payload("OrderState", vec![])
                .build();
            store.append_snapshot(snapshot).await.unwrap();
        }
        // But the event store still enforces density
        let err = store
            .append_events(vec![event("order-1", 5)])
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidSequence { .. }));
    }
}
