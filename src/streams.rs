//! Demand-driven streaming primitives
//!
//! Streaming reads are pull-based. Aggregate replay leans on bounded channel
//! backpressure; token-range tailing additionally carries an integer demand
//! counter fed by consumer permits. Dropping a stream cancels its producer.

use crate::error::Result;
use futures::Stream;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::{mpsc, Notify};

/// A finite stream of engine results fed by a background producer.
///
/// Dropping the stream closes the channel, which the producer observes on
/// its next send and uses to release its segment sources.
pub struct EventStream<T> {
    rx: mpsc::Receiver<Result<T>>,
}

impl<T> EventStream<T> {
    pub(crate) fn new(rx: mpsc::Receiver<Result<T>>) -> Self {
        Self { rx }
    }

    /// Receive the next item, or `None` when the producer is done
    pub async fn next_event(&mut self) -> Option<Result<T>> {
        self.rx.recv().await
    }

    /// Drain the stream, failing on the first producer error
    pub async fn collect_all(mut self) -> Result<Vec<T>> {
        let mut items = Vec::new();
        while let Some(item) = self.rx.recv().await {
            items.push(item?);
        }
        Ok(items)
    }
}

impl<T> Stream for EventStream<T> {
    type Item = Result<T>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

/// Consumer-driven permit counter for a streaming read.
///
/// The producer acquires one permit per delivered item and parks while the
/// counter is empty; `request` tops the counter up, `cancel` wakes the
/// producer so it can release its resources immediately.
pub struct FlowControl {
    demand: AtomicI64,
    notify: Notify,
    cancelled: AtomicBool,
}

impl FlowControl {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            demand: AtomicI64::new(0),
            notify: Notify::new(),
            cancelled: AtomicBool::new(false),
        })
    }

    /// Grant the producer `permits` more items
    pub fn request(&self, permits: u64) {
        self.demand
            .fetch_add(permits.min(i64::MAX as u64) as i64, Ordering::AcqRel);
        self.notify.notify_waiters();
    }

    /// Cancel the stream; the producer stops within one item
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Take one permit, waiting for demand. Returns false when cancelled.
    pub(crate) async fn acquire(&self) -> bool {
        loop {
            if self.is_cancelled() {
                return false;
            }
            let current = self.demand.load(Ordering::Acquire);
            if current > 0
                && self
                    .demand
                    .compare_exchange(current, current - 1, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
            {
                return true;
            }

            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.demand.load(Ordering::Acquire) > 0 || self.is_cancelled() {
                continue;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_acquire_waits_for_permits() {
        let flow = FlowControl::new();
        let waiter = {
            let flow = flow.clone();
            tokio::spawn(async move { flow.acquire().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        flow.request(1);
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn test_permits_are_consumed_one_per_acquire() {
        let flow = FlowControl::new();
        flow.request(2);
        assert!(flow.acquire().await);
        assert!(flow.acquire().await);

        let waiter = {
            let flow = flow.clone();
            tokio::spawn(async move { flow.acquire().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        flow.cancel();
        assert!(!waiter.await.unwrap());
    }

    #[tokio::test]
    async fn test_stream_ends_when_producer_drops() {
        let (tx, rx) = mpsc::channel(4);
        let mut stream = EventStream::new(rx);
        tx.send(Ok(1u32)).await.unwrap();
        drop(tx);

        assert_eq!(stream.next_event().await.unwrap().unwrap(), 1);
        assert!(stream.next_event().await.is_none());
    }
}
