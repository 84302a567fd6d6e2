//! Buffered statement queue
//!
//! Producers push onto a lock-free `SegQueue`; the flush path drains it and
//! hands the rows to the backend worker. Rows that failed for a retryable
//! reason go into a small front queue that is only touched by the flush path,
//! so the producer side never takes a lock.
//!
//! ```text
//! enqueue ──► live (SegQueue) ─┐
//!                              ├──► drain ──► batch ──► commit / drop
//! requeue ──► retry (front) ───┘                 │
//!        ▲──────────────────────────────────────┘ (connectivity failure)
//! ```
//!
//! `pending_count` covers rows that are queued *and* rows that are in flight:
//! it only goes down when a row is committed, dropped, or dumped.

use crate::clock::Timestamp;
use crate::error::EnqueueError;
use crate::value::SqlValue;
use crossbeam::queue::SegQueue;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

const NO_ROWS: u64 = u64::MAX;

/// One buffered row, positional and already width-checked
#[derive(Debug, Clone, PartialEq)]
pub struct PendingRow {
    pub values: Vec<SqlValue>,
    pub enqueued_at: Timestamp,
}

#[derive(Debug)]
pub struct StatementQueue {
    width: usize,
    live: SegQueue<PendingRow>,
    retry: Mutex<VecDeque<PendingRow>>,
    pending: AtomicUsize,
    /// Enqueue time of the oldest queued row, `NO_ROWS` when empty
    oldest_ms: AtomicU64,
    dropped: AtomicU64,
}

impl StatementQueue {
    pub fn new(width: usize) -> Self {
        StatementQueue {
            width,
            live: SegQueue::new(),
            retry: Mutex::new(VecDeque::new()),
            pending: AtomicUsize::new(0),
            oldest_ms: AtomicU64::new(NO_ROWS),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    /// Append a row. Width-mismatched rows are refused and nothing changes.
    pub fn enqueue(&self, values: Vec<SqlValue>, now: Timestamp) -> Result<(), EnqueueError> {
        if values.len() != self.width {
            return Err(EnqueueError::WidthMismatch {
                expected: self.width,
                actual: values.len(),
            });
        }
        self.pending.fetch_add(1, Ordering::AcqRel);
        self.live.push(PendingRow {
            values,
            enqueued_at: now,
        });
        // After the push: a drain in between may leave a stale age, never a missing one
        self.oldest_ms.fetch_min(now.as_millis(), Ordering::AcqRel);
        Ok(())
    }

    /// Rows enqueued and not yet committed, dropped or dumped
    pub fn pending_count(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Rows currently sitting in the queue (excludes rows in flight)
    pub fn queued_len(&self) -> usize {
        self.live.len() + self.retry.lock().len()
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Acquire)
    }

    pub fn oldest_age(&self, now: Timestamp) -> Option<Duration> {
        match self.oldest_ms.load(Ordering::Acquire) {
            NO_ROWS => None,
            ms => Some(now.duration_since(Timestamp(ms))),
        }
    }

    /// Take every queued row for execution: requeued rows first, then the
    /// live rows in enqueue order. Producers keep enqueueing meanwhile.
    pub fn drain(&self) -> Vec<PendingRow> {
        // Reset first: rows pushed after this point record their own age
        self.oldest_ms.store(NO_ROWS, Ordering::Release);
        let mut rows: Vec<PendingRow> = self.retry.lock().drain(..).collect();
        rows.reserve(self.live.len());
        while let Some(row) = self.live.pop() {
            rows.push(row);
        }
        rows
    }

    /// Drained rows that reached the store
    pub fn mark_committed(&self, count: usize) {
        self.release(count);
    }

    /// Drained rows rejected for a non-retryable reason
    pub fn mark_dropped(&self, count: usize) {
        self.release(count);
        self.dropped.fetch_add(count as u64, Ordering::AcqRel);
    }

    /// Put rows that failed for a retryable reason back at the front,
    /// preserving their relative order.
    pub fn requeue_front(&self, rows: Vec<PendingRow>) {
        if rows.is_empty() {
            return;
        }
        let oldest = rows.iter().map(|r| r.enqueued_at.as_millis()).min();
        {
            let mut retry = self.retry.lock();
            for row in rows.into_iter().rev() {
                retry.push_front(row);
            }
        }
        if let Some(oldest) = oldest {
            self.oldest_ms.fetch_min(oldest, Ordering::AcqRel);
        }
    }

    /// Drained rows written to a recovery dump
    pub fn mark_dumped(&self, count: usize) {
        self.release(count);
    }

    fn release(&self, count: usize) {
        let previous = self.pending.fetch_sub(count, Ordering::AcqRel);
        debug_assert!(
            previous >= count,
            "Released {} rows with only {} pending",
            count,
            previous
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(v: i64) -> Vec<SqlValue> {
        vec![SqlValue::Integer(v), SqlValue::Real(v as f64)]
    }

    #[test]
    fn test_enqueue_counts_exactly_one() {
        let q = StatementQueue::new(2);
        q.enqueue(row(1), Timestamp(10)).unwrap();
        assert_eq!(q.pending_count(), 1);
        q.enqueue(row(2), Timestamp(20)).unwrap();
        assert_eq!(q.pending_count(), 2);
        assert_eq!(q.queued_len(), 2);
    }

    #[test]
    fn test_width_mismatch_is_rejected_without_side_effects() {
        let q = StatementQueue::new(2);
        let err = q
            .enqueue(vec![SqlValue::Integer(1)], Timestamp(10))
            .unwrap_err();
        assert_eq!(
            err,
            EnqueueError::WidthMismatch {
                expected: 2,
                actual: 1
            }
        );
        assert_eq!(q.pending_count(), 0);
        assert_eq!(q.oldest_age(Timestamp(100)), None);
    }

    #[test]
    fn test_drain_keeps_rows_pending_until_resolved() {
        let q = StatementQueue::new(2);
        for i in 0..3 {
            q.enqueue(row(i), Timestamp(i as u64)).unwrap();
        }
        let drained = q.drain();
        assert_eq!(drained.len(), 3);
        assert_eq!(q.queued_len(), 0);
        assert_eq!(q.pending_count(), 3, "in-flight rows still count");

        q.mark_committed(2);
        q.mark_dropped(1);
        assert_eq!(q.pending_count(), 0);
        assert_eq!(q.dropped_count(), 1);
    }

    #[test]
    fn test_drain_is_fifo() {
        let q = StatementQueue::new(2);
        for i in 0..5 {
            q.enqueue(row(i), Timestamp(0)).unwrap();
        }
        let order: Vec<i64> = q
            .drain()
            .iter()
            .map(|r| r.values[0].as_i64().unwrap())
            .collect();
        assert_eq!(order, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_requeued_rows_go_ahead_of_new_rows() {
        let q = StatementQueue::new(2);
        q.enqueue(row(1), Timestamp(1)).unwrap();
        q.enqueue(row(2), Timestamp(2)).unwrap();
        let drained = q.drain();

        q.enqueue(row(3), Timestamp(3)).unwrap();
        q.requeue_front(drained);

        let order: Vec<i64> = q
            .drain()
            .iter()
            .map(|r| r.values[0].as_i64().unwrap())
            .collect();
        assert_eq!(order, vec![1, 2, 3]);
        assert_eq!(q.pending_count(), 3);
    }

    #[test]
    fn test_oldest_age_tracks_requeue() {
        let q = StatementQueue::new(2);
        q.enqueue(row(1), Timestamp(1_000)).unwrap();
        assert_eq!(
            q.oldest_age(Timestamp(4_000)),
            Some(Duration::from_secs(3))
        );

        let drained = q.drain();
        assert_eq!(q.oldest_age(Timestamp(4_000)), None);

        q.requeue_front(drained);
        assert_eq!(
            q.oldest_age(Timestamp(5_000)),
            Some(Duration::from_secs(4))
        );
    }

    #[test]
    fn test_dumped_rows_are_released_without_counting_drops() {
        let q = StatementQueue::new(2);
        q.enqueue(row(1), Timestamp(1)).unwrap();
        q.enqueue(row(2), Timestamp(1)).unwrap();
        let rows = q.drain();
        q.mark_dumped(rows.len());
        assert_eq!(q.pending_count(), 0);
        assert_eq!(q.dropped_count(), 0);
    }

    #[test]
    fn test_concurrent_producers() {
        use std::sync::Arc;

        let q = Arc::new(StatementQueue::new(2));
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let q = q.clone();
                std::thread::spawn(move || {
                    for i in 0..250 {
                        q.enqueue(row(t * 1000 + i), Timestamp(0)).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(q.pending_count(), 1000);
        assert_eq!(q.drain().len(), 1000);
    }

    #[test]
    fn test_queued_rows_always_have_an_age_under_concurrent_drain() {
        use std::sync::atomic::AtomicBool;
        use std::sync::Arc;

        for _ in 0..20 {
            let q = Arc::new(StatementQueue::new(2));
            let done = Arc::new(AtomicBool::new(false));
            let drainer = {
                let q = q.clone();
                let done = done.clone();
                std::thread::spawn(move || {
                    let mut drained = 0;
                    while !done.load(Ordering::Acquire) {
                        drained += q.drain().len();
                    }
                    drained
                })
            };
            let producers: Vec<_> = (0..4)
                .map(|t| {
                    let q = q.clone();
                    std::thread::spawn(move || {
                        for i in 0..200 {
                            q.enqueue(row(t * 1000 + i), Timestamp(1_000)).unwrap();
                        }
                    })
                })
                .collect();
            for p in producers {
                p.join().unwrap();
            }
            done.store(true, Ordering::Release);
            let drained = drainer.join().unwrap();

            let left = q.queued_len();
            assert_eq!(drained + left, 800);
            if left > 0 {
                assert_eq!(
                    q.oldest_age(Timestamp(4_000)),
                    Some(Duration::from_secs(3)),
                    "{} queued rows without an age",
                    left
                );
            }
        }
    }
}
