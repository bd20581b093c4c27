//! Publication metrics
//!
//! Side-channel gauges and counters, written by the execution thread, the
//! dispatcher and the sinks without coordination. Every field is an atomic; nothing here is
//! read back by the pipeline itself.

use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use crate::messages::MsgKind;

const KIND_COUNT: usize = MsgKind::ALL.len();

#[derive(Debug, Default)]
pub struct PublicationMetrics {
    /// Height of the last block fully dispatched
    pub publication_height: AtomicI64,
    /// Snapshots waiting in the publication queue
    pub publication_queue_size: AtomicI64,
    /// Time between the last two enqueued blocks
    pub publication_block_interval_ms: AtomicI64,
    /// Time to assemble the last snapshot
    pub collect_block_time_ms: AtomicI64,
    /// Time to dispatch every kind of the last block
    pub publish_block_time_ms: AtomicI64,
    /// Per-kind publish time of the last block
    pub publish_kind_time_ms: [AtomicI64; KIND_COUNT],
    /// Per-kind encode time of the last message, inside the sink
    pub encode_kind_time_ms: [AtomicI64; KIND_COUNT],

    pub num_trades: AtomicI64,
    pub num_orders: AtomicI64,
    pub num_order_books: AtomicI64,
    pub num_accounts: AtomicI64,

    /// Messages accepted by the sink, per kind (cumulative)
    pub published: [AtomicU64; KIND_COUNT],
    /// Payloads encoded, per kind (cumulative)
    pub encoded: [AtomicU64; KIND_COUNT],
    /// Publish calls that returned an error (cumulative)
    pub publish_failures: AtomicU64,
    /// Producer waits on a full publication queue (cumulative)
    pub backpressure_events: AtomicU64,
}

impl PublicationMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_publication_height(&self, height: i64) {
        self.publication_height.store(height, Ordering::Relaxed);
    }

    pub fn set_queue_size(&self, size: i64) {
        self.publication_queue_size.store(size, Ordering::Relaxed);
    }

    pub fn set_block_interval_ms(&self, ms: i64) {
        self.publication_block_interval_ms.store(ms, Ordering::Relaxed);
    }

    pub fn set_collect_time_ms(&self, ms: i64) {
        self.collect_block_time_ms.store(ms, Ordering::Relaxed);
    }

    pub fn set_publish_block_time_ms(&self, ms: i64) {
        self.publish_block_time_ms.store(ms, Ordering::Relaxed);
    }

    pub fn set_publish_kind_time_ms(&self, kind: MsgKind, ms: i64) {
        self.publish_kind_time_ms[kind.index()].store(ms, Ordering::Relaxed);
    }

    pub fn record_encode(&self, kind: MsgKind, elapsed: Duration) {
        self.encode_kind_time_ms[kind.index()].store(elapsed.as_millis() as i64, Ordering::Relaxed);
        self.encoded[kind.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_num_trades(&self, n: usize) {
        self.num_trades.store(n as i64, Ordering::Relaxed);
    }

    pub fn set_num_orders(&self, n: usize) {
        self.num_orders.store(n as i64, Ordering::Relaxed);
    }

    pub fn set_num_order_books(&self, n: usize) {
        self.num_order_books.store(n as i64, Ordering::Relaxed);
    }

    pub fn set_num_accounts(&self, n: usize) {
        self.num_accounts.store(n as i64, Ordering::Relaxed);
    }

    pub fn incr_published(&self, kind: MsgKind) {
        self.published[kind.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_publish_failures(&self) {
        self.publish_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_backpressure_events(&self, total: u64) {
        self.backpressure_events.store(total, Ordering::Relaxed);
    }

    /// Get snapshot of current metrics
    pub fn snapshot(&self) -> PublicationMetricsSnapshot {
        PublicationMetricsSnapshot {
            publication_height: self.publication_height.load(Ordering::Relaxed),
            publication_queue_size: self.publication_queue_size.load(Ordering::Relaxed),
            block_interval_ms: self.publication_block_interval_ms.load(Ordering::Relaxed),
            collect_block_time_ms: self.collect_block_time_ms.load(Ordering::Relaxed),
            publish_block_time_ms: self.publish_block_time_ms.load(Ordering::Relaxed),
            num_trades: self.num_trades.load(Ordering::Relaxed),
            num_orders: self.num_orders.load(Ordering::Relaxed),
            num_order_books: self.num_order_books.load(Ordering::Relaxed),
            num_accounts: self.num_accounts.load(Ordering::Relaxed),
            published: std::array::from_fn(|i| self.published[i].load(Ordering::Relaxed)),
            encoded: std::array::from_fn(|i| self.encoded[i].load(Ordering::Relaxed)),
            encode_kind_time_ms: std::array::from_fn(|i| {
                self.encode_kind_time_ms[i].load(Ordering::Relaxed)
            }),
            publish_failures: self.publish_failures.load(Ordering::Relaxed),
            backpressure_events: self.backpressure_events.load(Ordering::Relaxed),
        }
    }
}

/// Immutable snapshot of metrics (for reporting)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicationMetricsSnapshot {
    pub publication_height: i64,
    pub publication_queue_size: i64,
    pub block_interval_ms: i64,
    pub collect_block_time_ms: i64,
    pub publish_block_time_ms: i64,
    pub num_trades: i64,
    pub num_orders: i64,
    pub num_order_books: i64,
    pub num_accounts: i64,
    pub published: [u64; KIND_COUNT],
    pub encoded: [u64; KIND_COUNT],
    pub encode_kind_time_ms: [i64; KIND_COUNT],
    pub publish_failures: u64,
    pub backpressure_events: u64,
}

impl PublicationMetricsSnapshot {
    pub fn published_of(&self, kind: MsgKind) -> u64 {
        self.published[kind.index()]
    }

    pub fn encoded_of(&self, kind: MsgKind) -> u64 {
        self.encoded[kind.index()]
    }
}

impl fmt::Display for PublicationMetricsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Publication Stats: height={}, queue={}, interval={}ms, collect={}ms, publish={}ms, \
             published(exec={}, books={}, accounts={}, fee={}), failures={}, backpressure={}",
            self.publication_height,
            self.publication_queue_size,
            self.block_interval_ms,
            self.collect_block_time_ms,
            self.publish_block_time_ms,
            self.published_of(MsgKind::ExecutionResults),
            self.published_of(MsgKind::Books),
            self.published_of(MsgKind::Accounts),
            self.published_of(MsgKind::BlockFee),
            self.publish_failures,
            self.backpressure_events
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_updates() {
        let m = PublicationMetrics::new();
        m.set_publication_height(42);
        m.set_queue_size(3);
        m.incr_published(MsgKind::Books);
        m.incr_published(MsgKind::Books);
        m.incr_published(MsgKind::BlockFee);
        m.incr_publish_failures();
        m.set_publish_kind_time_ms(MsgKind::Accounts, 12);
        m.record_encode(MsgKind::Books, Duration::from_millis(3));
        m.record_encode(MsgKind::Books, Duration::from_millis(5));

        let snap = m.snapshot();
        assert_eq!(snap.publication_height, 42);
        assert_eq!(snap.publication_queue_size, 3);
        assert_eq!(snap.published_of(MsgKind::Books), 2);
        assert_eq!(snap.published_of(MsgKind::BlockFee), 1);
        assert_eq!(snap.published_of(MsgKind::ExecutionResults), 0);
        assert_eq!(snap.publish_failures, 1);
        assert_eq!(
            m.publish_kind_time_ms[MsgKind::Accounts.index()].load(Ordering::Relaxed),
            12
        );
        assert_eq!(snap.encoded_of(MsgKind::Books), 2);
        assert_eq!(snap.encoded_of(MsgKind::Accounts), 0);
        assert_eq!(snap.encode_kind_time_ms[MsgKind::Books.index()], 5);
        assert!(snap.to_string().contains("height=42"));
    }
}
