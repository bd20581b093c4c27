//! Pipeline - block hand-off between the execution thread and the dispatcher
//!
//! # Architecture
//!
//! ```text
//!  Execution thread                                   Dispatch thread
//! ┌──────────────────────┐   publication_queue    ┌──────────────────────┐
//! │ settle + correlate   │ ─────────────────────▶ │ collect orders       │
//! │ assemble snapshot    │   (BlockInfoToPublish) │ publish per kind     │──▶ sink(s)
//! └──────────▲───────────┘                        └──────────┬───────────┘
//!            │                                               │
//!            │             removal_queue (OrderRemoval)      │
//!            └───────────────────────────────────────────────┘
//!              drained by the owner of the order tracking map
//! ```
//!
//! # Key Design
//!
//! - **SPSC**: each queue has exactly one writer and one reader
//! - **Lock-free**: ring buffers (crossbeam-queue::ArrayQueue), no mutexes
//! - **Backpressure**: the producer waits when the queue is full, consensus
//!   stalls instead of market data being dropped
//! - **Close = shutdown**: closing a queue lets its consumer drain and exit

use crossbeam_queue::ArrayQueue;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::config::PublicationConfig;
use crate::core_types::{Height, TimestampMs};
use crate::dispatch::Dispatcher;
use crate::fee_correlator::CorrelationError;
use crate::metrics::{PublicationMetrics, PublicationMetricsSnapshot};
use crate::order_tracking::OrderRemoval;
use crate::sink::MarketDataSink;
use crate::snapshot::{BlockInfoToPublish, BlockSnapshotAssembler, SettlementOutputs, SnapshotError};

// ============================================================
// QUEUE CAPACITY CONFIGURATION
// ============================================================

/// Capacity for the publication queue (execution → dispatcher)
/// A handful of blocks; a slow sink stalls consensus beyond that
pub const PUBLICATION_QUEUE_CAPACITY: usize = 16;

/// Capacity for the order removal queue (dispatcher → order tracking owner)
pub const REMOVAL_QUEUE_CAPACITY: usize = 65536;

const IDLE_SPIN_LIMIT: u32 = 1000;
const IDLE_SLEEP_US: Duration = Duration::from_micros(100);

// ============================================================
// HAND-OFF QUEUE
// ============================================================

/// Bounded FIFO hand-off with blocking push/recv and close semantics
///
/// Producer: exactly one thread. Consumer: exactly one thread.
pub struct HandoffQueue<T> {
    queue: ArrayQueue<T>,
    closed: AtomicBool,
    backpressure_events: AtomicU64,
}

impl<T> HandoffQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity.max(1)),
            closed: AtomicBool::new(false),
            backpressure_events: AtomicU64::new(0),
        }
    }

    /// Push, waiting while the queue is full.
    ///
    /// Returns the item back if the queue is (or becomes) closed.
    pub fn push(&self, item: T) -> Result<(), T> {
        let mut item = item;
        let mut spin_count = 0u32;
        let mut waited = false;
        loop {
            if self.is_closed() {
                return Err(item);
            }
            match self.queue.push(item) {
                Ok(()) => return Ok(()),
                Err(returned) => {
                    item = returned;
                    if !waited {
                        waited = true;
                        let count = self.backpressure_events.fetch_add(1, Ordering::Relaxed);
                        if count % 1000 == 0 {
                            tracing::warn!(total_backpressure = count + 1, "Hand-off queue full, producer waiting");
                        }
                    }
                    idle(&mut spin_count);
                }
            }
        }
    }

    /// Non-blocking pop
    #[inline]
    pub fn try_pop(&self) -> Option<T> {
        self.queue.pop()
    }

    /// Wait for the next item.
    ///
    /// Returns `None` once the queue is closed and fully drained.
    pub fn recv(&self) -> Option<T> {
        let mut spin_count = 0u32;
        loop {
            if let Some(item) = self.queue.pop() {
                return Some(item);
            }
            if self.is_closed() {
                // items pushed right before close
                return self.queue.pop();
            }
            idle(&mut spin_count);
        }
    }

    /// Close the queue. Pending items stay poppable.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    pub fn backpressure_events(&self) -> u64 {
        self.backpressure_events.load(Ordering::Relaxed)
    }
}

#[inline]
fn idle(spin_count: &mut u32) {
    *spin_count += 1;
    if *spin_count > IDLE_SPIN_LIMIT {
        thread::sleep(IDLE_SLEEP_US);
        *spin_count = 0;
    } else {
        std::hint::spin_loop();
    }
}

// ============================================================
// PIPELINE CONTEXT
// ============================================================

/// Everything the publication components share
///
/// Constructed once per pipeline instance and passed explicitly; nothing
/// is process-global, so several pipelines can coexist (tests).
pub struct PipelineContext {
    pub config: PublicationConfig,
    pub metrics: Arc<PublicationMetrics>,
    /// Producer: execution thread. Consumer: dispatcher.
    pub publication_queue: HandoffQueue<BlockInfoToPublish>,
    /// Producer: dispatcher. Consumer: order tracking owner.
    pub removal_queue: Arc<HandoffQueue<OrderRemoval>>,
    live: AtomicBool,
}

impl PipelineContext {
    pub fn new(config: PublicationConfig) -> Self {
        let publication_queue = HandoffQueue::new(config.queue_capacity);
        let removal_queue = Arc::new(HandoffQueue::new(config.removal_queue_capacity));
        Self {
            config,
            metrics: Arc::new(PublicationMetrics::new()),
            publication_queue,
            removal_queue,
            live: AtomicBool::new(false),
        }
    }

    /// Whether snapshots are currently being accepted
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    pub fn set_live(&self, live: bool) {
        self.live.store(live, Ordering::SeqCst);
    }
}

// ============================================================
// PIPELINE ERRORS
// ============================================================

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("pipeline setup failed: {0}")]
    Setup(String),
    #[error("publication queue closed, snapshot for height {0} dropped")]
    QueueClosed(Height),
    #[error("pipeline is not live")]
    NotLive,
    #[error(transparent)]
    Correlation(#[from] CorrelationError),
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
    #[error("dispatch thread panicked")]
    DispatchPanicked,
}

// ============================================================
// PIPELINE LIFECYCLE
// ============================================================

/// Publication pipeline owned by the execution thread
///
/// ```ignore
/// let mut pipeline = MarketDataPipeline::start(config, sink)?;
/// // once per committed block:
/// pipeline.assemble_and_enqueue(height, timestamp_ms, outputs)?;
/// // on shutdown:
/// pipeline.stop()?;
/// ```
pub struct MarketDataPipeline {
    ctx: Arc<PipelineContext>,
    assembler: BlockSnapshotAssembler,
    dispatch_handle: Option<JoinHandle<()>>,
}

impl MarketDataPipeline {
    /// Spawn the dispatch thread and mark the pipeline live.
    pub fn start(
        config: PublicationConfig,
        sink: Box<dyn MarketDataSink>,
    ) -> Result<Self, PipelineError> {
        if config.queue_capacity == 0 {
            return Err(PipelineError::Setup("queue_capacity must be > 0".to_string()));
        }
        if config.removal_queue_capacity == 0 {
            return Err(PipelineError::Setup(
                "removal_queue_capacity must be > 0".to_string(),
            ));
        }
        if config.fee_channel_capacity == 0 {
            return Err(PipelineError::Setup(
                "fee_channel_capacity must be > 0".to_string(),
            ));
        }

        let ctx = Arc::new(PipelineContext::new(config));
        let sink_name = sink.name();
        let dispatcher = Dispatcher::new(ctx.clone(), sink);
        let dispatch_handle = thread::Builder::new()
            .name("marketdata-dispatch".to_string())
            .spawn(move || dispatcher.run())
            .map_err(|e| PipelineError::Setup(format!("spawn dispatch thread: {}", e)))?;

        ctx.set_live(true);
        tracing::info!(
            queue_capacity = ctx.config.queue_capacity,
            sink = sink_name,
            "Market data pipeline started"
        );

        Ok(Self {
            ctx,
            assembler: BlockSnapshotAssembler::new(),
            dispatch_handle: Some(dispatch_handle),
        })
    }

    /// Producer interface: called exactly once per committed block.
    ///
    /// Blocks while the publication queue is full.
    pub fn assemble_and_enqueue(
        &mut self,
        height: Height,
        timestamp: TimestampMs,
        outputs: SettlementOutputs,
    ) -> Result<(), PipelineError> {
        if !self.ctx.is_live() {
            return Err(PipelineError::NotLive);
        }
        if height < self.ctx.config.from_height_inclusive {
            tracing::debug!(height, "Below from_height_inclusive, snapshot skipped");
            return Ok(());
        }

        let metrics = &self.ctx.metrics;
        if let Some(last) = self.assembler.last_timestamp() {
            metrics.set_block_interval_ms(timestamp.saturating_sub(last));
        }

        let start = Instant::now();
        let snapshot = self.assembler.assemble(height, timestamp, outputs)?;
        metrics.set_collect_time_ms(start.elapsed().as_millis() as i64);

        tracing::info!(
            height,
            timestamp,
            num_of_trades = snapshot.trades.len(),
            num_of_order_changes = snapshot.order_changes.len(),
            num_of_accounts = snapshot.accounts.len(),
            "Enqueue block for publication"
        );

        let queue = &self.ctx.publication_queue;
        queue
            .push(snapshot)
            .map_err(|_| PipelineError::QueueClosed(height))?;
        metrics.set_queue_size(queue.len() as i64);
        metrics.set_backpressure_events(queue.backpressure_events());
        Ok(())
    }

    /// Queue drained by the owner of the order tracking map
    pub fn removal_queue(&self) -> Arc<HandoffQueue<OrderRemoval>> {
        self.ctx.removal_queue.clone()
    }

    pub fn context(&self) -> &Arc<PipelineContext> {
        &self.ctx
    }

    pub fn is_live(&self) -> bool {
        self.ctx.is_live()
    }

    pub fn metrics(&self) -> PublicationMetricsSnapshot {
        self.ctx.metrics.snapshot()
    }

    /// Close the publication queue, wait for the dispatcher to drain it and
    /// stop the sinks. Idempotent.
    pub fn stop(&mut self) -> Result<(), PipelineError> {
        let Some(handle) = self.dispatch_handle.take() else {
            return Ok(());
        };
        self.ctx.set_live(false);
        self.ctx.publication_queue.close();
        let joined = handle.join();
        self.ctx.removal_queue.close();
        tracing::info!(metrics = %self.ctx.metrics.snapshot(), "Market data pipeline stopped");
        joined.map_err(|_| PipelineError::DispatchPanicked)
    }
}

impl Drop for MarketDataPipeline {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            tracing::error!(error = %e, "Market data pipeline stopped with error");
        }
    }
}

// ============================================================
// TESTS
// ============================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::MsgKind;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_handoff_queue_fifo() {
        let q = HandoffQueue::new(4);
        q.push(1).unwrap();
        q.push(2).unwrap();
        q.push(3).unwrap();
        assert_eq!(q.len(), 3);
        assert_eq!(q.recv(), Some(1));
        assert_eq!(q.recv(), Some(2));
        assert_eq!(q.try_pop(), Some(3));
        assert!(q.is_empty());
    }

    #[test]
    fn test_handoff_queue_close_drains_then_ends() {
        let q = HandoffQueue::new(4);
        q.push("a").unwrap();
        q.push("b").unwrap();
        q.close();
        assert_eq!(q.push("c"), Err("c"));
        assert_eq!(q.recv(), Some("a"));
        assert_eq!(q.recv(), Some("b"));
        assert_eq!(q.recv(), None);
    }

    #[test]
    fn test_handoff_queue_backpressure_blocks_producer() {
        let q = Arc::new(HandoffQueue::new(1));
        let consumed = Arc::new(AtomicUsize::new(0));

        q.push(0u64).unwrap();
        let consumer_q = q.clone();
        let consumer_count = consumed.clone();
        let consumer = thread::spawn(move || {
            // let the producer hit the full queue first
            thread::sleep(Duration::from_millis(20));
            let mut seen = Vec::new();
            while let Some(v) = consumer_q.recv() {
                seen.push(v);
                consumer_count.fetch_add(1, Ordering::SeqCst);
            }
            seen
        });

        for i in 1..=50u64 {
            q.push(i).unwrap();
        }
        q.close();

        let seen = consumer.join().unwrap();
        assert_eq!(seen, (0..=50).collect::<Vec<_>>());
        assert_eq!(consumed.load(Ordering::SeqCst), 51);
        assert!(q.backpressure_events() >= 1);
    }

    #[test]
    fn test_zero_capacity_is_rejected_at_start() {
        let config = PublicationConfig {
            queue_capacity: 0,
            ..Default::default()
        };
        let sink = Box::new(crate::sink::mock::MockSink::new());
        assert!(matches!(
            MarketDataPipeline::start(config, sink),
            Err(PipelineError::Setup(_))
        ));
    }

    struct PanickingSink;

    impl MarketDataSink for PanickingSink {
        fn name(&self) -> &'static str {
            "panicking"
        }

        fn publish(
            &mut self,
            _msg: &crate::messages::MarketDataMessage,
            _kind: crate::messages::MsgKind,
            height: Height,
            _timestamp: TimestampMs,
        ) -> Result<(), crate::sink::SinkError> {
            panic!("sink failed at height {}", height);
        }

        fn stop(&mut self) {}
    }

    #[test]
    fn test_dispatch_panic_takes_pipeline_offline() {
        let config = PublicationConfig {
            queue_capacity: 2,
            ..Default::default()
        };
        let mut pipeline = MarketDataPipeline::start(config, Box::new(PanickingSink)).unwrap();

        // the producer must see an error instead of blocking on a full queue
        let producer = thread::spawn(move || {
            let mut outcomes = Vec::new();
            for height in 1..=20 {
                let r = pipeline.assemble_and_enqueue(height, height * 1000, SettlementOutputs::default());
                let failed = r.is_err();
                outcomes.push(r);
                if failed {
                    break;
                }
            }
            (pipeline, outcomes)
        });

        let deadline = Instant::now() + Duration::from_secs(5);
        while !producer.is_finished() {
            assert!(Instant::now() < deadline, "producer blocked after dispatch panic");
            thread::sleep(Duration::from_millis(5));
        }
        let (mut pipeline, outcomes) = producer.join().unwrap();

        assert!(matches!(
            outcomes.last(),
            Some(Err(PipelineError::NotLive | PipelineError::QueueClosed(_)))
        ));
        assert!(!pipeline.is_live());
        assert!(pipeline.context().publication_queue.is_closed());
        assert!(matches!(pipeline.stop(), Err(PipelineError::DispatchPanicked)));
        assert!(pipeline.stop().is_ok());
    }

    #[test]
    fn test_sink_encode_is_recorded_in_pipeline_metrics() {
        let dir = tempfile::tempdir().unwrap();
        let local = crate::config::LocalSinkConfig {
            data_dir: dir.path().to_string_lossy().to_string(),
            ..Default::default()
        };
        let sink = crate::sink::LocalSink::open(&local).unwrap();
        let mut pipeline =
            MarketDataPipeline::start(PublicationConfig::default(), Box::new(sink)).unwrap();
        pipeline
            .assemble_and_enqueue(3, 3000, SettlementOutputs::default())
            .unwrap();
        pipeline.stop().unwrap();

        let snap = pipeline.metrics();
        assert_eq!(snap.publication_height, 3);
        for kind in [MsgKind::ExecutionResults, MsgKind::Accounts, MsgKind::Books] {
            assert_eq!(snap.encoded_of(kind), 1, "{}", kind);
        }
        // empty block fee is not published
        assert_eq!(snap.encoded_of(MsgKind::BlockFee), 0);
    }

    #[test]
    fn test_zero_fee_channel_capacity_is_rejected_at_start() {
        let config = PublicationConfig {
            fee_channel_capacity: 0,
            ..Default::default()
        };
        let sink = Box::new(crate::sink::mock::MockSink::new());
        assert!(matches!(
            MarketDataPipeline::start(config, sink),
            Err(PipelineError::Setup(_))
        ));
    }

    #[test]
    fn test_stop_is_idempotent_and_rejects_new_blocks() {
        let sink = crate::sink::mock::MockSink::new();
        let mut pipeline =
            MarketDataPipeline::start(PublicationConfig::default(), Box::new(sink.clone())).unwrap();
        assert!(pipeline.is_live());

        pipeline.stop().unwrap();
        pipeline.stop().unwrap();
        assert!(!pipeline.is_live());
        assert!(pipeline.removal_queue().is_closed());

        let err = pipeline
            .assemble_and_enqueue(1, 1000, SettlementOutputs::default())
            .unwrap_err();
        assert!(matches!(err, PipelineError::NotLive));
        assert_eq!(sink.stop_count(), 1);
    }
}
