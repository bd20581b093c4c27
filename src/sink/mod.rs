//! Sinks - where dispatched messages go
//!
//! | Sink                | Target                                    |
//! |---------------------|-------------------------------------------|
//! | [`kafka::KafkaSink`] | one bus topic per message family         |
//! | [`local::LocalSink`] | rotating JSON-lines file                 |
//! | [`mock::MockSink`]   | in-memory lists (tests)                  |
//! | [`aggregated::AggregatedSink`] | fan-out to several sinks       |
//!
//! Every sink is driven from the dispatch thread only, so `publish` takes
//! `&mut self` and implementations need `Send` but not `Sync`.

pub mod aggregated;
pub mod kafka;
pub mod local;
pub mod mock;

use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;

use crate::config::PublicationConfig;
use crate::core_types::{Height, TimestampMs};
use crate::encoder::EncodeError;
use crate::messages::{MarketDataMessage, MsgKind};
use crate::metrics::PublicationMetrics;

pub use aggregated::AggregatedSink;
pub use kafka::KafkaSink;
pub use local::LocalSink;
pub use mock::MockSink;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("sink setup failed: {0}")]
    Setup(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Encode(#[from] EncodeError),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("{kind} at height {height} not delivered after {attempts} attempts")]
    Exhausted {
        kind: MsgKind,
        height: Height,
        attempts: u32,
    },
    /// Delivery failure that must stop further dispatching
    #[error("fail-fast: {0}")]
    FailFast(String),
    #[error("sink {0} already stopped")]
    Stopped(&'static str),
}

pub trait MarketDataSink: Send {
    fn name(&self) -> &'static str;

    /// Deliver one message. Called in dispatch order.
    fn publish(
        &mut self,
        msg: &MarketDataMessage,
        kind: MsgKind,
        height: Height,
        timestamp: TimestampMs,
    ) -> Result<(), SinkError>;

    /// Flush and release resources. Idempotent.
    fn stop(&mut self);

    /// Where to record encode timings. Sinks that do not encode ignore it.
    fn attach_metrics(&mut self, _metrics: Arc<PublicationMetrics>) {}
}

/// Run an encode step under the per-kind encode timer
pub(crate) fn timed_encode<T>(
    metrics: Option<&PublicationMetrics>,
    kind: MsgKind,
    encode: impl FnOnce() -> T,
) -> T {
    let start = Instant::now();
    let out = encode();
    if let Some(m) = metrics {
        m.record_encode(kind, start.elapsed());
    }
    out
}

/// Build the sink(s) enabled in `config`
///
/// Both bus and file enabled gives a fan-out with the bus first.
pub fn build_sink(config: &PublicationConfig) -> Result<Box<dyn MarketDataSink>, SinkError> {
    let mut sinks: Vec<Box<dyn MarketDataSink>> = Vec::new();
    if config.publish_kafka {
        sinks.push(Box::new(KafkaSink::connect(config)?));
    }
    if config.publish_local {
        sinks.push(Box::new(LocalSink::open(&config.local)?));
    }

    match sinks.len() {
        0 => Err(SinkError::Setup(
            "neither publish_kafka nor publish_local is enabled".to_string(),
        )),
        1 => Ok(sinks.remove(0)),
        _ => Ok(Box::new(AggregatedSink::new(sinks))),
    }
}
