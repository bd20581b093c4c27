//! Fan-out sink

use std::sync::Arc;

use super::{MarketDataSink, SinkError};
use crate::core_types::{Height, TimestampMs};
use crate::messages::{MarketDataMessage, MsgKind};
use crate::metrics::PublicationMetrics;

/// Forwards every call to each inner sink, in order.
///
/// A failing sink does not keep the others from receiving the message.
/// Once all sinks have been tried, a fail-fast error wins over any other;
/// otherwise the first error is returned.
pub struct AggregatedSink {
    sinks: Vec<Box<dyn MarketDataSink>>,
}

impl AggregatedSink {
    pub fn new(sinks: Vec<Box<dyn MarketDataSink>>) -> Self {
        Self { sinks }
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl MarketDataSink for AggregatedSink {
    fn name(&self) -> &'static str {
        "aggregated"
    }

    fn publish(
        &mut self,
        msg: &MarketDataMessage,
        kind: MsgKind,
        height: Height,
        timestamp: TimestampMs,
    ) -> Result<(), SinkError> {
        let mut first_err: Option<SinkError> = None;
        for sink in self.sinks.iter_mut() {
            if let Err(e) = sink.publish(msg, kind, height, timestamp) {
                tracing::warn!(sink = sink.name(), kind = %kind, height, error = %e, "Sink publish failed");
                let escalates = matches!(e, SinkError::FailFast(_))
                    && !matches!(first_err, Some(SinkError::FailFast(_)));
                if first_err.is_none() || escalates {
                    first_err = Some(e);
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn stop(&mut self) {
        for sink in self.sinks.iter_mut() {
            sink.stop();
        }
    }

    fn attach_metrics(&mut self, metrics: Arc<PublicationMetrics>) {
        for sink in self.sinks.iter_mut() {
            sink.attach_metrics(metrics.clone());
        }
    }
}
