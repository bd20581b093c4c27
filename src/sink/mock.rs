//! In-memory sink for tests
//!
//! Clones share state, so a test keeps one handle and hands another to
//! the pipeline.

use std::sync::{Arc, Mutex, MutexGuard};

use super::{MarketDataSink, SinkError};
use crate::core_types::{Height, TimestampMs};
use crate::messages::{MarketDataMessage, MsgKind};

#[derive(Debug, Default)]
struct MockState {
    by_kind: [Vec<MarketDataMessage>; MsgKind::ALL.len()],
    /// Call sequence across all kinds
    calls: Vec<(MsgKind, Height)>,
    total: u64,
    stop_count: usize,
    stopped: bool,
    failing: Vec<MsgKind>,
    fail_fast: bool,
}

#[derive(Debug, Clone, Default)]
pub struct MockSink {
    state: Arc<Mutex<MockState>>,
}

impl MockSink {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        // a panicking test thread must not hide what was recorded
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn messages(&self, kind: MsgKind) -> Vec<MarketDataMessage> {
        self.state().by_kind[kind.index()].clone()
    }

    pub fn calls(&self) -> Vec<(MsgKind, Height)> {
        self.state().calls.clone()
    }

    /// Messages accepted since creation (not reset by `stop`)
    pub fn total(&self) -> u64 {
        self.state().total
    }

    /// Effective stops; repeated calls after the first are no-ops
    pub fn stop_count(&self) -> usize {
        self.state().stop_count
    }

    /// Reject every later message of `kind` with a transport error
    pub fn fail_kind(&self, kind: MsgKind) {
        self.state().failing.push(kind);
    }

    /// Turn injected failures into fail-fast errors
    pub fn set_fail_fast(&self, fail_fast: bool) {
        self.state().fail_fast = fail_fast;
    }
}

impl MarketDataSink for MockSink {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn publish(
        &mut self,
        msg: &MarketDataMessage,
        kind: MsgKind,
        height: Height,
        _timestamp: TimestampMs,
    ) -> Result<(), SinkError> {
        let mut state = self.state();
        if state.failing.contains(&kind) {
            let reason = format!("injected failure for {}", kind);
            return Err(if state.fail_fast {
                SinkError::FailFast(reason)
            } else {
                SinkError::Transport(reason)
            });
        }
        state.by_kind[kind.index()].push(msg.clone());
        state.calls.push((kind, height));
        state.total += 1;
        Ok(())
    }

    fn stop(&mut self) {
        let mut state = self.state();
        if state.stopped {
            return;
        }
        state.stopped = true;
        for list in state.by_kind.iter_mut() {
            list.clear();
        }
        state.calls.clear();
        state.stop_count += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::BlockFee;

    fn fee(height: Height) -> MarketDataMessage {
        MarketDataMessage::BlockFee(BlockFee::new(height, "BNB:1", vec!["v".to_string()]))
    }

    #[test]
    fn test_clones_share_state_and_stop_clears() {
        let observer = MockSink::new();
        let mut sink = observer.clone();

        sink.publish(&fee(1), MsgKind::BlockFee, 1, 0).unwrap();
        sink.publish(&fee(2), MsgKind::BlockFee, 2, 0).unwrap();
        assert_eq!(observer.messages(MsgKind::BlockFee).len(), 2);
        assert_eq!(observer.calls(), vec![(MsgKind::BlockFee, 1), (MsgKind::BlockFee, 2)]);

        sink.stop();
        assert!(observer.messages(MsgKind::BlockFee).is_empty());
        assert_eq!(observer.total(), 2);
        assert_eq!(observer.stop_count(), 1);
    }

    #[test]
    fn test_second_stop_is_a_no_op() {
        let observer = MockSink::new();
        let mut sink = observer.clone();
        sink.publish(&fee(1), MsgKind::BlockFee, 1, 0).unwrap();

        sink.stop();
        let after_first = (observer.total(), observer.stop_count(), observer.calls());
        sink.stop();
        assert_eq!((observer.total(), observer.stop_count(), observer.calls()), after_first);
        assert_eq!(observer.stop_count(), 1);
    }

    #[test]
    fn test_injected_failures() {
        let mut sink = MockSink::new();
        sink.fail_kind(MsgKind::BlockFee);
        assert!(matches!(
            sink.publish(&fee(1), MsgKind::BlockFee, 1, 0),
            Err(SinkError::Transport(_))
        ));
        sink.set_fail_fast(true);
        assert!(matches!(
            sink.publish(&fee(1), MsgKind::BlockFee, 1, 0),
            Err(SinkError::FailFast(_))
        ));
        assert_eq!(sink.total(), 0);
    }
}
