//! Fee Correlator - resolves two-sided settlement fees into trades
//!
//! The settlement engine runs synchronously on the calling thread and emits
//! one [`TransferFeeEvent`] per settled transfer leg. Events are routed into
//! two bounded hand-off queues, each drained by its own short-lived worker:
//!
//! ```text
//!                       ┌──────────────┐  trade_queue   ┌────────────────────┐
//!  settle(collector) ──▶│  collector   │ ─────────────▶ │ trade aggregation  │──▶ Vec<Trade>
//!  (caller thread)      │  (routing)   │  expire_queue  ├────────────────────┤
//!                       └──────────────┘ ─────────────▶ │ expiry aggregation │──▶ Vec<OrderChange>
//!                                                       └────────────────────┘
//!                        close both queues, join both workers (completion barrier)
//! ```
//!
//! Each worker is the only mutator of its accumulator, so no lock is held
//! while settlement is still producing. The split is not needed for
//! correctness when the settlement callback is single-threaded; it keeps
//! aggregation off the settlement thread.

use rustc_hash::FxHashMap;
use std::thread;
use thiserror::Error;

use crate::config::PublicationConfig;
use crate::core_types::{Address, Asset, FeeAmount, Height, OrderId, Symbol};
use crate::models::{
    ChangeType, ExpireFeeHolder, OrderChange, Side, Trade, TradeFeeHolder, TradeRef,
    TransferFeeEvent,
};
use crate::pipeline::HandoffQueue;

/// Capacity of each fee hand-off queue
pub const FEE_CHANNEL_CAPACITY: usize = 4096;

/// Fee side not yet observed. Distinct from 0, which is a valid fee.
const UNRESOLVED_FEE: FeeAmount = -1;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CorrelationError {
    #[error("fee event for order {order_id} matches neither side of trade {buy_order_id}/{sell_order_id}")]
    UnknownOrder {
        order_id: OrderId,
        buy_order_id: OrderId,
        sell_order_id: OrderId,
    },
    #[error("duplicate fee for order {order_id} on trade {buy_order_id}/{sell_order_id}")]
    DuplicateFeeSide {
        order_id: OrderId,
        buy_order_id: OrderId,
        sell_order_id: OrderId,
    },
    #[error("negative fee {amount} for order {order_id}")]
    NegativeFee { order_id: OrderId, amount: FeeAmount },
    #[error("order {order_id}: {reason} is not an expiry reason")]
    InvalidExpiryReason { order_id: OrderId, reason: ChangeType },
    #[error("trade fee event for order {0} during an expiry-only sweep")]
    UnexpectedTradeEvent(OrderId),
    #[error("{0} aggregation worker panicked")]
    WorkerPanicked(&'static str),
}

/// Result of one correlation pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CorrelationOutput {
    /// Fully-resolved trades in finalize order
    pub trades: Vec<Trade>,
    /// Expiry annotations in arrival order
    pub expiry_changes: Vec<OrderChange>,
    /// Trades that saw only one fee side (never emitted)
    pub unresolved: usize,
}

// ============================================================
// COLLECTOR (settlement-facing callback)
// ============================================================

/// Handed to the settlement engine; routes every fee event
pub struct FeeEventCollector<'a> {
    trade_queue: &'a HandoffQueue<TradeFeeHolder>,
    expire_queue: &'a HandoffQueue<ExpireFeeHolder>,
    accept_trades: bool,
    emitted: u64,
    rejected: Option<CorrelationError>,
}

impl FeeEventCollector<'_> {
    pub fn emit(&mut self, event: TransferFeeEvent) {
        match event {
            TransferFeeEvent::Trade(holder) => self.emit_trade(holder),
            TransferFeeEvent::Expire(holder) => self.emit_expire(holder),
        }
    }

    pub fn emit_trade(&mut self, holder: TradeFeeHolder) {
        if !self.accept_trades {
            tracing::error!(order_id = %holder.order_id, "Trade fee event during expiry sweep");
            if self.rejected.is_none() {
                self.rejected = Some(CorrelationError::UnexpectedTradeEvent(holder.order_id));
            }
            return;
        }
        self.emitted += 1;
        if let Err(holder) = self.trade_queue.push(holder) {
            tracing::error!(order_id = %holder.order_id, "Trade fee queue closed, event dropped");
        }
    }

    pub fn emit_expire(&mut self, holder: ExpireFeeHolder) {
        self.emitted += 1;
        if let Err(holder) = self.expire_queue.push(holder) {
            tracing::error!(order_id = %holder.order_id, "Expire fee queue closed, event dropped");
        }
    }

    /// Events routed so far
    pub fn emitted(&self) -> u64 {
        self.emitted
    }
}

/// Closes both queues when the settlement closure returns or unwinds,
/// so the workers can always finish.
struct CloseOnDrop<'a> {
    trade_queue: &'a HandoffQueue<TradeFeeHolder>,
    expire_queue: &'a HandoffQueue<ExpireFeeHolder>,
}

impl Drop for CloseOnDrop<'_> {
    fn drop(&mut self) {
        self.trade_queue.close();
        self.expire_queue.close();
    }
}

// ============================================================
// FEE CORRELATOR
// ============================================================

pub struct FeeCorrelator {
    channel_capacity: usize,
}

impl FeeCorrelator {
    pub fn new(channel_capacity: usize) -> Self {
        Self { channel_capacity }
    }

    /// Queue sizing from `fee_channel_capacity`
    pub fn from_config(config: &PublicationConfig) -> Self {
        Self::new(config.fee_channel_capacity)
    }

    pub fn channel_capacity(&self) -> usize {
        self.channel_capacity
    }

    /// Block match pass: trades and IOC expiries.
    pub fn correlate<F>(&self, height: Height, settle: F) -> Result<CorrelationOutput, CorrelationError>
    where
        F: FnOnce(&mut FeeEventCollector<'_>),
    {
        self.run(height, true, settle)
    }

    /// Breathe-block expiry sweep or delisting: expiries only.
    pub fn correlate_expiries<F>(
        &self,
        height: Height,
        sweep: F,
    ) -> Result<Vec<OrderChange>, CorrelationError>
    where
        F: FnOnce(&mut FeeEventCollector<'_>),
    {
        self.run(height, false, sweep).map(|out| out.expiry_changes)
    }

    fn run<F>(
        &self,
        height: Height,
        accept_trades: bool,
        settle: F,
    ) -> Result<CorrelationOutput, CorrelationError>
    where
        F: FnOnce(&mut FeeEventCollector<'_>),
    {
        let trade_queue = HandoffQueue::new(self.channel_capacity);
        let expire_queue = HandoffQueue::new(self.channel_capacity);

        let (collector_result, trades_result, expiries_result) = thread::scope(|s| {
            let trade_worker = s.spawn(|| {
                let mut agg = TradeAggregator::new(height);
                agg.drain(&trade_queue);
                agg.finish()
            });
            let expire_worker = s.spawn(|| {
                let mut agg = ExpiryAggregator::default();
                agg.drain(&expire_queue);
                agg.finish()
            });

            let collector_result = {
                let _close = CloseOnDrop {
                    trade_queue: &trade_queue,
                    expire_queue: &expire_queue,
                };
                let mut collector = FeeEventCollector {
                    trade_queue: &trade_queue,
                    expire_queue: &expire_queue,
                    accept_trades,
                    emitted: 0,
                    rejected: None,
                };
                settle(&mut collector);
                tracing::debug!(height, emitted = collector.emitted, "Settlement fee events emitted");
                match collector.rejected {
                    Some(e) => Err(e),
                    None => Ok(()),
                }
            };

            let trades = trade_worker
                .join()
                .map_err(|_| CorrelationError::WorkerPanicked("trade"));
            let expiries = expire_worker
                .join()
                .map_err(|_| CorrelationError::WorkerPanicked("expiry"));
            (collector_result, trades, expiries)
        });

        collector_result?;
        let (trades, unresolved) = trades_result??;
        let expiry_changes = expiries_result??;

        if unresolved > 0 {
            tracing::warn!(height, unresolved, "Trades with a single fee side were not emitted");
        }
        tracing::debug!(
            height,
            trades = trades.len(),
            expiries = expiry_changes.len(),
            "Fee correlation finished"
        );

        Ok(CorrelationOutput {
            trades,
            expiry_changes,
            unresolved,
        })
    }
}

impl Default for FeeCorrelator {
    fn default() -> Self {
        Self::new(FEE_CHANNEL_CAPACITY)
    }
}

// ============================================================
// TRADE AGGREGATION
// ============================================================

struct PendingTrade {
    trade: TradeRef,
    symbol: Symbol,
    buyer_fee: FeeAmount,
    buyer_fee_asset: Asset,
    buyer_addr: Address,
    seller_fee: FeeAmount,
    seller_fee_asset: Asset,
    seller_addr: Address,
}

impl PendingTrade {
    fn new(holder: &TradeFeeHolder) -> Self {
        Self {
            trade: holder.trade.clone(),
            symbol: holder.symbol.clone(),
            buyer_fee: UNRESOLVED_FEE,
            buyer_fee_asset: String::new(),
            buyer_addr: String::new(),
            seller_fee: UNRESOLVED_FEE,
            seller_fee_asset: String::new(),
            seller_addr: String::new(),
        }
    }

    fn is_resolved(&self) -> bool {
        self.buyer_fee != UNRESOLVED_FEE && self.seller_fee != UNRESOLVED_FEE
    }

    fn into_trade(self, id: String) -> Trade {
        Trade {
            id,
            symbol: self.symbol,
            price: self.trade.price,
            qty: self.trade.qty,
            sell_order_id: self.trade.sell_order_id,
            buy_order_id: self.trade.buy_order_id,
            seller_fee: self.seller_fee,
            buyer_fee: self.buyer_fee,
            seller_fee_asset: self.seller_fee_asset,
            buyer_fee_asset: self.buyer_fee_asset,
            seller_addr: self.seller_addr,
            buyer_addr: self.buyer_addr,
        }
    }
}

struct TradeAggregator {
    height: Height,
    next_seq: u64,
    pending: FxHashMap<(OrderId, OrderId), PendingTrade>,
    trades: Vec<Trade>,
    error: Option<CorrelationError>,
}

impl TradeAggregator {
    fn new(height: Height) -> Self {
        Self {
            height,
            next_seq: 0,
            pending: FxHashMap::default(),
            trades: Vec::new(),
            error: None,
        }
    }

    /// Consume until the queue is closed. After the first error events are
    /// still drained (the producer must never block on a dead consumer).
    fn drain(&mut self, queue: &HandoffQueue<TradeFeeHolder>) {
        while let Some(holder) = queue.recv() {
            if self.error.is_some() {
                continue;
            }
            if let Err(e) = self.apply(holder) {
                tracing::error!(height = self.height, error = %e, "Trade fee correlation failed");
                self.error = Some(e);
            }
        }
    }

    fn apply(&mut self, holder: TradeFeeHolder) -> Result<(), CorrelationError> {
        if holder.fee.amount < 0 {
            return Err(CorrelationError::NegativeFee {
                order_id: holder.order_id,
                amount: holder.fee.amount,
            });
        }

        let side = if holder.order_id == holder.trade.buy_order_id {
            Side::Buy
        } else if holder.order_id == holder.trade.sell_order_id {
            Side::Sell
        } else {
            return Err(CorrelationError::UnknownOrder {
                order_id: holder.order_id,
                buy_order_id: holder.trade.buy_order_id,
                sell_order_id: holder.trade.sell_order_id,
            });
        };

        let key = (
            holder.trade.buy_order_id.clone(),
            holder.trade.sell_order_id.clone(),
        );
        let pending = self
            .pending
            .entry(key.clone())
            .or_insert_with(|| PendingTrade::new(&holder));

        let slot = match side {
            Side::Buy => &mut pending.buyer_fee,
            Side::Sell => &mut pending.seller_fee,
        };
        if *slot != UNRESOLVED_FEE {
            return Err(CorrelationError::DuplicateFeeSide {
                order_id: holder.order_id,
                buy_order_id: key.0,
                sell_order_id: key.1,
            });
        }
        *slot = holder.fee.amount;
        match side {
            Side::Buy => {
                pending.buyer_fee_asset = holder.fee.asset;
                pending.buyer_addr = holder.owner;
            }
            Side::Sell => {
                pending.seller_fee_asset = holder.fee.asset;
                pending.seller_addr = holder.owner;
            }
        }

        if !pending.is_resolved() {
            return Ok(());
        }
        if let Some(done) = self.pending.remove(&key) {
            let id = Trade::make_id(self.height, self.next_seq);
            self.next_seq += 1;
            self.trades.push(done.into_trade(id));
        }
        Ok(())
    }

    fn finish(self) -> Result<(Vec<Trade>, usize), CorrelationError> {
        match self.error {
            Some(e) => Err(e),
            None => Ok((self.trades, self.pending.len())),
        }
    }
}

// ============================================================
// EXPIRY AGGREGATION
// ============================================================

#[derive(Default)]
struct ExpiryAggregator {
    changes: Vec<OrderChange>,
    error: Option<CorrelationError>,
}

impl ExpiryAggregator {
    fn drain(&mut self, queue: &HandoffQueue<ExpireFeeHolder>) {
        while let Some(holder) = queue.recv() {
            if self.error.is_some() {
                continue;
            }
            if let Err(e) = self.apply(holder) {
                tracing::error!(error = %e, "Expire fee correlation failed");
                self.error = Some(e);
            }
        }
    }

    fn apply(&mut self, holder: ExpireFeeHolder) -> Result<(), CorrelationError> {
        if !holder.reason.is_expiry() {
            return Err(CorrelationError::InvalidExpiryReason {
                order_id: holder.order_id,
                reason: holder.reason,
            });
        }
        if holder.fee.amount < 0 {
            return Err(CorrelationError::NegativeFee {
                order_id: holder.order_id,
                amount: holder.fee.amount,
            });
        }
        tracing::trace!(order_id = %holder.order_id, symbol = %holder.symbol, reason = %holder.reason, "Expire fee collected");
        self.changes
            .push(OrderChange::new(holder.order_id, holder.reason).with_fee(holder.fee));
        Ok(())
    }

    fn finish(self) -> Result<Vec<OrderChange>, CorrelationError> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(self.changes),
        }
    }
}

// ============================================================
// TESTS
// ============================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Fee;

    const SYMBOL: &str = "XYZ-000_BNB";

    fn leg(order_id: &str, buy: &str, sell: &str, qty: i64, fee: i64) -> TransferFeeEvent {
        TransferFeeEvent::Trade(TradeFeeHolder {
            order_id: order_id.to_string(),
            trade: TradeRef::new(buy, sell, 100_000_000, qty),
            symbol: SYMBOL.to_string(),
            owner: format!("addr-{}", order_id),
            fee: Fee::new(fee, "BNB"),
        })
    }

    fn expire(order_id: &str, reason: ChangeType, fee: i64) -> TransferFeeEvent {
        TransferFeeEvent::Expire(ExpireFeeHolder {
            order_id: order_id.to_string(),
            reason,
            symbol: SYMBOL.to_string(),
            fee: Fee::new(fee, "BNB"),
        })
    }

    #[test]
    fn test_both_legs_produce_exactly_one_trade() {
        let out = FeeCorrelator::default()
            .correlate(42, |c| {
                c.emit(leg("b-1", "b-1", "s-1", 100_000_000, 50_000));
                c.emit(leg("s-1", "b-1", "s-1", 100_000_000, 50_000));
            })
            .unwrap();

        assert_eq!(out.trades.len(), 1);
        assert_eq!(out.unresolved, 0);
        let t = &out.trades[0];
        assert_eq!(t.id, "42-0");
        assert_eq!(t.buyer_fee, 50_000);
        assert_eq!(t.seller_fee, 50_000);
        assert_eq!(t.buyer_addr, "addr-b-1");
        assert_eq!(t.seller_addr, "addr-s-1");
        assert_eq!(t.qty, 100_000_000);
    }

    #[test]
    fn test_configured_channel_capacity_bounds_queues() {
        let config = PublicationConfig {
            fee_channel_capacity: 1,
            ..Default::default()
        };
        let correlator = FeeCorrelator::from_config(&config);
        assert_eq!(correlator.channel_capacity(), 1);

        let out = correlator
            .correlate(7, |c| {
                for i in 0..20 {
                    let (buy, sell) = (format!("b-{}", i), format!("s-{}", i));
                    c.emit(leg(&buy, &buy, &sell, 10, 1));
                    c.emit(leg(&sell, &buy, &sell, 10, 1));
                }
            })
            .unwrap();
        assert_eq!(out.trades.len(), 20);
        assert_eq!(out.trades[19].id, "7-19");
        assert_eq!(out.unresolved, 0);
    }

    #[test]
    fn test_single_leg_never_yields_trade() {
        let out = FeeCorrelator::default()
            .correlate(42, |c| c.emit(leg("b-1", "b-1", "s-1", 10, 5)))
            .unwrap();
        assert!(out.trades.is_empty());
        assert_eq!(out.unresolved, 1);
    }

    #[test]
    fn test_zero_fee_is_resolved() {
        let out = FeeCorrelator::default()
            .correlate(7, |c| {
                c.emit(leg("s-1", "b-1", "s-1", 10, 0));
                c.emit(leg("b-1", "b-1", "s-1", 10, 0));
            })
            .unwrap();
        assert_eq!(out.trades.len(), 1);
        assert_eq!(out.trades[0].buyer_fee, 0);
        assert_eq!(out.trades[0].seller_fee, 0);
    }

    #[test]
    fn test_one_buy_against_two_sells_sequential_ids() {
        let out = FeeCorrelator::default()
            .correlate(100, |c| {
                c.emit(leg("b", "b", "s1", 100_000_000, 50_000));
                c.emit(leg("s1", "b", "s1", 100_000_000, 50_000));
                c.emit(leg("b", "b", "s2", 200_000_000, 100_000));
                c.emit(leg("s2", "b", "s2", 200_000_000, 100_000));
            })
            .unwrap();

        let ids: Vec<&str> = out.trades.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["100-0", "100-1"]);
        assert_eq!(out.trades[0].sell_order_id, "s1");
        assert_eq!(out.trades[0].buyer_fee, 50_000);
        assert_eq!(out.trades[1].sell_order_id, "s2");
        assert_eq!(out.trades[1].seller_fee, 100_000);
    }

    #[test]
    fn test_ids_follow_finalize_order_for_interleaved_legs() {
        let out = FeeCorrelator::default()
            .correlate(5, |c| {
                c.emit(leg("b1", "b1", "s1", 1, 1));
                c.emit(leg("b2", "b2", "s2", 1, 1));
                c.emit(leg("s2", "b2", "s2", 1, 1));
                c.emit(leg("s1", "b1", "s1", 1, 1));
            })
            .unwrap();
        assert_eq!(out.trades[0].buy_order_id, "b2");
        assert_eq!(out.trades[0].id, "5-0");
        assert_eq!(out.trades[1].buy_order_id, "b1");
        assert_eq!(out.trades[1].id, "5-1");
    }

    #[test]
    fn test_same_pair_can_trade_twice() {
        let out = FeeCorrelator::default()
            .correlate(9, |c| {
                c.emit(leg("b", "b", "s", 1, 1));
                c.emit(leg("s", "b", "s", 1, 1));
                c.emit(leg("b", "b", "s", 2, 2));
                c.emit(leg("s", "b", "s", 2, 2));
            })
            .unwrap();
        assert_eq!(out.trades.len(), 2);
        assert_eq!(out.trades[1].qty, 2);
    }

    #[test]
    fn test_unknown_order_is_fatal() {
        let err = FeeCorrelator::default()
            .correlate(1, |c| c.emit(leg("x", "b", "s", 1, 1)))
            .unwrap_err();
        assert!(matches!(err, CorrelationError::UnknownOrder { .. }));
    }

    #[test]
    fn test_duplicate_side_is_fatal() {
        let err = FeeCorrelator::default()
            .correlate(1, |c| {
                c.emit(leg("b", "b", "s", 1, 1));
                c.emit(leg("b", "b", "s", 1, 1));
            })
            .unwrap_err();
        assert!(matches!(err, CorrelationError::DuplicateFeeSide { .. }));
    }

    #[test]
    fn test_error_does_not_block_producer() {
        // more events than the queue holds after the failure
        let err = FeeCorrelator::new(2)
            .correlate(1, |c| {
                c.emit(leg("x", "b", "s", 1, 1));
                for i in 0..100 {
                    let id = format!("b{}", i);
                    c.emit(leg(&id, &id, "s", 1, 1));
                }
            })
            .unwrap_err();
        assert!(matches!(err, CorrelationError::UnknownOrder { .. }));
    }

    #[test]
    fn test_expiry_annotations_in_arrival_order() {
        let out = FeeCorrelator::default()
            .correlate(42, |c| {
                c.emit(expire("1", ChangeType::IocNoFill, 500));
                c.emit(expire("2", ChangeType::IocExpire, 0));
            })
            .unwrap();
        assert!(out.trades.is_empty());
        assert_eq!(
            out.expiry_changes,
            vec![
                OrderChange::new("1", ChangeType::IocNoFill).with_fee(Fee::new(500, "BNB")),
                OrderChange::new("2", ChangeType::IocExpire).with_fee(Fee::new(0, "BNB")),
            ]
        );
    }

    #[test]
    fn test_expiry_sweep_rejects_trade_events() {
        let err = FeeCorrelator::default()
            .correlate_expiries(1, |c| {
                c.emit(expire("1", ChangeType::Expired, 1000));
                c.emit(leg("b", "b", "s", 1, 1));
            })
            .unwrap_err();
        assert_eq!(err, CorrelationError::UnexpectedTradeEvent("b".to_string()));
    }

    #[test]
    fn test_non_expiry_reason_is_fatal() {
        let err = FeeCorrelator::default()
            .correlate_expiries(1, |c| c.emit(expire("1", ChangeType::Canceled, 0)))
            .unwrap_err();
        assert!(matches!(err, CorrelationError::InvalidExpiryReason { .. }));
    }

    #[test]
    fn test_many_events_with_small_queues() {
        let out = FeeCorrelator::new(4)
            .correlate(3, |c| {
                for i in 0..500 {
                    let b = format!("b{}", i);
                    let s = format!("s{}", i);
                    c.emit(leg(&b, &b, &s, 1, 1));
                    c.emit(leg(&s, &b, &s, 1, 1));
                    c.emit(expire(&format!("e{}", i), ChangeType::IocNoFill, 1));
                }
            })
            .unwrap();
        assert_eq!(out.trades.len(), 500);
        assert_eq!(out.expiry_changes.len(), 500);
        assert_eq!(out.trades[499].id, "3-499");
    }
}
