//! Dispatch loop - the single consumer of the publication queue
//!
//! Per block, in this order (each step gated by config):
//!
//! 1. Derive opened / closed order records from the order-change log and
//!    the trades; queue removals of terminal orders for the tracking map
//!    owner (always, even with order publication off).
//! 2. `ExecutionResults` (orders + trades). Consumers enriching trades
//!    with owner identity rely on seeing the orders first.
//! 3. `Accounts`
//! 4. `Books`, from the price levels touched by the orders of step 1 only
//! 5. `BlockFee`
//!
//! Sink errors are logged and counted, never retried here.

use rustc_hash::{FxHashMap, FxHashSet};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use crate::core_types::{Address, Price, Qty, Symbol, TimestampMs, TxHash};
use crate::messages::{
    Accounts, Books, ExecutionResults, MarketDataMessage, Order, OrderBookDelta, PriceLevel,
};
use crate::models::{ChangeType, ExecutionType, OrderChange, OrderInfo, OrderType, Side, Trade};
use crate::order_tracking::{OrderInfoMap, OrderRemoval};
use crate::pipeline::PipelineContext;
use crate::result_pool::TxResult;
use crate::sink::{MarketDataSink, SinkError};
use crate::snapshot::{BlockInfoToPublish, ChangedPriceLevelsMap};

// ============================================================
// ORDER COLLECTION
// ============================================================

/// Order records derived from one snapshot
#[derive(Debug, Default)]
pub struct CollectedOrders {
    /// Ack / PartialFill
    pub opens: Vec<Order>,
    /// Terminal transitions
    pub closed: Vec<Order>,
    /// Terminal orders to drop from the tracking map
    pub removals: Vec<OrderRemoval>,
    /// Owners charged a cancel fee (cancel before any fill)
    pub charged_cancels: FxHashMap<Address, u32>,
    /// Owners charged an expire fee (expiry before any fill)
    pub charged_expires: FxHashMap<Address, u32>,
}

impl CollectedOrders {
    /// Publication order: opens first, then terminal records
    pub fn all(&self) -> Vec<Order> {
        let mut all = Vec::with_capacity(self.opens.len() + self.closed.len());
        all.extend(self.opens.iter().cloned());
        all.extend(self.closed.iter().cloned());
        all
    }

    fn push(&mut self, order: Order, removal_seen: &mut FxHashSet<String>) {
        if order.status.is_open() {
            self.opens.push(order);
            return;
        }
        if removal_seen.insert(order.order_id.clone()) {
            self.removals.push(OrderRemoval {
                symbol: order.symbol.clone(),
                order_id: order.order_id.clone(),
            });
        }
        self.closed.push(order);
    }
}

fn base_order(info: &OrderInfo, status: ChangeType, timestamp: TimestampMs) -> Order {
    Order {
        symbol: info.symbol.clone(),
        status,
        order_id: info.id.clone(),
        trade_id: String::new(),
        owner: info.owner.clone(),
        side: info.side,
        order_type: OrderType::Limit,
        price: info.price,
        qty: info.qty,
        last_executed_price: 0,
        last_executed_qty: 0,
        cum_qty: info.cum_qty,
        fee: 0,
        fee_asset: String::new(),
        order_creation_time: info.created_timestamp,
        transaction_time: timestamp,
        time_in_force: info.time_in_force,
        current_execution_type: ExecutionType::New,
        tx_hash: info.tx_hash.clone(),
        tx_code: None,
    }
}

/// Build the order records of one block.
///
/// Change-log records come first, in log order; then one record per side
/// of every trade. A trade side is `FullyFill` when the order's cumulative
/// quantity after that trade reaches its quantity. Cumulative quantities
/// per trade are rebuilt backwards from the post-block `cum_qty`.
pub fn collect_orders_to_publish(
    trades: &[Trade],
    order_changes: &[OrderChange],
    order_infos: &OrderInfoMap,
    timestamp: TimestampMs,
) -> CollectedOrders {
    let mut collected = CollectedOrders::default();
    let mut removal_seen: FxHashSet<String> = FxHashSet::default();

    for change in order_changes {
        let Some(info) = order_infos.get(&change.order_id) else {
            tracing::error!(order_id = %change.order_id, change = %change.change_type, "Failed to locate order change in order infos");
            continue;
        };
        let mut order = base_order(info, change.change_type, timestamp);
        if change.change_type == ChangeType::Ack {
            order.cum_qty = 0;
        }
        if let Some(fee) = &change.fee {
            order.fee = fee.amount;
            order.fee_asset = fee.asset.clone();
        }

        if order.is_charged_cancel() {
            *collected.charged_cancels.entry(info.owner.clone()).or_insert(0) += 1;
        } else if order.is_charged_expire() {
            *collected.charged_expires.entry(info.owner.clone()).or_insert(0) += 1;
        }
        collected.push(order, &mut removal_seen);
    }

    // quantity each order traded in this block
    let mut traded: FxHashMap<&str, Qty> = FxHashMap::default();
    for t in trades {
        *traded.entry(t.buy_order_id.as_str()).or_insert(0) += t.qty;
        *traded.entry(t.sell_order_id.as_str()).or_insert(0) += t.qty;
    }
    // cumulative quantity before the next trade of each order
    let mut running: FxHashMap<&str, Qty> = FxHashMap::default();

    for t in trades {
        for side in [Side::Buy, Side::Sell] {
            let order_id = t.order_id_of(side);
            let Some(info) = order_infos.get(order_id) else {
                tracing::error!(order_id, trade_id = %t.id, "Failed to resolve trade order from order infos");
                continue;
            };
            let cum = running.entry(order_id).or_insert_with(|| {
                info.cum_qty - traded.get(order_id).copied().unwrap_or(0)
            });
            *cum += t.qty;

            let status = if *cum >= info.qty {
                ChangeType::FullyFill
            } else {
                ChangeType::PartialFill
            };
            let fee = t.fee_of(side);
            let mut order = base_order(info, status, timestamp);
            order.trade_id = t.id.clone();
            order.last_executed_price = t.price;
            order.last_executed_qty = t.qty;
            order.cum_qty = *cum;
            order.fee = fee.amount;
            order.fee_asset = fee.asset;
            collected.push(order, &mut removal_seen);
        }
    }

    collected
}

// ============================================================
// ORDER BOOK DELTAS
// ============================================================

/// Order-book deltas touched by `orders`
///
/// Levels whose net quantity change in this block is zero are dropped, as
/// are symbols left without levels and symbols without book data. A level
/// that no longer exists is published with quantity 0. Output is sorted by
/// symbol; buys by descending price, sells by ascending price.
pub fn filter_changed_order_books(
    orders: &[Order],
    latest_price_levels: &ChangedPriceLevelsMap,
) -> Vec<OrderBookDelta> {
    // symbol -> price -> net qty diff in this block
    let mut buy_diff: FxHashMap<&str, FxHashMap<Price, Qty>> = FxHashMap::default();
    let mut sell_diff: FxHashMap<&str, FxHashMap<Price, Qty>> = FxHashMap::default();

    for o in orders {
        if !latest_price_levels.contains_key(&o.symbol) {
            continue;
        }
        let diff = match o.side {
            Side::Buy => &mut buy_diff,
            Side::Sell => &mut sell_diff,
        };
        *diff
            .entry(o.symbol.as_str())
            .or_default()
            .entry(o.price)
            .or_insert(0) += o.effect_qty_to_order_book();
    }

    let mut symbols: Vec<&str> = buy_diff.keys().chain(sell_diff.keys()).copied().collect();
    symbols.sort_unstable();
    symbols.dedup();

    let mut books = Vec::new();
    for symbol in symbols {
        let Some(latest) = latest_price_levels.get(symbol) else {
            continue;
        };
        let levels = |diff: &FxHashMap<&str, FxHashMap<Price, Qty>>,
                      book: &std::collections::BTreeMap<Price, Qty>| {
            let mut out: Vec<PriceLevel> = diff
                .get(symbol)
                .into_iter()
                .flat_map(|m| m.iter())
                .filter(|(_, qty)| **qty != 0)
                .map(|(price, _)| PriceLevel {
                    price: *price,
                    last_qty: book.get(price).copied().unwrap_or(0),
                })
                .collect();
            out.sort_unstable_by_key(|l| l.price);
            out
        };
        let mut buys = levels(&buy_diff, &latest.buys);
        buys.reverse();
        let sells = levels(&sell_diff, &latest.sells);
        if buys.is_empty() && sells.is_empty() {
            continue;
        }
        books.push(OrderBookDelta {
            symbol: Symbol::from(symbol),
            buys,
            sells,
        });
    }
    books
}

/// Stamp each order with the result code of its creating transaction,
/// when that transaction was delivered in this block
pub fn attach_tx_codes(orders: &mut [Order], tx_results: &FxHashMap<TxHash, TxResult>) {
    for order in orders.iter_mut() {
        order.tx_code = tx_results.get(&order.tx_hash).map(|r| r.code);
    }
}

// ============================================================
// DISPATCHER
// ============================================================

pub struct Dispatcher {
    ctx: Arc<PipelineContext>,
    sink: Box<dyn MarketDataSink>,
}

/// Takes the pipeline offline if the dispatch thread unwinds, so a blocked
/// or later producer gets an error instead of waiting on a dead consumer.
struct UnwindGuard<'a> {
    ctx: &'a PipelineContext,
}

impl Drop for UnwindGuard<'_> {
    fn drop(&mut self) {
        if thread::panicking() {
            tracing::error!("Dispatch thread panicked, publication queue closed");
            self.ctx.set_live(false);
            self.ctx.publication_queue.close();
        }
    }
}

impl Dispatcher {
    pub fn new(ctx: Arc<PipelineContext>, mut sink: Box<dyn MarketDataSink>) -> Self {
        sink.attach_metrics(ctx.metrics.clone());
        Self { ctx, sink }
    }

    /// Consume snapshots until the publication queue is closed and drained,
    /// then stop the sink.
    pub fn run(mut self) {
        let ctx = self.ctx.clone();
        let _unwind = UnwindGuard { ctx: &ctx };
        tracing::info!(sink = self.sink.name(), "Dispatch loop started");
        while let Some(block) = self.ctx.publication_queue.recv() {
            self.ctx
                .metrics
                .set_queue_size(self.ctx.publication_queue.len() as i64);
            if let Err(e) = self.publish_block(&block) {
                tracing::error!(height = block.height, error = %e, "Fatal publish failure, dispatch stopped");
                self.ctx.set_live(false);
                self.ctx.publication_queue.close();
                break;
            }
        }
        self.sink.stop();
        tracing::info!(sink = self.sink.name(), "Dispatch loop exited");
    }

    /// Publish one block. Only a fail-fast sink error is returned.
    pub fn publish_block(&mut self, block: &BlockInfoToPublish) -> Result<(), SinkError> {
        let start = Instant::now();
        let config = &self.ctx.config;
        let (publish_orders, publish_accounts, publish_books, publish_fee) = (
            config.publish_order_updates,
            config.publish_account_balance,
            config.publish_order_book,
            config.publish_block_fee,
        );

        let collected = collect_orders_to_publish(
            &block.trades,
            &block.order_changes,
            &block.order_infos,
            block.timestamp,
        );
        self.signal_removals(&collected.removals);
        if !collected.charged_cancels.is_empty() || !collected.charged_expires.is_empty() {
            tracing::debug!(
                height = block.height,
                charged_cancels = collected.charged_cancels.values().sum::<u32>(),
                charged_expires = collected.charged_expires.values().sum::<u32>(),
                "Charged cancels and expires"
            );
        }
        let mut orders = collected.all();
        attach_tx_codes(&mut orders, &block.tx_results);

        tracing::info!(
            height = block.height,
            num_of_trades = block.trades.len(),
            num_of_orders = orders.len(),
            num_of_accounts = block.accounts.len(),
            "Start to publish"
        );

        if publish_orders {
            let msg = ExecutionResults::new(
                block.height,
                block.timestamp,
                orders.clone(),
                block.trades.clone(),
            );
            self.ctx.metrics.set_num_trades(msg.trades.len());
            self.ctx.metrics.set_num_orders(msg.orders.len());
            self.publish(MarketDataMessage::ExecutionResults(msg), block)?;
        }

        if publish_accounts {
            let mut accounts = block.accounts.clone();
            accounts.sort_by(|a, b| a.owner.cmp(&b.owner));
            self.ctx.metrics.set_num_accounts(accounts.len());
            let msg = Accounts {
                height: block.height,
                num_of_msgs: accounts.len(),
                accounts,
            };
            self.publish(MarketDataMessage::Accounts(msg), block)?;
        }

        if publish_books {
            let books = filter_changed_order_books(&orders, &block.latest_price_levels);
            self.ctx.metrics.set_num_order_books(books.len());
            let msg = Books {
                height: block.height,
                timestamp: block.timestamp,
                num_of_msgs: books.len(),
                books,
            };
            self.publish(MarketDataMessage::Books(msg), block)?;
        }

        if publish_fee && !block.block_fee.is_empty() {
            self.publish(MarketDataMessage::BlockFee(block.block_fee.clone()), block)?;
        }

        self.ctx.metrics.set_publication_height(block.height);
        self.ctx
            .metrics
            .set_publish_block_time_ms(start.elapsed().as_millis() as i64);
        tracing::debug!(height = block.height, "Finish publish");
        Ok(())
    }

    fn publish(&mut self, msg: MarketDataMessage, block: &BlockInfoToPublish) -> Result<(), SinkError> {
        let kind = msg.kind();
        let start = Instant::now();
        match self.sink.publish(&msg, kind, block.height, block.timestamp) {
            Ok(()) => self.ctx.metrics.incr_published(kind),
            Err(e @ SinkError::FailFast(_)) => {
                self.ctx.metrics.incr_publish_failures();
                return Err(e);
            }
            Err(e) => {
                self.ctx.metrics.incr_publish_failures();
                tracing::error!(kind = %kind, height = block.height, msg = %msg, error = %e, "Failed to publish");
            }
        }
        self.ctx
            .metrics
            .set_publish_kind_time_ms(kind, start.elapsed().as_millis() as i64);
        Ok(())
    }

    fn signal_removals(&self, removals: &[OrderRemoval]) {
        for removal in removals {
            if let Err(r) = self.ctx.removal_queue.push(removal.clone()) {
                tracing::warn!(order_id = %r.order_id, "Removal queue closed, removal not signaled");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Fee, TimeInForce};
    use crate::snapshot::ChangedPriceLevelsPerSymbol;

    const SYMBOL: &str = "XYZ-000_BNB";

    fn infos(list: Vec<OrderInfo>) -> OrderInfoMap {
        list.into_iter().map(|i| (i.id.clone(), i)).collect()
    }

    fn info(id: &str, side: Side, price: Price, qty: Qty, cum_qty: Qty) -> OrderInfo {
        let mut i = OrderInfo::new(id, SYMBOL, format!("owner-{}", id), side, price, qty, TimeInForce::Gtc, 1, 500);
        i.cum_qty = cum_qty;
        i
    }

    fn trade(id: &str, buy: &str, sell: &str, price: Price, qty: Qty, fee: i64) -> Trade {
        Trade {
            id: id.to_string(),
            symbol: SYMBOL.to_string(),
            price,
            qty,
            sell_order_id: sell.to_string(),
            buy_order_id: buy.to_string(),
            seller_fee: fee,
            buyer_fee: fee,
            seller_fee_asset: "BNB".to_string(),
            buyer_fee_asset: "BNB".to_string(),
            seller_addr: format!("owner-{}", sell),
            buyer_addr: format!("owner-{}", buy),
        }
    }

    #[test]
    fn test_collect_from_order_changes() {
        let map = infos(vec![info("1", Side::Buy, 100, 10, 0), info("2", Side::Sell, 110, 5, 0)]);
        let changes = vec![
            OrderChange::new("1", ChangeType::Ack),
            OrderChange::new("2", ChangeType::Canceled).with_fee(Fee::new(7, "BNB")),
            OrderChange::new("ghost", ChangeType::Ack),
        ];
        let c = collect_orders_to_publish(&[], &changes, &map, 1000);

        assert_eq!(c.opens.len(), 1);
        assert_eq!(c.opens[0].transaction_time, 1000);
        assert_eq!(c.opens[0].order_creation_time, 500);
        assert_eq!(c.closed.len(), 1);
        assert_eq!(c.closed[0].fee, 7);
        assert_eq!(c.charged_cancels.get("owner-2"), Some(&1));
        assert_eq!(
            c.removals,
            vec![OrderRemoval { symbol: SYMBOL.to_string(), order_id: "2".to_string() }]
        );
    }

    #[test]
    fn test_attach_tx_codes() {
        let map = infos(vec![
            info("1", Side::Buy, 100, 10, 0).with_tx_hash("AA"),
            info("2", Side::Sell, 110, 5, 0).with_tx_hash("BB"),
            info("3", Side::Sell, 120, 5, 0),
        ]);
        let changes = vec![
            OrderChange::new("1", ChangeType::Ack),
            OrderChange::new("2", ChangeType::Ack),
            OrderChange::new("3", ChangeType::Canceled),
        ];
        let mut orders = collect_orders_to_publish(&[], &changes, &map, 1000).all();

        let mut results = FxHashMap::default();
        results.insert("AA".to_string(), TxResult::ok());
        results.insert("BB".to_string(), TxResult::failed(5, "insufficient fund"));
        attach_tx_codes(&mut orders, &results);

        let codes: Vec<(&str, Option<u32>)> =
            orders.iter().map(|o| (o.order_id.as_str(), o.tx_code)).collect();
        assert_eq!(codes, vec![("1", Some(0)), ("2", Some(5)), ("3", None)]);
    }

    #[test]
    fn test_collect_from_trades_rebuilds_cumulative_qty() {
        // buy of 30 fills against 10 and 20 in the same block
        let map = infos(vec![
            info("b", Side::Buy, 100, 30, 30),
            info("s1", Side::Sell, 100, 10, 10),
            info("s2", Side::Sell, 100, 20, 20),
        ]);
        let trades = vec![trade("9-0", "b", "s1", 100, 10, 1), trade("9-1", "b", "s2", 100, 20, 2)];
        let c = collect_orders_to_publish(&trades, &[], &map, 1000);

        assert_eq!(c.opens.len(), 1);
        let partial = &c.opens[0];
        assert_eq!(partial.order_id, "b");
        assert_eq!(partial.status, ChangeType::PartialFill);
        assert_eq!(partial.cum_qty, 10);
        assert_eq!(partial.trade_id, "9-0");

        let closed: Vec<(&str, ChangeType, Qty)> = c
            .closed
            .iter()
            .map(|o| (o.order_id.as_str(), o.status, o.cum_qty))
            .collect();
        assert_eq!(
            closed,
            vec![
                ("s1", ChangeType::FullyFill, 10),
                ("b", ChangeType::FullyFill, 30),
                ("s2", ChangeType::FullyFill, 20),
            ]
        );
        assert_eq!(c.removals.len(), 3);
    }

    #[test]
    fn test_books_delta_for_ack() {
        let map = infos(vec![info("1", Side::Buy, 102_000, 3_000_000, 0)]);
        let c = collect_orders_to_publish(&[], &[OrderChange::new("1", ChangeType::Ack)], &map, 1);

        let mut latest = ChangedPriceLevelsMap::default();
        let mut levels = ChangedPriceLevelsPerSymbol::default();
        levels.buys.insert(102_000, 3_000_000);
        latest.insert(SYMBOL.to_string(), levels);

        let books = filter_changed_order_books(&c.all(), &latest);
        assert_eq!(
            books,
            vec![OrderBookDelta {
                symbol: SYMBOL.to_string(),
                buys: vec![PriceLevel { price: 102_000, last_qty: 3_000_000 }],
                sells: vec![],
            }]
        );
    }

    #[test]
    fn test_books_drop_levels_with_zero_net_change() {
        // IOC acked and expired in the same block: book unchanged
        let map = infos(vec![info("1", Side::Buy, 102_000, 3_000_000, 0)]);
        let changes = vec![
            OrderChange::new("1", ChangeType::Ack),
            OrderChange::new("1", ChangeType::IocNoFill).with_fee(Fee::new(500, "BNB")),
        ];
        let c = collect_orders_to_publish(&[], &changes, &map, 1);

        let mut latest = ChangedPriceLevelsMap::default();
        latest.insert(SYMBOL.to_string(), ChangedPriceLevelsPerSymbol::default());
        assert!(filter_changed_order_books(&c.all(), &latest).is_empty());
    }

    #[test]
    fn test_books_removed_level_published_as_zero_and_sorted() {
        let map = infos(vec![
            info("1", Side::Sell, 120, 5, 0),
            info("2", Side::Sell, 110, 5, 0),
            info("3", Side::Buy, 90, 5, 0),
            info("4", Side::Buy, 95, 5, 0),
        ]);
        let changes = vec![
            OrderChange::new("1", ChangeType::Ack),
            OrderChange::new("2", ChangeType::Ack),
            OrderChange::new("3", ChangeType::Ack),
            OrderChange::new("4", ChangeType::Canceled),
        ];
        let c = collect_orders_to_publish(&[], &changes, &map, 1);

        let mut latest = ChangedPriceLevelsMap::default();
        let mut levels = ChangedPriceLevelsPerSymbol::default();
        levels.sells.insert(120, 5);
        levels.sells.insert(110, 5);
        levels.buys.insert(90, 5);
        latest.insert(SYMBOL.to_string(), levels);
        // symbol without book data is ignored
        let other = info("x", Side::Buy, 1, 1, 0);
        let mut all = c.all();
        let mut foreign = base_order(&other, ChangeType::Ack, 1);
        foreign.symbol = "ABC-111_BNB".to_string();
        all.push(foreign);

        let books = filter_changed_order_books(&all, &latest);
        assert_eq!(books.len(), 1);
        assert_eq!(
            books[0].buys,
            vec![PriceLevel { price: 95, last_qty: 0 }, PriceLevel { price: 90, last_qty: 5 }]
        );
        assert_eq!(
            books[0].sells,
            vec![PriceLevel { price: 110, last_qty: 5 }, PriceLevel { price: 120, last_qty: 5 }]
        );
    }
}
