// models.rs - Core order, trade and fee types produced by settlement

use serde::{Deserialize, Serialize};

use crate::core_types::{
    Address, Asset, FeeAmount, Height, OrderId, Price, Qty, Symbol, TimestampMs, TxHash,
};

/// Order side: Buy or Sell
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

/// Order type. The chain only supports limit orders today.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderType {
    Limit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TimeInForce {
    Gtc, // Good till cancel (expired by the breathe-block sweep)
    Ioc, // Immediate or cancel
}

/// Execution type of the published order record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ExecutionType {
    New,
}

// ============================================================
// ORDER LIFECYCLE
// ============================================================

/// One lifecycle transition of an order
///
/// `Ack` and `PartialFill` leave the order on the book; every other
/// variant is terminal and removes the order from the tracking map once
/// published.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeType {
    Ack,            // New order accepted by the book
    PartialFill,    // Order filled partially, rest still resting
    FullyFill,      // Order filled completely
    Canceled,       // Canceled by owner
    Expired,        // Expired by the breathe-block sweep or delisting
    IocNoFill,      // IOC order expired without any fill
    IocExpire,      // IOC order expired after a partial fill
    FailedBlocking, // Rejected before reaching the book
    FailedMatching, // Rejected by the match pass
}

impl ChangeType {
    /// Stable textual name (used in logs and essential files)
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeType::Ack => "Ack",
            ChangeType::PartialFill => "PartialFill",
            ChangeType::FullyFill => "FullyFill",
            ChangeType::Canceled => "Canceled",
            ChangeType::Expired => "Expired",
            ChangeType::IocNoFill => "IocNoFill",
            ChangeType::IocExpire => "IocExpire",
            ChangeType::FailedBlocking => "FailedBlocking",
            ChangeType::FailedMatching => "FailedMatching",
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self, ChangeType::Ack | ChangeType::PartialFill)
    }

    /// Reasons an expiry fee event may carry
    pub fn is_expiry(&self) -> bool {
        matches!(
            self,
            ChangeType::Expired | ChangeType::IocNoFill | ChangeType::IocExpire
        )
    }
}

impl std::fmt::Display for ChangeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fee charged for one transfer leg or one order transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fee {
    pub amount: FeeAmount,
    pub asset: Asset,
}

impl Fee {
    pub fn new(amount: FeeAmount, asset: impl Into<Asset>) -> Self {
        Self {
            amount,
            asset: asset.into(),
        }
    }

    pub fn zero(asset: impl Into<Asset>) -> Self {
        Self::new(0, asset)
    }
}

impl std::fmt::Display for Fee {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.asset, self.amount)
    }
}

/// Entry of the settlement-owned order tracking map
///
/// `cum_qty` is the cumulative executed quantity after the block's
/// settlement has been applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderInfo {
    pub id: OrderId,
    pub symbol: Symbol,
    pub owner: Address,
    pub side: Side,
    pub price: Price,
    pub qty: Qty,
    pub cum_qty: Qty,
    pub created_height: Height,
    pub created_timestamp: TimestampMs,
    pub time_in_force: TimeInForce,
    pub tx_hash: TxHash,
}

impl OrderInfo {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: impl Into<OrderId>,
        symbol: impl Into<Symbol>,
        owner: impl Into<Address>,
        side: Side,
        price: Price,
        qty: Qty,
        time_in_force: TimeInForce,
        created_height: Height,
        created_timestamp: TimestampMs,
    ) -> Self {
        Self {
            id: id.into(),
            symbol: symbol.into(),
            owner: owner.into(),
            side,
            price,
            qty,
            cum_qty: 0,
            created_height,
            created_timestamp,
            time_in_force,
            tx_hash: String::new(),
        }
    }

    pub fn with_tx_hash(mut self, tx_hash: impl Into<TxHash>) -> Self {
        self.tx_hash = tx_hash.into();
        self
    }

    pub fn is_fully_filled(&self) -> bool {
        self.cum_qty >= self.qty
    }
}

/// One entry of the per-block order-change log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderChange {
    pub order_id: OrderId,
    pub change_type: ChangeType,
    /// Fee charged by this transition (expiry / cancel fees), if any
    pub fee: Option<Fee>,
}

impl OrderChange {
    pub fn new(order_id: impl Into<OrderId>, change_type: ChangeType) -> Self {
        Self {
            order_id: order_id.into(),
            change_type,
            fee: None,
        }
    }

    pub fn with_fee(mut self, fee: Fee) -> Self {
        self.fee = Some(fee);
        self
    }
}

// ============================================================
// SETTLEMENT FEE EVENTS
// ============================================================

/// Identifies one matched (buy, sell) pair of a match pass
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TradeRef {
    pub buy_order_id: OrderId,
    pub sell_order_id: OrderId,
    pub price: Price,
    pub qty: Qty,
}

impl TradeRef {
    pub fn new(
        buy_order_id: impl Into<OrderId>,
        sell_order_id: impl Into<OrderId>,
        price: Price,
        qty: Qty,
    ) -> Self {
        Self {
            buy_order_id: buy_order_id.into(),
            sell_order_id: sell_order_id.into(),
            price,
            qty,
        }
    }
}

/// Fee of one settled trade leg (one per side of every trade)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TradeFeeHolder {
    /// Order whose owner paid this leg's fee
    pub order_id: OrderId,
    pub trade: TradeRef,
    pub symbol: Symbol,
    pub owner: Address,
    pub fee: Fee,
}

/// Fee of one expired order (single-sided)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpireFeeHolder {
    pub order_id: OrderId,
    pub reason: ChangeType,
    pub symbol: Symbol,
    pub fee: Fee,
}

/// Event pushed by the settlement engine for every transfer leg
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferFeeEvent {
    Trade(TradeFeeHolder),
    Expire(ExpireFeeHolder),
}

// ============================================================
// TRADE
// ============================================================

/// Trade record with both fee sides resolved
///
/// Only the fee correlator constructs trades; it never emits one with an
/// unresolved side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trade {
    pub id: String,
    pub symbol: Symbol,
    pub price: Price,
    pub qty: Qty,
    pub sell_order_id: OrderId,
    pub buy_order_id: OrderId,
    pub seller_fee: FeeAmount,
    pub buyer_fee: FeeAmount,
    pub seller_fee_asset: Asset,
    pub buyer_fee_asset: Asset,
    pub seller_addr: Address,
    pub buyer_addr: Address,
}

impl Trade {
    /// Deterministic trade id within a block
    pub fn make_id(height: Height, seq: u64) -> String {
        format!("{}-{}", height, seq)
    }

    /// Fee paid by the given side of this trade
    pub fn fee_of(&self, side: Side) -> Fee {
        match side {
            Side::Buy => Fee::new(self.buyer_fee, self.buyer_fee_asset.clone()),
            Side::Sell => Fee::new(self.seller_fee, self.seller_fee_asset.clone()),
        }
    }

    pub fn order_id_of(&self, side: Side) -> &str {
        match side {
            Side::Buy => &self.buy_order_id,
            Side::Sell => &self.sell_order_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_change_type_open_and_expiry() {
        assert!(ChangeType::Ack.is_open());
        assert!(ChangeType::PartialFill.is_open());
        assert!(!ChangeType::FullyFill.is_open());
        assert!(!ChangeType::Canceled.is_open());

        assert!(ChangeType::Expired.is_expiry());
        assert!(ChangeType::IocNoFill.is_expiry());
        assert!(!ChangeType::Canceled.is_expiry());
    }

    #[test]
    fn test_trade_id_format() {
        assert_eq!(Trade::make_id(42, 0), "42-0");
        assert_eq!(Trade::make_id(1000, 17), "1000-17");
    }

    #[test]
    fn test_fee_display() {
        assert_eq!(Fee::new(500, "BNB").to_string(), "BNB:500");
    }

    #[test]
    fn test_change_type_serializes_by_name() {
        let json = serde_json::to_string(&ChangeType::IocNoFill).unwrap();
        assert_eq!(json, "\"IocNoFill\"");
        let side = serde_json::to_string(&Side::Buy).unwrap();
        assert_eq!(side, "\"BUY\"");
    }
}
