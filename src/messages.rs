//! Published message families
//!
//! Strongly-typed records handed to sinks. One top-level message per family:
//!
//! | Kind               | Record             | Schema version |
//! |--------------------|--------------------|----------------|
//! | `ExecutionResults` | [`ExecutionResults`] | 1            |
//! | `Books`            | [`Books`]          | 0              |
//! | `Accounts`         | [`Accounts`]       | 1              |
//! | `BlockFee`         | [`BlockFee`]       | 0              |
//!
//! Field order inside [`ExecutionResults`] places orders before trades so
//! consumers decoding sequentially see order records first.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::core_types::{
    Address, Asset, FeeAmount, Height, OrderId, Price, Qty, Symbol, TimestampMs, TxHash,
};
use crate::models::{ChangeType, ExecutionType, OrderType, Side, TimeInForce, Trade};

// ============================================================
// MESSAGE KIND
// ============================================================

/// Stable message-kind tag
///
/// The textual form is embedded in bus message keys and file lines;
/// never rename a variant's string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MsgKind {
    ExecutionResults,
    Books,
    Accounts,
    BlockFee,
}

impl MsgKind {
    pub const ALL: [MsgKind; 4] = [
        MsgKind::ExecutionResults,
        MsgKind::Books,
        MsgKind::Accounts,
        MsgKind::BlockFee,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MsgKind::ExecutionResults => "ExecutionResults",
            MsgKind::Books => "Books",
            MsgKind::Accounts => "Accounts",
            MsgKind::BlockFee => "BlockFee",
        }
    }

    /// Latest schema version of this family
    pub fn schema_version(&self) -> u8 {
        match self {
            MsgKind::ExecutionResults => 1,
            MsgKind::Books => 0,
            MsgKind::Accounts => 1,
            MsgKind::BlockFee => 0,
        }
    }

    /// Dense index for per-kind counters
    pub fn index(&self) -> usize {
        match self {
            MsgKind::ExecutionResults => 0,
            MsgKind::Books => 1,
            MsgKind::Accounts => 2,
            MsgKind::BlockFee => 3,
        }
    }
}

impl fmt::Display for MsgKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================
// EXECUTION RESULTS (orders + trades)
// ============================================================

/// Published order record - one per status transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub symbol: Symbol,
    pub status: ChangeType,
    pub order_id: OrderId,
    /// Trade that produced this transition (empty for non-fill transitions)
    pub trade_id: String,
    pub owner: Address,
    pub side: Side,
    pub order_type: OrderType,
    pub price: Price,
    pub qty: Qty,
    pub last_executed_price: Price,
    pub last_executed_qty: Qty,
    pub cum_qty: Qty,
    pub fee: FeeAmount,
    pub fee_asset: Asset,
    pub order_creation_time: TimestampMs,
    pub transaction_time: TimestampMs,
    pub time_in_force: TimeInForce,
    pub current_execution_type: ExecutionType,
    pub tx_hash: TxHash,
    /// Result code of `tx_hash` when it was delivered in this block
    pub tx_code: Option<u32>,
}

impl Order {
    /// Canceled before any fill: the owner pays the cancel fee
    pub fn is_charged_cancel(&self) -> bool {
        self.cum_qty == 0 && self.status == ChangeType::Canceled
    }

    /// Expired before any fill: the owner pays the expire fee
    pub fn is_charged_expire(&self) -> bool {
        self.cum_qty == 0
            && matches!(self.status, ChangeType::IocNoFill | ChangeType::Expired)
    }

    /// Signed quantity this transition adds to (or removes from) the book
    /// at the order's price level
    pub fn effect_qty_to_order_book(&self) -> Qty {
        match self.status {
            ChangeType::Ack => self.qty,
            ChangeType::PartialFill | ChangeType::FullyFill => -self.last_executed_qty,
            ChangeType::Expired
            | ChangeType::IocExpire
            | ChangeType::IocNoFill
            | ChangeType::Canceled
            | ChangeType::FailedMatching => self.cum_qty - self.qty,
            ChangeType::FailedBlocking => 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResults {
    pub height: Height,
    pub timestamp: TimestampMs,
    /// Number of individual records, lets consumers detect missing ones
    pub num_of_msgs: usize,
    pub orders: Vec<Order>,
    pub trades: Vec<Trade>,
}

impl ExecutionResults {
    pub fn new(height: Height, timestamp: TimestampMs, orders: Vec<Order>, trades: Vec<Trade>) -> Self {
        Self {
            height,
            timestamp,
            num_of_msgs: orders.len() + trades.len(),
            orders,
            trades,
        }
    }
}

// ============================================================
// BOOKS
// ============================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceLevel {
    pub price: Price,
    pub last_qty: Qty,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBookDelta {
    pub symbol: Symbol,
    pub buys: Vec<PriceLevel>,
    pub sells: Vec<PriceLevel>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Books {
    pub height: Height,
    pub timestamp: TimestampMs,
    pub num_of_msgs: usize,
    pub books: Vec<OrderBookDelta>,
}

// ============================================================
// ACCOUNTS
// ============================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetBalance {
    pub asset: Asset,
    pub free: i64,
    pub frozen: i64,
    pub locked: i64,
}

impl AssetBalance {
    pub fn empty(asset: impl Into<Asset>) -> Self {
        Self {
            asset: asset.into(),
            free: 0,
            frozen: 0,
            locked: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub owner: Address,
    pub sequence: i64,
    pub balances: Vec<AssetBalance>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Accounts {
    pub height: Height,
    pub num_of_msgs: usize,
    pub accounts: Vec<Account>,
}

// ============================================================
// BLOCK FEE
// ============================================================

/// Block-level fee pool and its beneficiaries (proposer first)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockFee {
    pub height: Height,
    /// Serialized coins, e.g. `BNB:1500;XYZ-000:20`
    pub fee: String,
    pub validators: Vec<Address>,
}

impl BlockFee {
    pub fn new(height: Height, fee: impl Into<String>, validators: Vec<Address>) -> Self {
        Self {
            height,
            fee: fee.into(),
            validators,
        }
    }

    /// No fee was distributed in this block
    pub fn is_empty(&self) -> bool {
        self.fee.is_empty() && self.validators.is_empty()
    }
}

// ============================================================
// TOP-LEVEL MESSAGE
// ============================================================

/// Any message a sink can receive
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum MarketDataMessage {
    ExecutionResults(ExecutionResults),
    Books(Books),
    Accounts(Accounts),
    BlockFee(BlockFee),
}

impl MarketDataMessage {
    pub fn kind(&self) -> MsgKind {
        match self {
            MarketDataMessage::ExecutionResults(_) => MsgKind::ExecutionResults,
            MarketDataMessage::Books(_) => MsgKind::Books,
            MarketDataMessage::Accounts(_) => MsgKind::Accounts,
            MarketDataMessage::BlockFee(_) => MsgKind::BlockFee,
        }
    }

    pub fn height(&self) -> Height {
        match self {
            MarketDataMessage::ExecutionResults(m) => m.height,
            MarketDataMessage::Books(m) => m.height,
            MarketDataMessage::Accounts(m) => m.height,
            MarketDataMessage::BlockFee(m) => m.height,
        }
    }

    /// Content worth recovering by hand when the bus loses this message.
    ///
    /// Only expired orders and touched account owners are kept; the rest
    /// can be rebuilt from chain state. `None` for families without one.
    pub fn essential_msg(&self) -> Option<String> {
        use std::fmt::Write;
        match self {
            MarketDataMessage::ExecutionResults(m) => {
                let mut out = format!("height:{}\ntime:{}\norders:\n", m.height, m.timestamp);
                for o in m.orders.iter().filter(|o| o.status == ChangeType::Expired) {
                    let _ = writeln!(out, "{} {} {}:{}", o.order_id, o.owner, o.fee_asset, o.fee);
                }
                Some(out)
            }
            MarketDataMessage::Accounts(m) => {
                let mut out = format!("height:{}\n", m.height);
                for acc in &m.accounts {
                    let _ = writeln!(out, "{}", acc.owner);
                }
                Some(out)
            }
            MarketDataMessage::Books(_) | MarketDataMessage::BlockFee(_) => None,
        }
    }

    /// Placeholder published in place of a lost message so downstream
    /// consumers waiting on this height do not stall.
    ///
    /// Expired orders are dropped (they go to the essential file instead),
    /// trades are never carried.
    pub fn empty_copy(&self) -> Option<MarketDataMessage> {
        match self {
            MarketDataMessage::ExecutionResults(m) => {
                let orders: Vec<Order> = m
                    .orders
                    .iter()
                    .filter(|o| o.status != ChangeType::Expired)
                    .cloned()
                    .collect();
                Some(MarketDataMessage::ExecutionResults(ExecutionResults::new(
                    m.height,
                    m.timestamp,
                    orders,
                    Vec::new(),
                )))
            }
            MarketDataMessage::Accounts(m) => Some(MarketDataMessage::Accounts(Accounts {
                height: m.height,
                num_of_msgs: 0,
                accounts: Vec::new(),
            })),
            MarketDataMessage::Books(_) | MarketDataMessage::BlockFee(_) => None,
        }
    }
}

impl fmt::Display for MarketDataMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MarketDataMessage::ExecutionResults(m) => write!(
                f,
                "ExecutionResults at height: {}, numOfMsgs: {} (orders={}, trades={})",
                m.height,
                m.num_of_msgs,
                m.orders.len(),
                m.trades.len()
            ),
            MarketDataMessage::Books(m) => {
                write!(f, "Books at height: {}, numOfMsgs: {}", m.height, m.num_of_msgs)
            }
            MarketDataMessage::Accounts(m) => write!(
                f,
                "Accounts at height: {}, numOfMsgs: {}",
                m.height, m.num_of_msgs
            ),
            MarketDataMessage::BlockFee(m) => write!(
                f,
                "BlockFee at height: {}, fee: {}, validators: {}",
                m.height,
                m.fee,
                m.validators.join(",")
            ),
        }
    }
}
