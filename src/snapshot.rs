//! Block snapshot assembly
//!
//! Runs on the execution thread right after settlement so it observes a
//! consistent post-settlement state. Produces exactly one immutable
//! [`BlockInfoToPublish`] per height.

use chrono::{DateTime, Utc};
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

use crate::core_types::{Address, Asset, Height, Price, Qty, Symbol, TimestampMs, TxHash};
use crate::fee_correlator::CorrelationOutput;
use crate::messages::{Account, AssetBalance, BlockFee};
use crate::models::{OrderChange, Trade};
use crate::order_tracking::OrderInfoMap;
use crate::result_pool::{ResultPool, TxResult};

// ============================================================
// PRICE LEVELS
// ============================================================

/// Latest book quantities of the levels changed in this block
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangedPriceLevelsPerSymbol {
    pub buys: BTreeMap<Price, Qty>,
    pub sells: BTreeMap<Price, Qty>,
}

pub type ChangedPriceLevelsMap = FxHashMap<Symbol, ChangedPriceLevelsPerSymbol>;

// ============================================================
// SNAPSHOT
// ============================================================

/// Everything published for one block
///
/// Never mutated after assembly; the order-info map is shared with the
/// tracking map owner and copied by it on its next write.
#[derive(Debug, Clone)]
pub struct BlockInfoToPublish {
    pub height: Height,
    pub timestamp: TimestampMs,
    pub trades: Vec<Trade>,
    /// Order-change log followed by expiry annotations
    pub order_changes: Vec<OrderChange>,
    pub order_infos: Arc<OrderInfoMap>,
    pub accounts: Vec<Account>,
    pub latest_price_levels: ChangedPriceLevelsMap,
    pub block_fee: BlockFee,
    /// Outcomes of this block's transactions behind the published orders
    pub tx_results: FxHashMap<TxHash, TxResult>,
}

/// What settlement hands over once per block
#[derive(Debug, Clone, Default)]
pub struct SettlementOutputs {
    pub correlation: CorrelationOutput,
    pub order_changes: Vec<OrderChange>,
    pub order_infos: Arc<OrderInfoMap>,
    pub accounts: Vec<Account>,
    pub latest_price_levels: ChangedPriceLevelsMap,
    pub block_fee: BlockFee,
    pub tx_results: FxHashMap<TxHash, TxResult>,
}

impl SettlementOutputs {
    /// Copy out of `pool` the results of the transactions that created the
    /// orders touched in this block. Orders created in earlier blocks have
    /// no entry; the pool only holds the current block.
    pub fn attach_tx_results(&mut self, pool: &ResultPool) {
        let touched = self
            .order_changes
            .iter()
            .map(|c| c.order_id.as_str())
            .chain(self.correlation.expiry_changes.iter().map(|c| c.order_id.as_str()))
            .chain(self.correlation.trades.iter().flat_map(|t| {
                [t.buy_order_id.as_str(), t.sell_order_id.as_str()]
            }));
        for order_id in touched {
            let Some(info) = self.order_infos.get(order_id) else {
                continue;
            };
            if info.tx_hash.is_empty() || self.tx_results.contains_key(&info.tx_hash) {
                continue;
            }
            if let Some(result) = pool.get(&info.tx_hash) {
                self.tx_results.insert(info.tx_hash.clone(), result.clone());
            }
        }
    }

    /// Append annotations of a breathe-block or delisting sweep
    pub fn add_expiries(&mut self, changes: Vec<OrderChange>) {
        self.correlation.expiry_changes.extend(changes);
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SnapshotError {
    #[error("snapshot for height {height} already assembled (last height {last})")]
    DuplicateHeight { height: Height, last: Height },
}

#[derive(Debug, Default)]
pub struct BlockSnapshotAssembler {
    last_height: Option<Height>,
    last_timestamp: Option<TimestampMs>,
}

impl BlockSnapshotAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_height(&self) -> Option<Height> {
        self.last_height
    }

    pub fn last_timestamp(&self) -> Option<TimestampMs> {
        self.last_timestamp
    }

    pub fn assemble(
        &mut self,
        height: Height,
        timestamp: TimestampMs,
        outputs: SettlementOutputs,
    ) -> Result<BlockInfoToPublish, SnapshotError> {
        if let Some(last) = self.last_height
            && height <= last
        {
            return Err(SnapshotError::DuplicateHeight { height, last });
        }

        let SettlementOutputs {
            correlation,
            mut order_changes,
            order_infos,
            accounts,
            latest_price_levels,
            block_fee,
            tx_results,
        } = outputs;
        order_changes.extend(correlation.expiry_changes);

        self.last_height = Some(height);
        self.last_timestamp = Some(timestamp);

        Ok(BlockInfoToPublish {
            height,
            timestamp,
            trades: correlation.trades,
            order_changes,
            order_infos,
            accounts,
            latest_price_levels,
            block_fee,
            tx_results,
        })
    }
}

// ============================================================
// ACCOUNT COLLECTION
// ============================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Coin {
    pub denom: Asset,
    pub amount: i64,
}

impl Coin {
    pub fn new(denom: impl Into<Asset>, amount: i64) -> Self {
        Self {
            denom: denom.into(),
            amount,
        }
    }
}

/// Ledger view of one account
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LedgerAccount {
    pub sequence: i64,
    pub free: Vec<Coin>,
    pub frozen: Vec<Coin>,
    pub locked: Vec<Coin>,
}

/// Read access to the account ledger (owned by the settlement side)
pub trait AccountLedger {
    fn account(&self, address: &str) -> Option<LedgerAccount>;
}

/// Balances of every address in `groups`, each address once, in first-seen
/// order. Free, frozen and locked coins of one denomination are merged into
/// one [`AssetBalance`].
pub fn collect_account_balances<L: AccountLedger + ?Sized>(
    ledger: &L,
    groups: &[&[Address]],
) -> Vec<Account> {
    let mut seen: FxHashSet<&str> = FxHashSet::default();
    let mut accounts = Vec::new();

    for addr in groups.iter().flat_map(|g| g.iter()) {
        if !seen.insert(addr.as_str()) {
            continue;
        }
        let Some(acc) = ledger.account(addr) else {
            tracing::error!(address = %addr, "Failed to get account from ledger");
            continue;
        };

        let mut balances: Vec<AssetBalance> = Vec::with_capacity(acc.free.len());
        let mut index: FxHashMap<Asset, usize> = FxHashMap::default();
        for coin in &acc.free {
            balance_slot(&mut balances, &mut index, &coin.denom).free = coin.amount;
        }
        for coin in &acc.frozen {
            balance_slot(&mut balances, &mut index, &coin.denom).frozen = coin.amount;
        }
        for coin in &acc.locked {
            balance_slot(&mut balances, &mut index, &coin.denom).locked = coin.amount;
        }

        accounts.push(Account {
            owner: addr.clone(),
            sequence: acc.sequence,
            balances,
        });
    }
    accounts
}

fn balance_slot<'a>(
    balances: &'a mut Vec<AssetBalance>,
    index: &mut FxHashMap<Asset, usize>,
    denom: &str,
) -> &'a mut AssetBalance {
    let i = match index.get(denom) {
        Some(&i) => i,
        None => {
            balances.push(AssetBalance::empty(denom));
            index.insert(denom.to_string(), balances.len() - 1);
            balances.len() - 1
        }
    };
    &mut balances[i]
}

/// Owners touched by this block's trades and order changes
pub fn related_addresses(
    trades: &[Trade],
    order_changes: &[OrderChange],
    order_infos: &OrderInfoMap,
) -> Vec<Address> {
    let mut res = Vec::with_capacity(trades.len() * 2 + order_changes.len());
    for t in trades {
        res.push(t.buyer_addr.clone());
        res.push(t.seller_addr.clone());
    }
    for change in order_changes {
        match order_infos.get(&change.order_id) {
            Some(info) => res.push(info.owner.clone()),
            None => {
                tracing::error!(order_id = %change.order_id, change = %change.change_type, "Failed to locate order change in order infos")
            }
        }
    }
    res
}

// ============================================================
// BREATHE BLOCK
// ============================================================

/// Whether `height` is a breathe block (daily bookkeeping such as the
/// expiry sweep).
///
/// With `interval > 0` every `interval`-th height is one; otherwise the
/// first block of a new UTC day is. The first block after start
/// (`last_block_time == None`) never is.
pub fn is_breathe_block(
    height: Height,
    last_block_time: Option<DateTime<Utc>>,
    block_time: DateTime<Utc>,
    interval: i64,
) -> bool {
    if interval > 0 {
        return height % interval == 0;
    }
    match last_block_time {
        Some(last) => last.date_naive() != block_time.date_naive(),
        None => false,
    }
}
