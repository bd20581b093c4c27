//! Per-block transaction result pool
//!
//! Scratch map from transaction hash to the raw execution result, filled
//! while a block executes and cleared at the block boundary. Owned by the
//! execution thread; `!Sync`, so it cannot be shared by reference across
//! threads. Before the pool is cleared, the results behind the block's
//! touched orders are copied into its `SettlementOutputs`
//! (`attach_tx_results`) and published as `Order::tx_code`.

use rustc_hash::FxHashMap;
use std::cell::Cell;
use std::marker::PhantomData;

use crate::core_types::TxHash;

/// Raw outcome of one delivered transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxResult {
    /// 0 = success
    pub code: u32,
    pub log: String,
}

impl TxResult {
    pub fn ok() -> Self {
        Self {
            code: 0,
            log: String::new(),
        }
    }

    pub fn failed(code: u32, log: impl Into<String>) -> Self {
        Self {
            code,
            log: log.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code == 0
    }
}

#[derive(Debug, Default)]
pub struct ResultPool {
    results: FxHashMap<TxHash, TxResult>,
    _not_sync: PhantomData<Cell<()>>,
}

impl ResultPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// A transaction delivered twice keeps its latest result.
    pub fn insert(&mut self, tx_hash: impl Into<TxHash>, result: TxResult) {
        self.results.insert(tx_hash.into(), result);
    }

    pub fn get(&self, tx_hash: &str) -> Option<&TxResult> {
        self.results.get(tx_hash)
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// Block boundary
    pub fn clear(&mut self) {
        self.results.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_get_clear() {
        let mut pool = ResultPool::new();
        pool.insert("AA01", TxResult::ok());
        pool.insert("BB02", TxResult::failed(5, "insufficient fund"));
        pool.insert("AA01", TxResult::failed(3, "retried"));

        assert_eq!(pool.len(), 2);
        assert!(!pool.get("BB02").unwrap().is_ok());
        assert_eq!(pool.get("AA01").unwrap().code, 3);
        assert!(pool.get("CC03").is_none());

        pool.clear();
        assert!(pool.is_empty());
        assert!(pool.get("AA01").is_none());
    }
}
