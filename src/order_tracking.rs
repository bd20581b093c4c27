//! Order tracking map - settlement-owned live order state
//!
//! The settlement subsystem is the only writer of this map. The publication
//! pipeline reads it through cheap per-block snapshots (`Arc` clones; the
//! next mutation copies if a snapshot is still in flight) and asks for
//! removals through a hand-off queue instead of mutating it.

use rustc_hash::FxHashMap;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crate::core_types::{OrderId, Qty, Symbol};
use crate::models::OrderInfo;
use crate::pipeline::HandoffQueue;

pub type OrderInfoMap = FxHashMap<OrderId, OrderInfo>;

/// Request to forget an order once its terminal state was published
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderRemoval {
    pub symbol: Symbol,
    pub order_id: OrderId,
}

#[derive(Debug, Default)]
pub struct OrderTracker {
    orders: Arc<OrderInfoMap>,
}

impl OrderTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, info: OrderInfo) {
        Arc::make_mut(&mut self.orders).insert(info.id.clone(), info);
    }

    /// Record execution progress; returns false for unknown orders
    pub fn add_cum_qty(&mut self, order_id: &str, executed: Qty) -> bool {
        match Arc::make_mut(&mut self.orders).get_mut(order_id) {
            Some(info) => {
                info.cum_qty += executed;
                true
            }
            None => false,
        }
    }

    pub fn get(&self, order_id: &str) -> Option<&OrderInfo> {
        self.orders.get(order_id)
    }

    pub fn len(&self) -> usize {
        self.orders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.orders.is_empty()
    }

    /// Immutable view for one block snapshot
    pub fn snapshot(&self) -> Arc<OrderInfoMap> {
        self.orders.clone()
    }

    pub fn remove(&mut self, removal: &OrderRemoval) -> bool {
        let removed = Arc::make_mut(&mut self.orders)
            .remove(&removal.order_id)
            .is_some();
        if removed {
            tracing::debug!(symbol = %removal.symbol, order_id = %removal.order_id, "Order removed from tracking map");
        } else {
            tracing::warn!(symbol = %removal.symbol, order_id = %removal.order_id, "Removal for unknown order");
        }
        removed
    }

    /// Apply every removal currently queued without waiting.
    pub fn drain_removals(&mut self, queue: &HandoffQueue<OrderRemoval>) -> usize {
        let mut applied = 0;
        while let Some(removal) = queue.try_pop() {
            if self.remove(&removal) {
                applied += 1;
            }
        }
        applied
    }
}

/// Long-lived consumer applying removals to a shared tracker until the
/// queue is closed. Returns the number of orders removed.
pub fn spawn_removal_consumer(
    tracker: Arc<Mutex<OrderTracker>>,
    queue: Arc<HandoffQueue<OrderRemoval>>,
) -> std::io::Result<JoinHandle<usize>> {
    thread::Builder::new()
        .name("order-removal".to_string())
        .spawn(move || {
            let mut removed = 0;
            while let Some(removal) = queue.recv() {
                match tracker.lock() {
                    Ok(mut guard) => {
                        if guard.remove(&removal) {
                            removed += 1;
                        }
                    }
                    Err(_) => {
                        tracing::error!("Order tracker lock poisoned, removal consumer exiting");
                        break;
                    }
                }
            }
            removed
        })
}
