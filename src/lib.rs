//! Market data publication pipeline
//!
//! Publishes per-block market data (orders, trades, order-book deltas,
//! account balances, block fees) from a validator node, in block order, to
//! a message bus and/or a local file.
//!
//! # Modules
//!
//! - [`core_types`] - Scalar aliases (Height, Price, Qty, ...)
//! - [`models`] - Settlement-side records (OrderInfo, OrderChange, Trade, fee holders)
//! - [`messages`] - Published message families
//! - [`fee_correlator`] - Two-sided fee events -> trades and expiry annotations
//! - [`snapshot`] - Per-block immutable snapshot assembly
//! - [`order_tracking`] - Settlement-owned live order map and removal consumer
//! - [`pipeline`] - Hand-off queues, context and lifecycle
//! - [`dispatch`] - Ordered per-block publication
//! - [`encoder`] - Binary payloads, JSON lines, message keys
//! - [`sink`] - Bus / file / mock / fan-out sinks
//! - [`metrics`] - Publication gauges and counters
//! - [`result_pool`] - Per-block transaction result scratch map
//! - [`config`] / [`logging`] - YAML configuration and tracing setup

// Core types - must be first!
pub mod core_types;

pub mod config;
pub mod logging;

// Records
pub mod messages;
pub mod models;

// Pipeline components
pub mod dispatch;
pub mod encoder;
pub mod fee_correlator;
pub mod metrics;
pub mod order_tracking;
pub mod pipeline;
pub mod result_pool;
pub mod sink;
pub mod snapshot;

// Convenient re-exports at crate root
pub use config::{AppConfig, PublicationConfig};
pub use core_types::{Address, Height, OrderId, Price, Qty, Symbol, TimestampMs};
pub use fee_correlator::{CorrelationError, CorrelationOutput, FeeCorrelator, FeeEventCollector};
pub use messages::{MarketDataMessage, MsgKind};
pub use models::{ChangeType, Fee, OrderChange, OrderInfo, Side, TimeInForce, Trade};
pub use order_tracking::{OrderRemoval, OrderTracker};
pub use pipeline::{HandoffQueue, MarketDataPipeline, PipelineError};
pub use result_pool::{ResultPool, TxResult};
pub use sink::{MarketDataSink, SinkError, build_sink};
pub use snapshot::{BlockInfoToPublish, SettlementOutputs};
