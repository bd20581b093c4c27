//! Core types used throughout the publication pipeline
//!
//! Fundamental aliases shared by the correlator, the snapshot assembler and the
//! published record types. Quantities and prices are raw scaled integers as
//! produced by the settlement engine; the pipeline never rescales them.

/// Block height.
///
/// # Usage:
/// - Ordering key of the publication queue (strictly increasing)
/// - Prefix of trade ids (`"{height}-{n}"`) and bus message keys
pub type Height = i64;

/// Milliseconds since the Unix epoch (block time).
pub type TimestampMs = i64;

/// Scaled price (e.g. 1e8 == 1.0)
pub type Price = i64;

/// Scaled quantity
pub type Qty = i64;

/// Fee amount in the smallest unit of its asset.
///
/// `-1` is reserved by the fee correlator as "side not yet observed";
/// a resolved fee may legitimately be zero.
pub type FeeAmount = i64;

/// Order id - unique across the chain (assigned by the order submitter)
pub type OrderId = String;

/// Trading pair symbol, e.g. `XYZ-000_BNB`
pub type Symbol = String;

/// Account address (bech32 or raw string form)
pub type Address = String;

/// Asset denomination, e.g. `BNB`
pub type Asset = String;

/// Transaction hash (hex)
pub type TxHash = String;
