//! Message encoding
//!
//! Bus payload layout:
//!
//! ```text
//! ┌──────────────┬──────────────────────────────┐
//! │ version (u8) │ bincode(record of the kind)  │
//! └──────────────┴──────────────────────────────┘
//! ```
//!
//! The version byte is [`MsgKind::schema_version`]; consumers select the
//! record layout by (kind from the message key, version byte).
//!
//! File lines are JSON: `{"kind":"Books","key":"...","payload":{...}}`.

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::core_types::{Height, TimestampMs};
use crate::messages::{MarketDataMessage, MsgKind};

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("message of kind {actual} submitted as {expected}")]
    KindMismatch { expected: MsgKind, actual: MsgKind },
    #[error("binary encoding failed: {0}")]
    Binary(#[from] bincode::Error),
    #[error("json encoding failed: {0}")]
    Json(#[from] serde_json::Error),
    #[error("empty payload")]
    Empty,
    #[error("unsupported schema version {version} for {kind}")]
    UnsupportedVersion { kind: MsgKind, version: u8 },
}

/// Bus message key: `{height}_{timestamp}_{KindName}`
pub fn message_key(height: Height, timestamp: TimestampMs, kind: MsgKind) -> String {
    format!("{}_{}_{}", height, timestamp, kind.as_str())
}

fn check_kind(msg: &MarketDataMessage, kind: MsgKind) -> Result<(), EncodeError> {
    if msg.kind() != kind {
        return Err(EncodeError::KindMismatch {
            expected: kind,
            actual: msg.kind(),
        });
    }
    Ok(())
}

/// Encode `msg` as the bus payload of `kind`
pub fn encode(msg: &MarketDataMessage, kind: MsgKind) -> Result<Vec<u8>, EncodeError> {
    check_kind(msg, kind)?;

    let mut buf = vec![kind.schema_version()];
    match msg {
        MarketDataMessage::ExecutionResults(m) => bincode::serialize_into(&mut buf, m)?,
        MarketDataMessage::Books(m) => bincode::serialize_into(&mut buf, m)?,
        MarketDataMessage::Accounts(m) => bincode::serialize_into(&mut buf, m)?,
        MarketDataMessage::BlockFee(m) => bincode::serialize_into(&mut buf, m)?,
    }
    Ok(buf)
}

/// Decode a bus payload into the record type of `kind`
pub fn decode<T: DeserializeOwned>(bytes: &[u8], kind: MsgKind) -> Result<T, EncodeError> {
    let (&version, body) = bytes.split_first().ok_or(EncodeError::Empty)?;
    if version != kind.schema_version() {
        return Err(EncodeError::UnsupportedVersion { kind, version });
    }
    Ok(bincode::deserialize(body)?)
}

#[derive(Serialize)]
struct JsonLine<'a> {
    kind: &'a str,
    key: &'a str,
    payload: &'a MarketDataMessage,
}

/// One line of the local market data file (no trailing newline)
pub fn encode_json_line(
    msg: &MarketDataMessage,
    kind: MsgKind,
    height: Height,
    timestamp: TimestampMs,
) -> Result<String, EncodeError> {
    check_kind(msg, kind)?;
    let key = message_key(height, timestamp, kind);
    Ok(serde_json::to_string(&JsonLine {
        kind: kind.as_str(),
        key: &key,
        payload: msg,
    })?)
}
