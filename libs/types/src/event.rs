//! Marketplace order events
//!
//! Two event streams are indexed: order matches and order cancels. Both
//! share the transaction envelope (hash, sender, value, block coordinates);
//! the payload carries the type-specific fields. The event type is derived
//! from the payload, so it cannot change for a given record.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::errors::TypeError;
use crate::ids::{Address, OrderHash, TxHash};

/// Kind of indexed event; each kind has an independent cursor and guard
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Match,
    Cancel,
}

impl EventType {
    pub const ALL: [EventType; 2] = [EventType::Match, EventType::Cancel];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Match => "match",
            EventType::Cancel => "cancel",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "match" => Ok(EventType::Match),
            "cancel" => Ok(EventType::Cancel),
            other => Err(TypeError::UnknownEventType(other.to_string())),
        }
    }
}

/// Two orders matched on-chain
///
/// Fill amounts are decimal strings as emitted by the chain (uint256).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderMatch {
    pub left_order_hash: OrderHash,
    pub right_order_hash: OrderHash,
    pub left_maker: Address,
    pub right_maker: Address,
    pub new_left_fill: String,
    pub new_right_fill: String,
    pub left_asset_class: String,
    pub right_asset_class: String,
    pub left_asset_data: String,
    pub right_asset_data: String,
}

/// An order was canceled on-chain by its maker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderCancel {
    pub left_order_hash: OrderHash,
    pub left_maker: Address,
}

/// Type-specific event fields
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum EventPayload {
    Match(OrderMatch),
    Cancel(OrderCancel),
}

/// One upstream event, ready to be persisted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexedEvent {
    /// Primary key; globally unique, never reused
    pub tx_hash: TxHash,
    pub tx_from: Address,
    pub tx_value: String,
    pub block_number: u64,
    pub block_timestamp: i64,
    pub payload: EventPayload,
}

impl IndexedEvent {
    pub fn event_type(&self) -> EventType {
        match self.payload {
            EventPayload::Match(_) => EventType::Match,
            EventPayload::Cancel(_) => EventType::Cancel,
        }
    }

    /// Order hash every event type carries
    pub fn left_order_hash(&self) -> &OrderHash {
        match &self.payload {
            EventPayload::Match(m) => &m.left_order_hash,
            EventPayload::Cancel(c) => &c.left_order_hash,
        }
    }

    pub fn left_maker(&self) -> &Address {
        match &self.payload {
            EventPayload::Match(m) => &m.left_maker,
            EventPayload::Cancel(c) => &c.left_maker,
        }
    }
}
