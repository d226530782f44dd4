//! Durable event storage.
//!
//! The pipeline talks to storage only through [`EventStore`], which exposes
//! the handful of query shapes ingestion, delivery, and reconciliation need.
//! [`SqliteEventStore`] is the production implementation.

mod schema;
mod sqlite;

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeSet;
use thiserror::Error;
use types::delivery::DeliveryStatus;
use types::event::{EventType, IndexedEvent};
use types::ids::TxHash;

pub use sqlite::SqliteEventStore;

/// Errors raised by the event store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("event {tx_hash} already stored as {stored}, refusing to overwrite as {incoming}")]
    TypeConflict {
        tx_hash: TxHash,
        stored: EventType,
        incoming: EventType,
    },

    #[error("event {0} not found")]
    NotFound(TxHash),

    #[error("block number {0} exceeds storage range")]
    BlockOutOfRange(u64),

    #[error("corrupt row {tx_hash}: {reason}")]
    Corrupt { tx_hash: String, reason: String },
}

/// A persisted event with its delivery bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoredEvent {
    pub event: IndexedEvent,
    /// `None` while delivery is unresolved
    pub delivery_status: Option<DeliveryStatus>,
    /// Times the event was submitted to the orderbook
    pub delivery_attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Storage contract for the ingestion pipeline.
///
/// Implementations must make `upsert` idempotent by transaction hash and
/// must never touch `delivery_status` from `upsert`.
pub trait EventStore: Send + Sync {
    /// Insert the event, or overwrite the row with the same transaction hash.
    fn upsert(&self, event: &IndexedEvent) -> Result<(), StoreError>;

    /// Highest block number stored for the type.
    fn max_block(&self, event_type: EventType) -> Result<Option<u64>, StoreError>;

    /// Transaction hashes already stored for the type at exactly `block_number`.
    fn hashes_at_block(
        &self,
        event_type: EventType,
        block_number: u64,
    ) -> Result<BTreeSet<TxHash>, StoreError>;

    /// Up to `limit` events of the type whose delivery status is unset,
    /// least-attempted first, then by block number and transaction hash.
    fn pending_delivery(
        &self,
        event_type: EventType,
        limit: usize,
    ) -> Result<Vec<IndexedEvent>, StoreError>;

    /// Count one orderbook submission for each event, whatever its outcome.
    /// Unknown hashes are ignored.
    fn record_attempts(&self, tx_hashes: &[TxHash]) -> Result<(), StoreError>;

    fn set_delivery_status(
        &self,
        tx_hash: &TxHash,
        status: &DeliveryStatus,
    ) -> Result<(), StoreError>;

    fn get(&self, tx_hash: &TxHash) -> Result<Option<StoredEvent>, StoreError>;

    fn count(&self, event_type: EventType) -> Result<u64, StoreError>;
}
