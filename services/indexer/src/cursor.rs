//! Per-type ingestion cursor.
//!
//! The cursor is the highest block number known to be durably stored for one
//! event type. It lives in memory and is initialized lazily from storage on
//! the first cycle after process start.

use parking_lot::Mutex;
use tracing::{info, warn};
use types::event::EventType;

use crate::store::{EventStore, StoreError};

/// Cursor used when nothing has been stored for a type yet.
pub const DEFAULT_START_BLOCK: u64 = 1;

/// Read the persisted high-water mark for `event_type`.
pub fn fetch_cursor(store: &dyn EventStore, event_type: EventType) -> Result<u64, StoreError> {
    Ok(store.max_block(event_type)?.unwrap_or(DEFAULT_START_BLOCK))
}

/// In-memory cursor for one event type.
#[derive(Debug)]
pub struct CursorState {
    event_type: EventType,
    block: Mutex<Option<u64>>,
}

impl CursorState {
    pub fn new(event_type: EventType) -> Self {
        Self {
            event_type,
            block: Mutex::new(None),
        }
    }

    /// Current value, or `None` before the first initialization.
    pub fn get(&self) -> Option<u64> {
        *self.block.lock()
    }

    /// Return the cursor, loading it from storage if unset.
    pub fn get_or_init(&self, store: &dyn EventStore) -> Result<u64, StoreError> {
        let mut block = self.block.lock();
        if let Some(current) = *block {
            return Ok(current);
        }

        let loaded = fetch_cursor(store, self.event_type)?;
        info!(
            event_type = self.event_type.as_str(),
            cursor = loaded,
            "Cursor initialized from store"
        );
        *block = Some(loaded);
        Ok(loaded)
    }

    /// Move the cursor to `block_number` after that event was persisted.
    ///
    /// Never moves backwards.
    pub fn advance(&self, block_number: u64) {
        let mut block = self.block.lock();
        match *block {
            Some(current) if block_number < current => {
                warn!(
                    event_type = self.event_type.as_str(),
                    cursor = current,
                    received = block_number,
                    "Ignoring cursor regression"
                );
            }
            _ => *block = Some(block_number),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteEventStore;
    use crate::testing::{cancel_event, match_event};

    #[test]
    fn test_fetch_cursor_defaults_to_one() {
        let store = SqliteEventStore::open_in_memory().unwrap();
        assert_eq!(fetch_cursor(&store, EventType::Match).unwrap(), 1);
    }

    #[test]
    fn test_fetch_cursor_reads_max_block_for_type() {
        let store = SqliteEventStore::open_in_memory().unwrap();
        store.upsert(&match_event("0x01", 40)).unwrap();
        store.upsert(&match_event("0x02", 42)).unwrap();
        store.upsert(&cancel_event("0x03", 90)).unwrap();

        assert_eq!(fetch_cursor(&store, EventType::Match).unwrap(), 42);
        assert_eq!(fetch_cursor(&store, EventType::Cancel).unwrap(), 90);
    }

    #[test]
    fn test_lazy_init_happens_once() {
        let store = SqliteEventStore::open_in_memory().unwrap();
        store.upsert(&match_event("0x01", 40)).unwrap();

        let cursor = CursorState::new(EventType::Match);
        assert_eq!(cursor.get(), None);
        assert_eq!(cursor.get_or_init(&store).unwrap(), 40);

        // Later rows do not re-initialize an already-set cursor
        store.upsert(&match_event("0x02", 45)).unwrap();
        assert_eq!(cursor.get_or_init(&store).unwrap(), 40);
    }

    #[test]
    fn test_advance_is_monotonic() {
        let cursor = CursorState::new(EventType::Cancel);
        cursor.advance(10);
        cursor.advance(10);
        cursor.advance(12);
        cursor.advance(11);

        assert_eq!(cursor.get(), Some(12));
    }
}
