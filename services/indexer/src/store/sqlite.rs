//! SQLite-backed event store.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::BTreeSet;
use std::path::Path;
use tracing::{debug, info};
use types::delivery::DeliveryStatus;
use types::event::{EventPayload, EventType, IndexedEvent, OrderCancel, OrderMatch};
use types::ids::{Address, OrderHash, TxHash};

use super::{schema, EventStore, StoreError, StoredEvent};

const COLUMNS: &str = "tx_hash, event_type, block_number, block_timestamp, tx_from, tx_value, \
     left_order_hash, left_maker, right_order_hash, right_maker, new_left_fill, new_right_fill, \
     left_asset_class, right_asset_class, left_asset_data, right_asset_data, \
     delivery_status, delivery_attempts, created_at, updated_at";

// The WHERE clause turns a cross-type overwrite into a no-op, which the
// caller detects through the changed-row count.
const UPSERT_SQL: &str = "INSERT INTO marketplace_events (
        tx_hash, event_type, block_number, block_timestamp, tx_from, tx_value,
        left_order_hash, left_maker, right_order_hash, right_maker, new_left_fill, new_right_fill,
        left_asset_class, right_asset_class, left_asset_data, right_asset_data,
        created_at, updated_at
    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?17)
    ON CONFLICT(tx_hash) DO UPDATE SET
        block_number = excluded.block_number,
        block_timestamp = excluded.block_timestamp,
        tx_from = excluded.tx_from,
        tx_value = excluded.tx_value,
        left_order_hash = excluded.left_order_hash,
        left_maker = excluded.left_maker,
        right_order_hash = excluded.right_order_hash,
        right_maker = excluded.right_maker,
        new_left_fill = excluded.new_left_fill,
        new_right_fill = excluded.new_right_fill,
        left_asset_class = excluded.left_asset_class,
        right_asset_class = excluded.right_asset_class,
        left_asset_data = excluded.left_asset_data,
        right_asset_data = excluded.right_asset_data,
        updated_at = excluded.updated_at
    WHERE marketplace_events.event_type = excluded.event_type";

/// Event store on a single SQLite connection.
pub struct SqliteEventStore {
    /// SQLite connection (protected by mutex for thread safety).
    conn: Mutex<Connection>,
}

impl SqliteEventStore {
    /// Open or create the store at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        schema::init_schema(&conn)?;

        info!(path = %path.display(), "Event store opened");

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        schema::init_schema(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn now_millis() -> i64 {
        Utc::now().timestamp_millis()
    }
}

impl EventStore for SqliteEventStore {
    fn upsert(&self, event: &IndexedEvent) -> Result<(), StoreError> {
        let block_number = i64::try_from(event.block_number)
            .map_err(|_| StoreError::BlockOutOfRange(event.block_number))?;
        let cols = PayloadColumns::from_payload(&event.payload);
        let incoming = event.event_type();
        let now = Self::now_millis();

        let conn = self.conn.lock();
        let changed = conn.execute(
            UPSERT_SQL,
            params![
                event.tx_hash.as_str(),
                incoming.as_str(),
                block_number,
                event.block_timestamp,
                event.tx_from.as_str(),
                event.tx_value,
                cols.left_order_hash,
                cols.left_maker,
                cols.right_order_hash,
                cols.right_maker,
                cols.new_left_fill,
                cols.new_right_fill,
                cols.left_asset_class,
                cols.right_asset_class,
                cols.left_asset_data,
                cols.right_asset_data,
                now,
            ],
        )?;

        if changed == 0 {
            let stored: String = conn.query_row(
                "SELECT event_type FROM marketplace_events WHERE tx_hash = ?1",
                params![event.tx_hash.as_str()],
                |row| row.get(0),
            )?;
            return Err(StoreError::TypeConflict {
                tx_hash: event.tx_hash.clone(),
                stored: parse_event_type(event.tx_hash.as_str(), &stored)?,
                incoming,
            });
        }

        debug!(
            tx_hash = %event.tx_hash,
            event_type = incoming.as_str(),
            block_number = event.block_number,
            "Event upserted"
        );
        Ok(())
    }

    fn max_block(&self, event_type: EventType) -> Result<Option<u64>, StoreError> {
        let conn = self.conn.lock();
        let max: Option<i64> = conn.query_row(
            "SELECT MAX(block_number) FROM marketplace_events WHERE event_type = ?1",
            params![event_type.as_str()],
            |row| row.get(0),
        )?;

        max.map(|block| {
            u64::try_from(block).map_err(|_| StoreError::Corrupt {
                tx_hash: String::new(),
                reason: format!("negative block number {block}"),
            })
        })
        .transpose()
    }

    fn hashes_at_block(
        &self,
        event_type: EventType,
        block_number: u64,
    ) -> Result<BTreeSet<TxHash>, StoreError> {
        let block = i64::try_from(block_number)
            .map_err(|_| StoreError::BlockOutOfRange(block_number))?;

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT tx_hash FROM marketplace_events WHERE event_type = ?1 AND block_number = ?2",
        )?;
        let raw: Vec<String> = stmt
            .query_map(params![event_type.as_str(), block], |row| row.get(0))?
            .collect::<rusqlite::Result<_>>()?;

        raw.into_iter()
            .map(|hash| {
                TxHash::parse(hash.as_str()).map_err(|e| StoreError::Corrupt {
                    tx_hash: hash.clone(),
                    reason: e.to_string(),
                })
            })
            .collect()
    }

    fn pending_delivery(
        &self,
        event_type: EventType,
        limit: usize,
    ) -> Result<Vec<IndexedEvent>, StoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM marketplace_events
             WHERE event_type = ?1 AND delivery_status IS NULL
             ORDER BY delivery_attempts ASC, block_number ASC, tx_hash ASC
             LIMIT ?2"
        ))?;
        let rows: Vec<EventRow> = stmt
            .query_map(params![event_type.as_str(), limit], EventRow::read)?
            .collect::<rusqlite::Result<_>>()?;

        rows.into_iter()
            .map(|row| row.into_stored().map(|stored| stored.event))
            .collect()
    }

    fn record_attempts(&self, tx_hashes: &[TxHash]) -> Result<(), StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "UPDATE marketplace_events SET delivery_attempts = delivery_attempts + 1
                 WHERE tx_hash = ?1",
            )?;
            for tx_hash in tx_hashes {
                stmt.execute(params![tx_hash.as_str()])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn set_delivery_status(
        &self,
        tx_hash: &TxHash,
        status: &DeliveryStatus,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE marketplace_events SET delivery_status = ?1, updated_at = ?2 WHERE tx_hash = ?3",
            params![status.as_str(), Self::now_millis(), tx_hash.as_str()],
        )?;

        if changed == 0 {
            return Err(StoreError::NotFound(tx_hash.clone()));
        }
        Ok(())
    }

    fn get(&self, tx_hash: &TxHash) -> Result<Option<StoredEvent>, StoreError> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                &format!("SELECT {COLUMNS} FROM marketplace_events WHERE tx_hash = ?1"),
                params![tx_hash.as_str()],
                EventRow::read,
            )
            .optional()?;

        row.map(EventRow::into_stored).transpose()
    }

    fn count(&self, event_type: EventType) -> Result<u64, StoreError> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM marketplace_events WHERE event_type = ?1",
            params![event_type.as_str()],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }
}

/// Payload fields flattened onto the nullable table columns.
struct PayloadColumns<'a> {
    left_order_hash: &'a str,
    left_maker: &'a str,
    right_order_hash: Option<&'a str>,
    right_maker: Option<&'a str>,
    new_left_fill: Option<&'a str>,
    new_right_fill: Option<&'a str>,
    left_asset_class: Option<&'a str>,
    right_asset_class: Option<&'a str>,
    left_asset_data: Option<&'a str>,
    right_asset_data: Option<&'a str>,
}

impl<'a> PayloadColumns<'a> {
    fn from_payload(payload: &'a EventPayload) -> Self {
        match payload {
            EventPayload::Match(m) => Self {
                left_order_hash: m.left_order_hash.as_str(),
                left_maker: m.left_maker.as_str(),
                right_order_hash: Some(m.right_order_hash.as_str()),
                right_maker: Some(m.right_maker.as_str()),
                new_left_fill: Some(&m.new_left_fill),
                new_right_fill: Some(&m.new_right_fill),
                left_asset_class: Some(&m.left_asset_class),
                right_asset_class: Some(&m.right_asset_class),
                left_asset_data: Some(&m.left_asset_data),
                right_asset_data: Some(&m.right_asset_data),
            },
            EventPayload::Cancel(c) => Self {
                left_order_hash: c.left_order_hash.as_str(),
                left_maker: c.left_maker.as_str(),
                right_order_hash: None,
                right_maker: None,
                new_left_fill: None,
                new_right_fill: None,
                left_asset_class: None,
                right_asset_class: None,
                left_asset_data: None,
                right_asset_data: None,
            },
        }
    }
}

/// Raw row in `COLUMNS` order.
struct EventRow {
    tx_hash: String,
    event_type: String,
    block_number: i64,
    block_timestamp: i64,
    tx_from: String,
    tx_value: String,
    left_order_hash: String,
    left_maker: String,
    right_order_hash: Option<String>,
    right_maker: Option<String>,
    new_left_fill: Option<String>,
    new_right_fill: Option<String>,
    left_asset_class: Option<String>,
    right_asset_class: Option<String>,
    left_asset_data: Option<String>,
    right_asset_data: Option<String>,
    delivery_status: Option<String>,
    delivery_attempts: i64,
    created_at: i64,
    updated_at: i64,
}

impl EventRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            tx_hash: row.get(0)?,
            event_type: row.get(1)?,
            block_number: row.get(2)?,
            block_timestamp: row.get(3)?,
            tx_from: row.get(4)?,
            tx_value: row.get(5)?,
            left_order_hash: row.get(6)?,
            left_maker: row.get(7)?,
            right_order_hash: row.get(8)?,
            right_maker: row.get(9)?,
            new_left_fill: row.get(10)?,
            new_right_fill: row.get(11)?,
            left_asset_class: row.get(12)?,
            right_asset_class: row.get(13)?,
            left_asset_data: row.get(14)?,
            right_asset_data: row.get(15)?,
            delivery_status: row.get(16)?,
            delivery_attempts: row.get(17)?,
            created_at: row.get(18)?,
            updated_at: row.get(19)?,
        })
    }

    fn into_stored(self) -> Result<StoredEvent, StoreError> {
        let corrupt = |reason: String| StoreError::Corrupt {
            tx_hash: self.tx_hash.clone(),
            reason,
        };

        let tx_hash = TxHash::parse(self.tx_hash.as_str()).map_err(|e| corrupt(e.to_string()))?;
        let block_number = u64::try_from(self.block_number)
            .map_err(|_| corrupt(format!("negative block number {}", self.block_number)))?;
        let delivery_status = self
            .delivery_status
            .as_deref()
            .map(DeliveryStatus::parse)
            .transpose()
            .map_err(|e| corrupt(e.to_string()))?;
        let delivery_attempts = u32::try_from(self.delivery_attempts)
            .map_err(|_| corrupt(format!("invalid delivery_attempts {}", self.delivery_attempts)))?;
        let created_at = millis_to_datetime(self.created_at)
            .ok_or_else(|| corrupt(format!("invalid created_at {}", self.created_at)))?;
        let updated_at = millis_to_datetime(self.updated_at)
            .ok_or_else(|| corrupt(format!("invalid updated_at {}", self.updated_at)))?;

        let payload = match parse_event_type(&self.tx_hash, &self.event_type)? {
            EventType::Match => {
                let required = |value: Option<String>, column: &str| {
                    value.ok_or_else(|| corrupt(format!("match row missing {column}")))
                };
                EventPayload::Match(OrderMatch {
                    left_order_hash: OrderHash::new(self.left_order_hash),
                    left_maker: Address::new(self.left_maker),
                    right_order_hash: OrderHash::new(required(
                        self.right_order_hash,
                        "right_order_hash",
                    )?),
                    right_maker: Address::new(required(self.right_maker, "right_maker")?),
                    new_left_fill: required(self.new_left_fill, "new_left_fill")?,
                    new_right_fill: required(self.new_right_fill, "new_right_fill")?,
                    left_asset_class: self.left_asset_class.unwrap_or_default(),
                    right_asset_class: self.right_asset_class.unwrap_or_default(),
                    left_asset_data: self.left_asset_data.unwrap_or_default(),
                    right_asset_data: self.right_asset_data.unwrap_or_default(),
                })
            }
            EventType::Cancel => EventPayload::Cancel(OrderCancel {
                left_order_hash: OrderHash::new(self.left_order_hash),
                left_maker: Address::new(self.left_maker),
            }),
        };

        Ok(StoredEvent {
            event: IndexedEvent {
                tx_hash,
                tx_from: Address::new(self.tx_from),
                tx_value: self.tx_value,
                block_number,
                block_timestamp: self.block_timestamp,
                payload,
            },
            delivery_status,
            delivery_attempts,
            created_at,
            updated_at,
        })
    }
}

fn parse_event_type(tx_hash: &str, raw: &str) -> Result<EventType, StoreError> {
    raw.parse().map_err(|e: types::errors::TypeError| StoreError::Corrupt {
        tx_hash: tx_hash.to_string(),
        reason: e.to_string(),
    })
}

fn millis_to_datetime(millis: i64) -> Option<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(millis)
}
