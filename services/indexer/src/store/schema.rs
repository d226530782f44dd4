//! SQLite schema for the event store.
//!
//! One table holds both event types; type-specific columns are nullable and
//! left unset for the type that does not carry them.

use rusqlite::{Connection, Result};

/// Current schema version. Increment when making breaking changes.
pub const SCHEMA_VERSION: i32 = 2;

/// Create tables on a fresh database, or migrate an existing one.
pub fn init_schema(conn: &Connection) -> Result<()> {
    let current_version = get_schema_version(conn)?;

    if current_version == 0 {
        create_tables(conn)?;
        set_schema_version(conn, SCHEMA_VERSION)?;
    } else if current_version < SCHEMA_VERSION {
        migrate(conn, current_version)?;
        set_schema_version(conn, SCHEMA_VERSION)?;
    }

    Ok(())
}

fn migrate(conn: &Connection, from_version: i32) -> Result<()> {
    if from_version < 2 {
        conn.execute_batch(
            r#"
            ALTER TABLE marketplace_events
                ADD COLUMN delivery_attempts INTEGER NOT NULL DEFAULT 0;
            DROP INDEX IF EXISTS idx_events_pending;
            CREATE INDEX IF NOT EXISTS idx_events_pending
                ON marketplace_events(event_type, delivery_attempts, block_number)
                WHERE delivery_status IS NULL;
            "#,
        )?;
    }
    Ok(())
}

/// Get the current schema version (0 if not initialized).
pub fn get_schema_version(conn: &Connection) -> Result<i32> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER NOT NULL
        )",
        [],
    )?;

    let version: Option<i32> = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
            row.get(0)
        })
        .ok();

    Ok(version.unwrap_or(0))
}

fn set_schema_version(conn: &Connection, version: i32) -> Result<()> {
    conn.execute("DELETE FROM schema_version", [])?;
    conn.execute("INSERT INTO schema_version (version) VALUES (?)", [version])?;
    Ok(())
}

fn create_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS marketplace_events (
            tx_hash TEXT PRIMARY KEY,
            event_type TEXT NOT NULL CHECK (event_type IN ('match', 'cancel')),
            block_number INTEGER NOT NULL CHECK (block_number >= 0),
            block_timestamp INTEGER NOT NULL,
            tx_from TEXT NOT NULL,
            tx_value TEXT NOT NULL,
            left_order_hash TEXT NOT NULL,
            left_maker TEXT NOT NULL,
            right_order_hash TEXT,
            right_maker TEXT,
            new_left_fill TEXT,
            new_right_fill TEXT,
            left_asset_class TEXT,
            right_asset_class TEXT,
            left_asset_data TEXT,
            right_asset_data TEXT,
            -- NULL until the orderbook reports an outcome
            delivery_status TEXT,
            -- Forwarder submissions so far; sweeps pick the least-tried rows first
            delivery_attempts INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_events_block_number
            ON marketplace_events(block_number);
        CREATE INDEX IF NOT EXISTS idx_events_block_timestamp
            ON marketplace_events(block_timestamp);
        CREATE INDEX IF NOT EXISTS idx_events_left_order_hash
            ON marketplace_events(left_order_hash);
        CREATE INDEX IF NOT EXISTS idx_events_right_order_hash
            ON marketplace_events(right_order_hash);
        CREATE INDEX IF NOT EXISTS idx_events_left_maker
            ON marketplace_events(left_maker);
        CREATE INDEX IF NOT EXISTS idx_events_type_block
            ON marketplace_events(event_type, block_number);
        CREATE INDEX IF NOT EXISTS idx_events_pending
            ON marketplace_events(event_type, delivery_attempts, block_number)
            WHERE delivery_status IS NULL;
        "#,
    )?;

    Ok(())
}
