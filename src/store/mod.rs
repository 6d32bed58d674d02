//! Telemetry persistence using SQLite.
//!
//! Holds the administrative device table plus one `<kind>_data` /
//! `<kind>_data_values` table pair per registered kind. Collection and value
//! rows are append-only and always commit as one transaction.
//!
//! # Schema
//! ```sql
//! CREATE TABLE devices (
//!     id          TEXT PRIMARY KEY, -- UUID
//!     name        TEXT UNIQUE NOT NULL,
//!     kind        TEXT NOT NULL,
//!     attributes  TEXT,             -- JSON-encoded, opaque to the core
//!     last_update TEXT              -- ISO 8601, touched on every commit
//! );
//! CREATE TABLE <kind>_data (
//!     id          INTEGER PRIMARY KEY,
//!     device_id   TEXT NOT NULL,
//!     recorded_at TEXT NOT NULL     -- ISO 8601
//! );
//! CREATE TABLE <kind>_data_values (
//!     id            INTEGER PRIMARY KEY,
//!     collection_id INTEGER NOT NULL REFERENCES <kind>_data(id),
//!     position      INTEGER NOT NULL, -- preserves reading order
//!     name          TEXT NOT NULL,
//!     value         REAL NOT NULL
//! );
//! ```
//!
//! # Thread Safety
//! - Connection is wrapped in Mutex for safe concurrent access
//! - SQLite ACID guarantees prevent partial collection inserts

use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde_json::Value;
use uuid::Uuid;

use crate::device::Reading;
use crate::schema::{KindSchema, SchemaError};

/// Administrative device row.
#[derive(Clone, Debug, PartialEq)]
pub struct DeviceRecord {
    pub id: Uuid,
    pub name: String,
    pub kind: String,
    /// Opaque kind-specific attributes, round-tripped unchanged
    pub attributes: Value,
    pub last_update: Option<DateTime<Utc>>,
}

/// One persisted collection with its values, in position order.
#[derive(Clone, Debug, PartialEq)]
pub struct StoredCollection {
    pub id: i64,
    pub recorded_at: DateTime<Utc>,
    pub values: Vec<Reading>,
}

/// SQLite-backed telemetry store.
pub struct TelemetryStore {
    conn: Mutex<Connection>,
}

impl TelemetryStore {
    /// Opens (or creates) the database and ensures the devices table exists.
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open(db_path).context("Failed to open telemetry database")?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS devices (
                id          TEXT PRIMARY KEY,
                name        TEXT UNIQUE NOT NULL,
                kind        TEXT NOT NULL,
                attributes  TEXT,
                last_update TEXT
            );",
        )
        .context("Failed to create devices table")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory store, used by tests.
    pub fn in_memory() -> Result<Self> {
        Self::open(":memory:")
    }

    /// Inserts or refreshes a device row. `last_update` is never clobbered
    /// here; only collection commits advance it.
    pub fn upsert_device(&self, device: &DeviceRecord) -> Result<()> {
        let attributes = match &device.attributes {
            Value::Null => None,
            other => Some(serde_json::to_string(other).context("Failed to encode attributes")?),
        };
        self.conn
            .lock()
            .unwrap()
            .execute(
                "INSERT INTO devices (id, name, kind, attributes, last_update)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(id) DO UPDATE SET
                     name = excluded.name,
                     kind = excluded.kind,
                     attributes = excluded.attributes",
                params![
                    device.id.to_string(),
                    device.name,
                    device.kind,
                    attributes,
                    device.last_update.map(|dt| dt.to_rfc3339()),
                ],
            )
            .context("Failed to upsert device")?;
        Ok(())
    }

    /// Point lookup of a device by its unique name.
    pub fn load_device(&self, name: &str) -> Result<Option<DeviceRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT id, name, kind, attributes, last_update FROM devices WHERE name = ?1",
            )
            .context("Failed to prepare device lookup")?;

        let mut rows = stmt
            .query(params![name])
            .context("Failed to query device")?;

        let row = match rows.next().context("Failed to read device row")? {
            Some(row) => row,
            None => return Ok(None),
        };

        let id: String = row.get(0)?;
        let name: String = row.get(1)?;
        let kind: String = row.get(2)?;
        let attributes: Option<String> = row.get(3)?;
        let last_update: Option<String> = row.get(4)?;

        let id = Uuid::parse_str(&id)
            .with_context(|| format!("Failed to parse device id for '{}'", name))?;
        let attributes = match attributes {
            Some(json) => serde_json::from_str(&json)
                .with_context(|| format!("Failed to decode attributes for '{}'", name))?,
            None => Value::Null,
        };
        let last_update = last_update
            .map(|s| {
                DateTime::parse_from_rfc3339(&s).map(|dt| dt.with_timezone(&Utc))
            })
            .transpose()
            .with_context(|| format!("Failed to parse last_update for '{}'", name))?;

        Ok(Some(DeviceRecord {
            id,
            name,
            kind,
            attributes,
            last_update,
        }))
    }

    /// Creates a kind's table pair, checking derived names against existing
    /// tables first. Shape mismatches fail before any DDL runs.
    pub fn ensure_kind_tables(&self, schema: &KindSchema) -> Result<(), SchemaError> {
        let conn = self.conn.lock().unwrap();
        check_table_shape(&conn, &schema.data_table, &["id", "device_id", "recorded_at"])?;
        check_table_shape(
            &conn,
            &schema.values_table,
            &["id", "collection_id", "position", "name", "value"],
        )?;

        // Table names come from a validated kind identifier, so
        // interpolation is safe here.
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {data} (
                id          INTEGER PRIMARY KEY,
                device_id   TEXT NOT NULL,
                recorded_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_{data}_device ON {data}(device_id, recorded_at);
            CREATE TABLE IF NOT EXISTS {values} (
                id            INTEGER PRIMARY KEY,
                collection_id INTEGER NOT NULL REFERENCES {data}(id),
                position      INTEGER NOT NULL,
                name          TEXT NOT NULL,
                value         REAL NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_{values}_collection ON {values}(collection_id);",
            data = schema.data_table,
            values = schema.values_table,
        ))
        .map_err(|e| SchemaError::Storage(e.to_string()))?;
        Ok(())
    }

    /// Inserts one collection row plus one value row per reading, and
    /// touches the device's `last_update`, all in a single transaction.
    /// Either every row lands or none does.
    pub fn insert_collection(
        &self,
        schema: &KindSchema,
        device_id: Uuid,
        recorded_at: DateTime<Utc>,
        readings: &[Reading],
    ) -> Result<i64> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn
            .transaction()
            .context("Failed to begin collection transaction")?;

        tx.execute(
            &format!(
                "INSERT INTO {} (device_id, recorded_at) VALUES (?1, ?2)",
                schema.data_table
            ),
            params![device_id.to_string(), recorded_at.to_rfc3339()],
        )
        .context("Failed to insert collection")?;
        let collection_id = tx.last_insert_rowid();

        {
            let mut stmt = tx
                .prepare(&format!(
                    "INSERT INTO {} (collection_id, position, name, value)
                     VALUES (?1, ?2, ?3, ?4)",
                    schema.values_table
                ))
                .context("Failed to prepare value insert")?;
            for (position, reading) in readings.iter().enumerate() {
                stmt.execute(params![
                    collection_id,
                    position as i64,
                    reading.name,
                    reading.value
                ])
                .context("Failed to insert value")?;
            }
        }

        tx.execute(
            "UPDATE devices SET last_update = ?1 WHERE id = ?2",
            params![recorded_at.to_rfc3339(), device_id.to_string()],
        )
        .context("Failed to touch device last_update")?;

        tx.commit().context("Failed to commit collection")?;
        Ok(collection_id)
    }

    /// Returns the most recent collection for a device, if any.
    pub fn latest_collection(
        &self,
        schema: &KindSchema,
        device_id: Uuid,
    ) -> Result<Option<StoredCollection>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT id, recorded_at FROM {} WHERE device_id = ?1 ORDER BY id DESC LIMIT 1",
                schema.data_table
            ))
            .context("Failed to prepare latest-collection lookup")?;

        let mut rows = stmt
            .query(params![device_id.to_string()])
            .context("Failed to query latest collection")?;

        let (id, recorded_at_str) = match rows.next().context("Failed to read collection row")? {
            Some(row) => {
                let id: i64 = row.get(0)?;
                let recorded_at: String = row.get(1)?;
                (id, recorded_at)
            }
            None => return Ok(None),
        };

        let recorded_at = DateTime::parse_from_rfc3339(&recorded_at_str)
            .map(|dt| dt.with_timezone(&Utc))
            .with_context(|| format!("Failed to parse recorded_at for collection {}", id))?;

        let mut stmt = conn
            .prepare(&format!(
                "SELECT name, value FROM {} WHERE collection_id = ?1 ORDER BY position ASC",
                schema.values_table
            ))
            .context("Failed to prepare values lookup")?;
        let values = stmt
            .query_map(params![id], |row| {
                Ok(Reading {
                    name: row.get(0)?,
                    value: row.get(1)?,
                })
            })
            .context("Failed to query values")?
            .collect::<Result<Vec<Reading>, _>>()
            .context("Failed to read value rows")?;

        Ok(Some(StoredCollection {
            id,
            recorded_at,
            values,
        }))
    }

    /// Number of collections committed for a device.
    pub fn collection_count(&self, schema: &KindSchema, device_id: Uuid) -> Result<u64> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn
            .query_row(
                &format!(
                    "SELECT COUNT(*) FROM {} WHERE device_id = ?1",
                    schema.data_table
                ),
                params![device_id.to_string()],
                |row| row.get(0),
            )
            .context("Failed to count collections")?;
        Ok(count as u64)
    }

    /// All collection ids for a device in commit order.
    pub fn collection_ids(&self, schema: &KindSchema, device_id: Uuid) -> Result<Vec<i64>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT id FROM {} WHERE device_id = ?1 ORDER BY id ASC",
                schema.data_table
            ))
            .context("Failed to prepare collection listing")?;
        let ids = stmt
            .query_map(params![device_id.to_string()], |row| row.get(0))
            .context("Failed to query collections")?
            .collect::<Result<Vec<i64>, _>>()
            .context("Failed to read collection ids")?;
        Ok(ids)
    }

    /// One stored collection by id, with values in position order.
    pub fn collection(&self, schema: &KindSchema, id: i64) -> Result<Option<StoredCollection>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT recorded_at FROM {} WHERE id = ?1",
                schema.data_table
            ))
            .context("Failed to prepare collection lookup")?;
        let mut rows = stmt.query(params![id]).context("Failed to query collection")?;
        let recorded_at_str: String = match rows.next().context("Failed to read collection")? {
            Some(row) => row.get(0)?,
            None => return Ok(None),
        };
        let recorded_at = DateTime::parse_from_rfc3339(&recorded_at_str)
            .map(|dt| dt.with_timezone(&Utc))
            .with_context(|| format!("Failed to parse recorded_at for collection {}", id))?;

        let mut stmt = conn
            .prepare(&format!(
                "SELECT name, value FROM {} WHERE collection_id = ?1 ORDER BY position ASC",
                schema.values_table
            ))
            .context("Failed to prepare values lookup")?;
        let values = stmt
            .query_map(params![id], |row| {
                Ok(Reading {
                    name: row.get(0)?,
                    value: row.get(1)?,
                })
            })
            .context("Failed to query values")?
            .collect::<Result<Vec<Reading>, _>>()
            .context("Failed to read value rows")?;

        Ok(Some(StoredCollection {
            id,
            recorded_at,
            values,
        }))
    }

    /// Column names of a table in declaration order; empty if the table does
    /// not exist. Used for conflict detection at registration time.
    pub(crate) fn table_columns(&self, table: &str) -> Result<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare("SELECT name FROM pragma_table_info(?1) ORDER BY cid")
            .context("Failed to prepare table introspection")?;
        let columns = stmt
            .query_map(params![table], |row| row.get(0))
            .context("Failed to introspect table")?
            .collect::<Result<Vec<String>, _>>()
            .context("Failed to read column names")?;
        Ok(columns)
    }

    #[cfg(test)]
    pub(crate) fn raw_batch(&self, sql: &str) -> Result<()> {
        self.conn
            .lock()
            .unwrap()
            .execute_batch(sql)
            .context("Failed to run raw batch")?;
        Ok(())
    }
}

fn check_table_shape(
    conn: &Connection,
    table: &str,
    expected: &[&str],
) -> Result<(), SchemaError> {
    let mut stmt = conn
        .prepare("SELECT name FROM pragma_table_info(?1) ORDER BY cid")
        .map_err(|e| SchemaError::Storage(e.to_string()))?;
    let columns = stmt
        .query_map(params![table], |row| row.get::<_, String>(0))
        .map_err(|e| SchemaError::Storage(e.to_string()))?
        .collect::<Result<Vec<String>, _>>()
        .map_err(|e| SchemaError::Storage(e.to_string()))?;

    if columns.is_empty() {
        // Table absent; nothing to conflict with
        return Ok(());
    }
    if columns != expected {
        return Err(SchemaError::Conflict {
            table: table.to_string(),
            detail: format!(
                "existing columns [{}], expected [{}]",
                columns.join(", "),
                expected.join(", ")
            ),
        });
    }
    Ok(())
}
