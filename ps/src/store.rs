//! SQLite-backed record store

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use eyre::{Context, Result, eyre};
use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, OptionalExtension, params, params_from_iter};
use tracing::{debug, info};

use crate::now_ms;
use crate::record::{Filter, IndexValue, Record};

/// File name of the database inside the store directory
pub const DB_FILE_NAME: &str = "patchstore.db";

const INDEX_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS record_indexes (
    collection TEXT NOT NULL,
    record_id  TEXT NOT NULL,
    field      TEXT NOT NULL,
    value_text TEXT,
    value_int  INTEGER,
    PRIMARY KEY (collection, record_id, field)
);
CREATE INDEX IF NOT EXISTS idx_record_indexes_lookup
    ON record_indexes (collection, field, value_text, value_int);
";

/// Record store over a single SQLite database
pub struct Store {
    conn: Connection,
    path: Option<PathBuf>,
    collections: HashSet<&'static str>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").field("path", &self.path).finish()
    }
}

impl Store {
    /// Open (or create) the store in the given directory
    pub fn open(store_dir: &Path) -> Result<Self> {
        debug!(?store_dir, "Store::open: called");
        std::fs::create_dir_all(store_dir)
            .context(format!("Failed to create store directory {}", store_dir.display()))?;
        let db_path = store_dir.join(DB_FILE_NAME);
        let conn = Connection::open(&db_path).context(format!("Failed to open {}", db_path.display()))?;
        // Several run processes share one database file
        conn.busy_timeout(Duration::from_secs(5))?;
        let store = Self::bootstrap(conn, Some(db_path))?;
        info!(path = ?store.path, "Opened store");
        Ok(store)
    }

    /// Open a private in-memory store
    pub fn open_in_memory() -> Result<Self> {
        debug!("Store::open_in_memory: called");
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Self::bootstrap(conn, None)
    }

    fn bootstrap(conn: Connection, path: Option<PathBuf>) -> Result<Self> {
        conn.execute_batch(INDEX_SCHEMA).context("Failed to create index schema")?;
        Ok(Self {
            conn,
            path,
            collections: HashSet::new(),
        })
    }

    /// Path of the database file (None for in-memory stores)
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn ensure_collection<T: Record>(&mut self) -> Result<&'static str> {
        let name = T::collection_name();
        if self.collections.contains(name) {
            return Ok(name);
        }
        if name.is_empty() || !name.chars().all(|c| c.is_ascii_lowercase() || c == '_') {
            return Err(eyre!("Invalid collection name: {:?}", name));
        }
        debug!(collection = name, "Store::ensure_collection: creating table");
        self.conn
            .execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS {name} (
                    id         TEXT PRIMARY KEY,
                    data       TEXT NOT NULL,
                    created_at INTEGER NOT NULL,
                    updated_at INTEGER NOT NULL
                );"
            ))
            .context(format!("Failed to create table {}", name))?;
        self.collections.insert(name);
        Ok(name)
    }

    /// Insert a new record, failing if the id already exists
    pub fn create<T: Record>(&mut self, record: T) -> Result<String> {
        let table = self.ensure_collection::<T>()?;
        let id = record.id().to_string();
        debug!(%id, table, "Store::create: called");
        let data = serde_json::to_string(&record).context("Failed to serialize record")?;
        let indexes = record.indexed_fields();

        let tx = self.conn.transaction()?;
        tx.execute(
            &format!("INSERT INTO {table} (id, data, created_at, updated_at) VALUES (?1, ?2, ?3, ?4)"),
            params![id, data, now_ms(), record.updated_at()],
        )
        .context(format!("Failed to insert {} into {}", id, table))?;
        write_indexes(&tx, table, &id, &indexes)?;
        tx.commit()?;
        Ok(id)
    }

    /// Fetch a record by id
    pub fn get<T: Record>(&mut self, id: &str) -> Result<Option<T>> {
        let table = self.ensure_collection::<T>()?;
        debug!(%id, table, "Store::get: called");
        let data: Option<String> = self
            .conn
            .query_row(&format!("SELECT data FROM {table} WHERE id = ?1"), params![id], |row| {
                row.get(0)
            })
            .optional()?;
        match data {
            Some(data) => {
                let record = serde_json::from_str(&data).context(format!("Failed to deserialize {}", id))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// Replace an existing record, failing if it does not exist
    pub fn update<T: Record>(&mut self, record: T) -> Result<()> {
        let table = self.ensure_collection::<T>()?;
        let id = record.id().to_string();
        debug!(%id, table, "Store::update: called");
        let data = serde_json::to_string(&record).context("Failed to serialize record")?;
        let indexes = record.indexed_fields();

        let tx = self.conn.transaction()?;
        let changed = tx.execute(
            &format!("UPDATE {table} SET data = ?1, updated_at = ?2 WHERE id = ?3"),
            params![data, record.updated_at(), id],
        )?;
        if changed == 0 {
            return Err(eyre!("Record not found: {}/{}", table, id));
        }
        tx.execute(
            "DELETE FROM record_indexes WHERE collection = ?1 AND record_id = ?2",
            params![table, id],
        )?;
        write_indexes(&tx, table, &id, &indexes)?;
        tx.commit()?;
        Ok(())
    }

    /// Delete a record; returns whether it existed
    pub fn delete<T: Record>(&mut self, id: &str) -> Result<bool> {
        let table = self.ensure_collection::<T>()?;
        debug!(%id, table, "Store::delete: called");
        let tx = self.conn.transaction()?;
        let changed = tx.execute(&format!("DELETE FROM {table} WHERE id = ?1"), params![id])?;
        tx.execute(
            "DELETE FROM record_indexes WHERE collection = ?1 AND record_id = ?2",
            params![table, id],
        )?;
        tx.commit()?;
        Ok(changed > 0)
    }

    /// List records matching every filter, oldest insertion first
    pub fn list<T: Record>(&mut self, filters: &[Filter]) -> Result<Vec<T>> {
        let table = self.ensure_collection::<T>()?;
        debug!(table, filter_count = filters.len(), "Store::list: called");

        let mut sql = format!("SELECT data FROM {table} WHERE 1 = 1");
        let mut values: Vec<SqlValue> = Vec::new();
        for filter in filters {
            let column = match filter.value {
                IndexValue::String(_) => "value_text",
                IndexValue::Int(_) | IndexValue::Bool(_) => "value_int",
            };
            let base = values.len();
            sql.push_str(&format!(
                " AND id IN (SELECT record_id FROM record_indexes WHERE collection = ?{} AND field = ?{} AND {} {} ?{})",
                base + 1,
                base + 2,
                column,
                filter.op.as_sql(),
                base + 3
            ));
            values.push(SqlValue::Text(table.to_string()));
            values.push(SqlValue::Text(filter.field.clone()));
            values.push(to_sql_value(&filter.value));
        }
        sql.push_str(" ORDER BY created_at ASC, rowid ASC");

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(values.iter()), |row| row.get::<_, String>(0))?;
        let mut records = Vec::new();
        for row in rows {
            let data = row?;
            records.push(serde_json::from_str(&data).context("Failed to deserialize record")?);
        }
        debug!(table, count = records.len(), "Store::list: returning");
        Ok(records)
    }
}

fn to_sql_value(value: &IndexValue) -> SqlValue {
    match value {
        IndexValue::String(s) => SqlValue::Text(s.clone()),
        IndexValue::Int(i) => SqlValue::Integer(*i),
        IndexValue::Bool(b) => SqlValue::Integer(i64::from(*b)),
    }
}

fn write_indexes(
    tx: &rusqlite::Transaction<'_>,
    table: &str,
    id: &str,
    indexes: &std::collections::HashMap<String, IndexValue>,
) -> Result<()> {
    for (field, value) in indexes {
        let (text, int) = match value {
            IndexValue::String(s) => (Some(s.clone()), None),
            IndexValue::Int(i) => (None, Some(*i)),
            IndexValue::Bool(b) => (None, Some(i64::from(*b))),
        };
        tx.execute(
            "INSERT INTO record_indexes (collection, record_id, field, value_text, value_int)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![table, id, field, text, int],
        )?;
    }
    Ok(())
}
