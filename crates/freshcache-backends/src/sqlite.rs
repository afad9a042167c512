//! SQLite-backed cache table and query runner
//!
//! Entries live in a single table:
//!
//! ```sql
//! CREATE TABLE cache (
//!     id     CHAR(128) NOT NULL PRIMARY KEY,
//!     expire INTEGER   NOT NULL DEFAULT 0,
//!     value  BLOB
//! );
//! ```
//!
//! `expire` is an absolute unix time, `0` for entries that never expire.
//! SQLite has no native expiry, so reads skip and delete stale rows and
//! writes occasionally sweep the whole table through [`GcPolicy`].

use std::{
    path::Path,
    sync::{Arc, Mutex, MutexGuard},
};

use freshcache::{
    clock::{Clock, SystemClock},
    dependency::QueryRunner,
    gc::GcPolicy,
    store::{CacheStore, GarbageCollect},
    CacheError, PhysicalKey, Result,
};
use rusqlite::{
    params, params_from_iter,
    types::{Value as SqlValue, ValueRef},
    Connection, OptionalExtension,
};
use serde_json::Value;
use tracing::debug;

use crate::error::{BackendError, BackendResult};

/// Default cache table name
pub const DEFAULT_TABLE: &str = "cache";

/// Host parameter limit of older SQLite builds
const MAX_BATCH: usize = 500;

fn lock(conn: &Mutex<Connection>) -> BackendResult<MutexGuard<'_, Connection>> {
    conn.lock().map_err(|_| BackendError::LockPoisoned)
}

fn to_db_time(secs: u64) -> i64 {
    i64::try_from(secs).unwrap_or(i64::MAX)
}

/// Relational cache store on a single SQLite table
#[derive(Debug)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    table: String,
    gc_policy: GcPolicy,
    clock: Arc<dyn Clock>,
}

impl SqliteStore {
    /// Open (or create) a database file and ensure the default table exists
    pub fn open(path: &Path) -> BackendResult<Self> {
        Self::from_connection(Connection::open(path)?, DEFAULT_TABLE, true)
    }

    /// Create an in-memory store (for testing)
    pub fn memory() -> BackendResult<Self> {
        Self::from_connection(Connection::open_in_memory()?, DEFAULT_TABLE, true)
    }

    /// Wrap an existing connection, optionally creating `table`
    pub fn from_connection(
        conn: Connection,
        table: impl Into<String>,
        auto_create_table: bool,
    ) -> BackendResult<Self> {
        let table = table.into();
        if table.is_empty() || !table.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(BackendError::InvalidConfig(format!(
                "invalid cache table name: {:?}",
                table
            )));
        }

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
            table,
            gc_policy: GcPolicy::default(),
            clock: Arc::new(SystemClock),
        };
        if auto_create_table {
            store.create_table()?;
        }
        Ok(store)
    }

    pub fn with_gc_policy(mut self, gc_policy: GcPolicy) -> Self {
        self.gc_policy = gc_policy;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Create the cache table if it does not exist yet
    pub fn create_table(&self) -> BackendResult<()> {
        let conn = lock(&self.conn)?;
        let _ = conn.execute("PRAGMA journal_mode = WAL", []);
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                id CHAR(128) NOT NULL PRIMARY KEY,
                expire INTEGER NOT NULL DEFAULT 0,
                value BLOB
            );
            CREATE INDEX IF NOT EXISTS {table}_expire ON {table} (expire);",
            table = self.table
        ))?;
        Ok(())
    }

    /// Query runner sharing this store's connection
    pub fn query_runner(&self) -> SqliteQueryRunner {
        SqliteQueryRunner {
            conn: Arc::clone(&self.conn),
        }
    }

    fn fetch(&self, key: &PhysicalKey) -> BackendResult<Option<Vec<u8>>> {
        let conn = lock(&self.conn)?;
        let row: Option<(Option<Vec<u8>>, i64)> = conn
            .query_row(
                &format!("SELECT value, expire FROM {} WHERE id = ?1", self.table),
                params![key.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        match row {
            None => Ok(None),
            Some((_, expire)) if self.is_expired(expire) => {
                self.delete_expired(&conn, key)?;
                debug!("Expired cache row removed: {}", key);
                Ok(None)
            }
            Some((value, _)) => Ok(Some(value.unwrap_or_default())),
        }
    }

    fn fetch_many(
        &self,
        keys: &[PhysicalKey],
    ) -> BackendResult<std::collections::HashMap<PhysicalKey, Vec<u8>>> {
        let mut found = std::collections::HashMap::with_capacity(keys.len());
        let conn = lock(&self.conn)?;

        for chunk in keys.chunks(MAX_BATCH) {
            let placeholders = vec!["?"; chunk.len()].join(", ");
            let mut stmt = conn.prepare(&format!(
                "SELECT id, value, expire FROM {} WHERE id IN ({})",
                self.table, placeholders
            ))?;
            let rows = stmt.query_map(params_from_iter(chunk.iter().map(|k| k.as_str())), |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<Vec<u8>>>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            })?;

            let mut expired = Vec::new();
            for row in rows {
                let (id, value, expire) = row?;
                let Some(key) = PhysicalKey::from_hex(&id) else {
                    continue;
                };
                if self.is_expired(expire) {
                    expired.push(key);
                } else {
                    found.insert(key, value.unwrap_or_default());
                }
            }
            for key in &expired {
                self.delete_expired(&conn, key)?;
            }
        }

        Ok(found)
    }

    fn store(&self, key: &PhysicalKey, payload: &[u8], ttl_secs: u64) -> BackendResult<bool> {
        let conn = lock(&self.conn)?;
        conn.execute(
            &format!(
                "INSERT OR REPLACE INTO {} (id, expire, value) VALUES (?1, ?2, ?3)",
                self.table
            ),
            params![key.as_str(), self.expire_for(ttl_secs), payload],
        )?;
        Ok(true)
    }

    fn insert_if_absent(
        &self,
        key: &PhysicalKey,
        payload: &[u8],
        ttl_secs: u64,
    ) -> BackendResult<bool> {
        let conn = lock(&self.conn)?;
        let changed = conn.execute(
            &format!(
                "INSERT INTO {table} (id, expire, value) VALUES (?1, ?2, ?3)
                 ON CONFLICT (id) DO UPDATE SET expire = excluded.expire, value = excluded.value
                 WHERE {table}.expire > 0 AND {table}.expire <= ?4",
                table = self.table
            ),
            params![
                key.as_str(),
                self.expire_for(ttl_secs),
                payload,
                to_db_time(self.clock.now())
            ],
        )?;
        Ok(changed == 1)
    }

    fn remove(&self, key: &PhysicalKey) -> BackendResult<bool> {
        let conn = lock(&self.conn)?;
        conn.execute(
            &format!("DELETE FROM {} WHERE id = ?1", self.table),
            params![key.as_str()],
        )?;
        Ok(true)
    }

    fn sweep(&self, expired_only: bool) -> BackendResult<usize> {
        let conn = lock(&self.conn)?;
        let removed = if expired_only {
            conn.execute(
                &format!("DELETE FROM {} WHERE expire > 0 AND expire <= ?1", self.table),
                params![to_db_time(self.clock.now())],
            )?
        } else {
            conn.execute(&format!("DELETE FROM {}", self.table), [])?
        };
        Ok(removed)
    }

    /// Delete a row only if it is still expired
    fn delete_expired(&self, conn: &Connection, key: &PhysicalKey) -> BackendResult<()> {
        conn.execute(
            &format!(
                "DELETE FROM {} WHERE id = ?1 AND expire > 0 AND expire <= ?2",
                self.table
            ),
            params![key.as_str(), to_db_time(self.clock.now())],
        )?;
        Ok(())
    }

    fn expire_for(&self, ttl_secs: u64) -> i64 {
        to_db_time(self.clock.expires_at(ttl_secs))
    }

    fn is_expired(&self, expire: i64) -> bool {
        expire > 0 && self.clock.is_expired(expire as u64)
    }
}

impl CacheStore for SqliteStore {
    fn get_raw(&self, key: &PhysicalKey) -> Result<Option<Vec<u8>>> {
        Ok(self.fetch(key)?)
    }

    fn get_many_raw(
        &self,
        keys: &[PhysicalKey],
    ) -> Result<std::collections::HashMap<PhysicalKey, Vec<u8>>> {
        Ok(self.fetch_many(keys)?)
    }

    fn set_raw(&self, key: &PhysicalKey, payload: &[u8], ttl_secs: u64) -> Result<bool> {
        self.gc_policy.maybe_sweep("sqlite", || self.gc(true));
        Ok(self.store(key, payload, ttl_secs)?)
    }

    fn add_raw(&self, key: &PhysicalKey, payload: &[u8], ttl_secs: u64) -> Result<bool> {
        self.gc_policy.maybe_sweep("sqlite", || self.gc(true));
        Ok(self.insert_if_absent(key, payload, ttl_secs)?)
    }

    fn delete_raw(&self, key: &PhysicalKey) -> Result<bool> {
        Ok(self.remove(key)?)
    }

    fn flush_raw(&self) -> Result<bool> {
        self.sweep(false)?;
        Ok(true)
    }
}

impl GarbageCollect for SqliteStore {
    fn gc(&self, expired_only: bool) -> Result<usize> {
        Ok(self.sweep(expired_only)?)
    }
}

/// Runs DatabaseQuery dependency statements against a SQLite connection
#[derive(Debug, Clone)]
pub struct SqliteQueryRunner {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteQueryRunner {
    pub fn open(path: &Path) -> BackendResult<Self> {
        Ok(Self::from_connection(Connection::open(path)?))
    }

    pub fn memory() -> BackendResult<Self> {
        Ok(Self::from_connection(Connection::open_in_memory()?))
    }

    pub fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    /// Run setup statements on the underlying connection
    pub fn execute_batch(&self, sql: &str) -> BackendResult<()> {
        lock(&self.conn)?.execute_batch(sql)?;
        Ok(())
    }

    fn first_row(&self, sql: &str, params: &[Value]) -> BackendResult<Option<Vec<Value>>> {
        let conn = lock(&self.conn)?;
        let mut stmt = conn.prepare(sql)?;
        let columns = stmt.column_count();
        let mut rows = stmt.query(params_from_iter(params.iter().map(to_sql)))?;

        let Some(row) = rows.next()? else {
            return Ok(None);
        };
        let values = (0..columns)
            .map(|i| row.get_ref(i).map(from_sql))
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(Some(values))
    }
}

impl QueryRunner for SqliteQueryRunner {
    fn query_row(&self, sql: &str, params: &[Value]) -> Result<Option<Vec<Value>>> {
        self.first_row(sql, params).map_err(|e| match e {
            BackendError::LockPoisoned => CacheError::LockError,
            other => CacheError::dependency(other.to_string()),
        })
    }
}

fn to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

fn from_sql(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ValueRef::Text(text) => Value::String(String::from_utf8_lossy(text).into_owned()),
        ValueRef::Blob(blob) => Value::from(blob.to_vec()),
    }
}
