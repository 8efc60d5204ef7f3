//! Local persistent mirror.
//!
//! A synchronous key/value store (the `local_storage` SQLite table, or an
//! in-process map) holding, per resource, the optimistic queue of rows the
//! server has not confirmed yet, the tombstone set of locally deleted ids,
//! and a lookup map of counterparty display names.
//!
//! Nothing here ever fails loudly: missing or corrupt entries read as empty
//! and write failures are logged and dropped, leaving the caller with its
//! in-memory state for that operation.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, OptionalExtension};
use serde_json::Value;
use tracing::{debug, warn};

use crate::db::DbState;
use crate::models::{is_temp_id, temp_id_timestamp, CachedRecord};

/// Temp rows older than this are dropped from the optimistic queue (2h).
pub const OPTIMISTIC_MAX_AGE_MS: i64 = 2 * 60 * 60 * 1000;

/// Temp-id tombstones older than this are forgotten (24h).
pub const TOMBSTONE_MAX_AGE_MS: i64 = 24 * 60 * 60 * 1000;

// ---------------------------------------------------------------------------
// Key/value backends
// ---------------------------------------------------------------------------

/// Synchronous string key/value storage with localStorage semantics.
pub trait MirrorStore: Send + Sync {
    fn get_item(&self, key: &str) -> Result<Option<String>, String>;

    fn set_item(&self, key: &str, value: &str) -> Result<(), String>;

    fn remove_item(&self, key: &str) -> Result<(), String>;
}

/// Backend over the `local_storage` table.
pub struct SqliteStore {
    db: Arc<DbState>,
}

impl SqliteStore {
    pub fn new(db: Arc<DbState>) -> Self {
        Self { db }
    }
}

impl MirrorStore for SqliteStore {
    fn get_item(&self, key: &str) -> Result<Option<String>, String> {
        let conn = self.db.conn.lock().map_err(|e| e.to_string())?;
        conn.query_row(
            "SELECT storage_value FROM local_storage WHERE storage_key = ?1",
            params![key],
            |row| row.get::<_, String>(0),
        )
        .optional()
        .map_err(|e| format!("local_storage read: {e}"))
    }

    fn set_item(&self, key: &str, value: &str) -> Result<(), String> {
        let conn = self.db.conn.lock().map_err(|e| e.to_string())?;
        conn.execute(
            "INSERT INTO local_storage (storage_key, storage_value, updated_at)
             VALUES (?1, ?2, datetime('now'))
             ON CONFLICT(storage_key) DO UPDATE SET
                storage_value = excluded.storage_value,
                updated_at = excluded.updated_at",
            params![key, value],
        )
        .map_err(|e| format!("local_storage write: {e}"))?;
        Ok(())
    }

    fn remove_item(&self, key: &str) -> Result<(), String> {
        let conn = self.db.conn.lock().map_err(|e| e.to_string())?;
        conn.execute(
            "DELETE FROM local_storage WHERE storage_key = ?1",
            params![key],
        )
        .map_err(|e| format!("local_storage delete: {e}"))?;
        Ok(())
    }
}

/// Process-local backend. Used in tests and when no database is available.
#[derive(Default)]
pub struct MemoryStore {
    items: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MirrorStore for MemoryStore {
    fn get_item(&self, key: &str) -> Result<Option<String>, String> {
        let items = self.items.lock().map_err(|e| e.to_string())?;
        Ok(items.get(key).cloned())
    }

    fn set_item(&self, key: &str, value: &str) -> Result<(), String> {
        let mut items = self.items.lock().map_err(|e| e.to_string())?;
        items.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove_item(&self, key: &str) -> Result<(), String> {
        let mut items = self.items.lock().map_err(|e| e.to_string())?;
        items.remove(key);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Mirror
// ---------------------------------------------------------------------------

/// The mirror for one API resource (e.g. `recoveries`).
///
/// One writer per device: concurrent processes sharing the same database
/// can diverge, last write wins.
#[derive(Clone)]
pub struct LocalMirror {
    store: Arc<dyn MirrorStore>,
    resource: String,
}

impl LocalMirror {
    pub fn new(store: Arc<dyn MirrorStore>, resource: &str) -> Self {
        Self {
            store,
            resource: resource.trim_matches('/').to_string(),
        }
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    fn optimistic_key(&self) -> String {
        format!("optimistic:{}", self.resource)
    }

    fn tombstone_key(&self) -> String {
        format!("deleted:{}", self.resource)
    }

    fn display_names_key(&self) -> String {
        format!("display_names:{}", self.resource)
    }

    fn read_json(&self, key: &str) -> Option<Value> {
        let raw = match self.store.get_item(key) {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                warn!(key, error = %e, "mirror: read failed, treating as empty");
                return None;
            }
        };
        match serde_json::from_str::<Value>(&raw) {
            Ok(v) => Some(v),
            Err(e) => {
                warn!(key, error = %e, "mirror: corrupt entry, treating as empty");
                None
            }
        }
    }

    fn write_json<T: serde::Serialize + ?Sized>(&self, key: &str, value: &T) {
        let text = match serde_json::to_string(value) {
            Ok(t) => t,
            Err(e) => {
                warn!(key, error = %e, "mirror: serialize failed, write dropped");
                return;
            }
        };
        if let Err(e) = self.store.set_item(key, &text) {
            warn!(key, error = %e, "mirror: write failed, keeping in-memory state only");
        }
    }

    fn remove_key(&self, key: &str) {
        if let Err(e) = self.store.remove_item(key) {
            warn!(key, error = %e, "mirror: remove failed, keeping in-memory state only");
        }
    }

    // -- optimistic queue ---------------------------------------------------

    /// Stored queue. Elements that do not parse as a record are skipped.
    pub fn load_optimistic<R: CachedRecord>(&self) -> Vec<R> {
        let Some(Value::Array(items)) = self.read_json(&self.optimistic_key()) else {
            return Vec::new();
        };
        items
            .into_iter()
            .filter(|v| v.is_object())
            .filter_map(|v| match serde_json::from_value::<R>(v) {
                Ok(r) => Some(r),
                Err(e) => {
                    debug!(error = %e, "mirror: skipping unreadable optimistic row");
                    None
                }
            })
            .collect()
    }

    /// An empty queue removes the key.
    pub fn save_optimistic<R: CachedRecord>(&self, rows: &[R]) {
        if rows.is_empty() {
            self.remove_key(&self.optimistic_key());
        } else {
            self.write_json(&self.optimistic_key(), rows);
        }
    }

    /// Drop temp-id rows pending for longer than `max_age`, aged by
    /// [`CachedRecord::pending_since`]. Rows with a permanent id, or with no
    /// readable timestamp at all, are kept.
    pub fn prune_optimistic<R: CachedRecord>(
        &self,
        rows: Vec<R>,
        max_age: Duration,
        now: DateTime<Utc>,
    ) -> Vec<R> {
        rows.into_iter()
            .filter(|r| {
                if !is_temp_id(r.record_id()) {
                    return true;
                }
                match r.pending_since() {
                    Some(ts) => now - ts < max_age,
                    None => true,
                }
            })
            .collect()
    }

    // -- tombstones ---------------------------------------------------------

    pub fn load_tombstones(&self) -> BTreeSet<String> {
        let Some(Value::Array(items)) = self.read_json(&self.tombstone_key()) else {
            return BTreeSet::new();
        };
        items
            .into_iter()
            .filter_map(|v| match v {
                Value::String(s) => Some(s),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .collect()
    }

    /// An empty set removes the key.
    pub fn save_tombstones(&self, ids: &BTreeSet<String>) {
        if ids.is_empty() {
            self.remove_key(&self.tombstone_key());
        } else {
            self.write_json(&self.tombstone_key(), ids);
        }
    }

    /// Forget temp-id tombstones older than `max_age`, and temp-id
    /// tombstones with no readable timestamp. Server ids are kept forever.
    pub fn prune_tombstones(
        &self,
        ids: BTreeSet<String>,
        max_age: Duration,
        now: DateTime<Utc>,
    ) -> BTreeSet<String> {
        ids.into_iter()
            .filter(|id| {
                if !is_temp_id(id) {
                    return true;
                }
                temp_id_timestamp(id).is_some_and(|ts| now - ts < max_age)
            })
            .collect()
    }

    // -- display names ------------------------------------------------------

    pub fn display_names(&self) -> BTreeMap<String, String> {
        let Some(Value::Object(map)) = self.read_json(&self.display_names_key()) else {
            return BTreeMap::new();
        };
        map.into_iter()
            .filter_map(|(k, v)| match v {
                Value::String(s) if !s.trim().is_empty() => Some((k, s)),
                _ => None,
            })
            .collect()
    }

    pub fn display_name(&self, id: &str) -> Option<String> {
        self.display_names().remove(id)
    }

    /// Remember the name shown for `id`. An empty name keeps the previous one.
    pub fn remember_display_name(&self, id: &str, name: &str) {
        let name = name.trim();
        if id.trim().is_empty() || name.is_empty() {
            return;
        }
        let mut names = self.display_names();
        if names.get(id).map(String::as_str) == Some(name) {
            return;
        }
        names.insert(id.to_string(), name.to_string());
        self.write_json(&self.display_names_key(), &names);
    }
}
