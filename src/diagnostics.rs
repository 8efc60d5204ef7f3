//! Diagnostics for Bunk Office.
//!
//! Provides:
//! - **Cache health**: queue depth, tombstones, last load and staleness for
//!   one cached list, plus the local database's schema version and size.
//! - **Log rotation helpers**: used by `lib.rs` to configure rolling log files.

use crate::api::RemoteCollection;
use crate::db::{self, DbState};
use crate::models::CachedRecord;
use crate::reconcile::RecordCache;
use serde_json::{json, Value};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Maximum number of log files to retain.
pub const MAX_LOG_FILES: usize = 10;

/// File name prefix of the daily log files.
pub const LOG_FILE_PREFIX: &str = "bunk";

// ---------------------------------------------------------------------------
// Cache health
// ---------------------------------------------------------------------------

/// Snapshot of one cached list for the status output.
pub fn cache_health<R: CachedRecord, C: RemoteCollection>(
    cache: &RecordCache<R, C>,
    db: Option<&DbState>,
) -> Value {
    let pending = cache.mirror().load_optimistic::<R>().len();
    let tombstones = cache.mirror().load_tombstones().len();

    let (schema_version, db_size) = match db {
        Some(db) => {
            let schema_version = match db.conn.lock() {
                Ok(conn) => db::schema_version(&conn),
                Err(e) => {
                    warn!("Database lock poisoned while reading schema version: {e}");
                    0
                }
            };
            let db_size = fs::metadata(&db.db_path).map(|m| m.len()).unwrap_or(0);
            (schema_version, db_size)
        }
        None => (0, 0),
    };

    json!({
        "version": env!("CARGO_PKG_VERSION"),
        "resource": cache.resource(),
        "pendingRows": pending,
        "tombstones": tombstones,
        "lastLoadedAt": cache.last_loaded_at().map(|t| t.to_rfc3339()),
        "stale": cache.is_stale(),
        "schemaVersion": schema_version,
        "dbSizeBytes": db_size,
    })
}

// ---------------------------------------------------------------------------
// Log rotation
// ---------------------------------------------------------------------------

/// Returns the log directory under `data_dir`.
pub fn get_log_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("logs")
}

/// Prune old log files, keeping only the most recent `MAX_LOG_FILES`.
pub fn prune_old_logs(log_dir: &Path) {
    if !log_dir.exists() {
        return;
    }

    let prefix = format!("{LOG_FILE_PREFIX}.");
    let mut log_files: Vec<(PathBuf, std::time::SystemTime)> = Vec::new();
    if let Ok(entries) = fs::read_dir(log_dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_file() {
                if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                    if name.starts_with(&prefix) {
                        let modified = entry
                            .metadata()
                            .ok()
                            .and_then(|m| m.modified().ok())
                            .unwrap_or(std::time::UNIX_EPOCH);
                        log_files.push((path, modified));
                    }
                }
            }
        }
    }

    // Sort newest first
    log_files.sort_by(|a, b| b.1.cmp(&a.1));

    for (path, _) in log_files.iter().skip(MAX_LOG_FILES) {
        if let Err(e) = fs::remove_file(path) {
            warn!("Failed to prune log file {}: {e}", path.display());
        }
    }
}
