//! Bunk Office - recovery list client
//!
//! Keeps the back office's recovery list usable over a slow or flaky link:
//! reads go through a cache that falls back to the last good rows, creates
//! show up immediately from a persisted optimistic queue, and deletes are
//! tombstoned locally so a row never reappears once removed.

use std::path::Path;
use std::sync::Arc;

use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub mod api;
pub mod config;
pub mod db;
pub mod diagnostics;
pub mod error;
pub mod models;
pub mod mutations;
pub mod reconcile;
pub mod recoveries;
pub mod storage;

#[cfg(test)]
mod testing;

pub use api::{HttpCollection, RemoteCollection};
pub use config::Config;
pub use error::{FetchError, SyncError, SyncResult};
pub use models::{CachedRecord, Recovery, RecoveryDraft};
pub use mutations::{DeleteOutcome, Notice, NoticeLevel};
pub use reconcile::{MergedView, RecordCache, ViewSource};
pub use recoveries::{recovery_cache, RecoveryCache};
pub use storage::{LocalMirror, MemoryStore, MirrorStore, SqliteStore};

/// Install structured logging (console + daily rolling file in `log_dir`).
///
/// The returned guard flushes the file writer when dropped; hold it for the
/// life of the process.
pub fn init_logging(log_dir: &Path) -> WorkerGuard {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,bunk_office_lib=debug"));

    // Prune old log files before setting up the appender
    diagnostics::prune_old_logs(log_dir);
    std::fs::create_dir_all(log_dir).ok();

    let file_appender = tracing_appender::rolling::daily(log_dir, diagnostics::LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true);
    let console_layer = fmt::layer().with_target(true).with_writer(std::io::stderr);

    // A second call keeps the subscriber already installed.
    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init();

    guard
}

/// Load configuration, refresh the recovery list once and print the merged
/// view with a status snapshot as JSON.
pub async fn run() -> anyhow::Result<()> {
    let mut config = Config::from_env()?;
    let _log_guard = init_logging(&diagnostics::get_log_dir(&config.data_dir));

    info!("Starting Bunk Office v{}", env!("CARGO_PKG_VERSION"));

    let db = Arc::new(db::init(&config.data_dir).map_err(anyhow::Error::msg)?);
    {
        let conn = db
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("database lock poisoned: {e}"))?;
        config.apply_settings(&conn);
        config.validate()?;
        config.remember_api_url(&conn)?;
    }

    let remote = HttpCollection::new(&config)?;
    let store: Arc<dyn MirrorStore> = Arc::new(SqliteStore::new(db.clone()));
    let cache = recovery_cache(remote, store, &config);

    let view = cache.refresh().await?;
    let output = serde_json::json!({
        "view": view,
        "status": diagnostics::cache_health(&cache, Some(db.as_ref())),
    });
    println!("{}", serde_json::to_string_pretty(&output)?);

    cache.shutdown();
    Ok(())
}
