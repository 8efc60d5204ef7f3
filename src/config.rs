//! Runtime configuration.
//!
//! Resolved in three layers: built-in defaults, then `BUNK_*` environment
//! variables, then the `sync` category of `local_settings` (what the
//! operator saved from the settings screen wins).

use std::path::PathBuf;
use std::time::Duration;

use rusqlite::Connection;
use tracing::{debug, info};

use crate::db;
use crate::error::SyncError;

const SETTINGS_CATEGORY: &str = "sync";

/// List reads get 20s, matching the backend's tenant attach plus query budget.
pub const DEFAULT_LIST_TIMEOUT_MS: u64 = 20_000;
pub const DEFAULT_MUTATION_TIMEOUT_MS: u64 = 20_000;
pub const DEFAULT_DELETE_TIMEOUT_MS: u64 = 10_000;

#[derive(Debug, Clone)]
pub struct Config {
    /// Back-office base URL, e.g. `https://office.example.com`.
    pub api_url: String,
    /// Raw `Cookie` header value carrying the session.
    pub session_cookie: Option<String>,
    pub data_dir: PathBuf,
    pub list_timeout: Duration,
    pub mutation_timeout: Duration,
    pub delete_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_url: String::new(),
            session_cookie: None,
            data_dir: default_data_dir(),
            list_timeout: Duration::from_millis(DEFAULT_LIST_TIMEOUT_MS),
            mutation_timeout: Duration::from_millis(DEFAULT_MUTATION_TIMEOUT_MS),
            delete_timeout: Duration::from_millis(DEFAULT_DELETE_TIMEOUT_MS),
        }
    }
}

/// `$XDG_DATA_HOME/bunk-office`, falling back to `~/.local/share/bunk-office`.
pub fn default_data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()))
                .join(".local")
                .join("share")
        })
        .join("bunk-office")
}

impl Config {
    /// Defaults overlaid with the process environment.
    pub fn from_env() -> Result<Self, SyncError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overlaid with whatever `lookup` returns for each `BUNK_*` key.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, SyncError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Config::default();
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(url) = get("BUNK_API_URL") {
            config.api_url = url;
        }
        if let Some(cookie) = get("BUNK_SESSION_COOKIE") {
            config.session_cookie = Some(cookie);
        }
        if let Some(dir) = get("BUNK_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        if let Some(raw) = get("BUNK_LIST_TIMEOUT_MS") {
            config.list_timeout = parse_timeout("BUNK_LIST_TIMEOUT_MS", &raw)?;
        }
        if let Some(raw) = get("BUNK_MUTATION_TIMEOUT_MS") {
            config.mutation_timeout = parse_timeout("BUNK_MUTATION_TIMEOUT_MS", &raw)?;
        }
        if let Some(raw) = get("BUNK_DELETE_TIMEOUT_MS") {
            config.delete_timeout = parse_timeout("BUNK_DELETE_TIMEOUT_MS", &raw)?;
        }

        debug!(data_dir = %config.data_dir.display(), "configuration read from environment");
        Ok(config)
    }

    /// Overlay values saved in `local_settings`.
    pub fn apply_settings(&mut self, conn: &Connection) {
        if let Some(url) = db::get_setting(conn, SETTINGS_CATEGORY, "api_url").filter(|v| !v.trim().is_empty()) {
            info!("using back-office URL from local settings");
            self.api_url = url;
        }
        if let Some(cookie) =
            db::get_setting(conn, SETTINGS_CATEGORY, "session_cookie").filter(|v| !v.trim().is_empty())
        {
            self.session_cookie = Some(cookie);
        }
    }

    /// Save the back-office URL on first start so later runs work without
    /// the environment. An already saved URL is left alone.
    pub fn remember_api_url(&self, conn: &Connection) -> Result<(), SyncError> {
        let saved = db::get_setting(conn, SETTINGS_CATEGORY, "api_url").filter(|v| !v.trim().is_empty());
        if saved.is_some() || self.api_url.trim().is_empty() {
            return Ok(());
        }
        db::set_setting(conn, SETTINGS_CATEGORY, "api_url", &self.api_url).map_err(SyncError::Storage)?;
        info!("back-office URL saved to local settings");
        Ok(())
    }

    pub fn validate(&self) -> Result<(), SyncError> {
        if self.api_url.trim().is_empty() {
            return Err(SyncError::config(
                "back-office URL is not set (BUNK_API_URL or settings sync/api_url)",
            ));
        }
        for (name, value) in [
            ("list timeout", self.list_timeout),
            ("mutation timeout", self.mutation_timeout),
            ("delete timeout", self.delete_timeout),
        ] {
            if value.is_zero() {
                return Err(SyncError::config(format!("{name} must be greater than zero")));
            }
        }
        Ok(())
    }
}

fn parse_timeout(key: &str, raw: &str) -> Result<Duration, SyncError> {
    raw.parse::<u64>()
        .map(Duration::from_millis)
        .map_err(|_| SyncError::config(format!("{key} must be a number of milliseconds, got {raw:?}")))
}
