use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use rusqlite::Connection;

/// Single sqlite connection behind a mutex, shared by every table module.
/// One `Store` per daemon process; `govctl` opens its own short-lived
/// connection for one-shot reads, guarded by the same [`crate::lock`] file.
pub struct Store {
    pub(crate) conn: Mutex<Connection>,
    lock_path: Option<PathBuf>,
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS settings (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS device_limits (
    ip_address TEXT PRIMARY KEY,
    download_kbps INTEGER NOT NULL,
    upload_kbps INTEGER NOT NULL,
    priority INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS device_quotas (
    ip_address TEXT PRIMARY KEY,
    limit_dl_bytes INTEGER NOT NULL,
    limit_ul_bytes INTEGER NOT NULL,
    period_seconds INTEGER NOT NULL,
    start_time REAL NOT NULL,
    used_dl_bytes INTEGER NOT NULL,
    used_ul_bytes INTEGER NOT NULL,
    is_throttled INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS schedules (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    device_ip TEXT NOT NULL,
    rule_type TEXT NOT NULL,
    start_date TEXT,
    end_date TEXT,
    start_time TEXT NOT NULL,
    end_time TEXT NOT NULL,
    repeat_mode TEXT NOT NULL,
    custom_days TEXT,
    limit_dl_kbps INTEGER,
    limit_ul_kbps INTEGER,
    priority INTEGER,
    quota_dl_bytes INTEGER,
    quota_ul_bytes INTEGER,
    quota_period_seconds INTEGER,
    is_enabled INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS mac_access_list (
    mac_address TEXT PRIMARY KEY,
    list_type TEXT NOT NULL CHECK (list_type IN ('block', 'allow'))
);

CREATE TABLE IF NOT EXISTS ip_block_list (
    ip_range TEXT PRIMARY KEY
);

CREATE TABLE IF NOT EXISTS data_log (
    timestamp TEXT NOT NULL,
    ip_address TEXT NOT NULL,
    rx_bytes INTEGER NOT NULL,
    tx_bytes INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_data_log_timestamp ON data_log(timestamp);

CREATE TABLE IF NOT EXISTS usage_summary (
    timestamp TEXT PRIMARY KEY,
    total_rx_bytes INTEGER NOT NULL,
    total_tx_bytes INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS usage_forecast (
    timestamp TEXT PRIMARY KEY,
    predicted_bytes REAL NOT NULL,
    predicted_lower REAL,
    predicted_upper REAL
);
";

impl Store {
    /// Opens (creating if absent) the sqlite database at `path` and runs
    /// every `CREATE TABLE IF NOT EXISTS` migration. Safe to call against an
    /// already-migrated database.
    pub fn open(path: impl AsRef<Path>) -> Result<Store> {
        let conn = Connection::open(path.as_ref())
            .with_context(|| format!("failed to open store at {:?}", path.as_ref()))?;
        conn.execute_batch(SCHEMA).context("failed to run schema migration")?;
        let lock_path = path.as_ref().with_extension("lock");
        Ok(Store { conn: Mutex::new(conn), lock_path: Some(lock_path) })
    }

    /// In-memory store for tests: no file, no lock, nothing to clean up.
    /// Not `#[cfg(test)]`-gated because downstream crates' own test suites
    /// (`hotspot_governor`'s accounting/quota/scheduler/adaptive/command_bus
    /// tests) construct one directly.
    pub fn open_in_memory() -> Result<Store> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Store { conn: Mutex::new(conn), lock_path: None })
    }

    /// Runs `f` under the exclusive advisory store lock
    /// (`hg_config::lock::lock_store`), so a second process touching the
    /// same database file — a stray second daemon instance, a manual sqlite
    /// client — can never interleave a write with this one. In-memory test
    /// stores have no file to race against and skip locking entirely.
    pub(crate) fn with_write_lock<T>(&self, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let Some(lock_path) = &self.lock_path else {
            return f();
        };
        let _guard = crate::lock::lock_store(lock_path, None)?;
        f()
    }
}
