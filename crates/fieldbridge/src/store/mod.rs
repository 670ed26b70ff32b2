// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Embedded SQLite store backing the durable queues and the parameter tables.
//!
//! The bridge keeps every in-flight message on disk so it survives crashes,
//! restarts and peer outages without losing or duplicating work. All state
//! lives in one database file opened in WAL mode with `synchronous=NORMAL`
//! and a 5 s busy timeout.
//!
//! Workers open a short-lived connection per operation; WAL plus the busy
//! timeout make concurrent writers safe. The only multi-statement transaction
//! is the inbox claim, which uses `BEGIN IMMEDIATE` (see [`inbox`]).
//!
//! Schema installation is idempotent and guarded process-wide per database
//! path, so concurrent starts race harmlessly.

pub mod inbox;
pub mod logstore;
pub mod outbox;

use anyhow::{Context, Result};
use rusqlite::Connection;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Current wall-clock time as fractional seconds since the Unix epoch.
#[must_use]
pub fn now_ts() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS outbox (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  created_ts REAL NOT NULL,
  method TEXT NOT NULL,
  url TEXT NOT NULL,
  headers_json TEXT NOT NULL,
  body_json TEXT,
  idempotency_key TEXT NOT NULL,
  retry_count INTEGER NOT NULL DEFAULT 0,
  next_attempt_ts REAL NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_outbox_next ON outbox(next_attempt_ts, created_ts);

CREATE TABLE IF NOT EXISTS inbox (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  received_ts REAL NOT NULL,
  source TEXT,
  headers_json TEXT NOT NULL,
  body_json TEXT,
  idempotency_key TEXT NOT NULL,
  state TEXT NOT NULL DEFAULT 'pending'
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_inbox_dedupe ON inbox(idempotency_key);
CREATE INDEX IF NOT EXISTS idx_inbox_state ON inbox(state, received_ts);

CREATE TABLE IF NOT EXISTS logs (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  ts REAL NOT NULL,
  channel TEXT NOT NULL,
  direction TEXT NOT NULL,
  message TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_logs_ch_ts ON logs(channel, ts);

CREATE TABLE IF NOT EXISTS params (
  pkey TEXT PRIMARY KEY,
  ptype TEXT NOT NULL,
  pid TEXT NOT NULL,
  min_v REAL,
  max_v REAL,
  default_v TEXT,
  unit TEXT,
  rw TEXT,
  dtype TEXT,
  name TEXT,
  message TEXT,
  updated_ts REAL NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS param_values (
  pkey TEXT PRIMARY KEY,
  value TEXT NOT NULL,
  updated_ts REAL NOT NULL
);

CREATE TABLE IF NOT EXISTS param_device_map (
  pkey TEXT PRIMARY KEY,
  line_key TEXT,
  zbc_message_id INTEGER,
  zbc_command_id INTEGER,
  zbc_codec TEXT,
  zbc_scale REAL,
  zbc_offset REAL,
  ult_set_cmd TEXT,
  ult_get_cmd TEXT,
  ult_var TEXT
);
";

fn installed_paths() -> &'static Mutex<HashSet<PathBuf>> {
    static INSTALLED: OnceLock<Mutex<HashSet<PathBuf>>> = OnceLock::new();
    INSTALLED.get_or_init(|| Mutex::new(HashSet::new()))
}

/// Handle to the bridge database.
///
/// Cheap to clone; each operation opens its own connection. The schema is
/// installed exactly once per process per path, the first time a handle for
/// that path is opened.
#[derive(Debug, Clone)]
pub struct Db {
    path: PathBuf,
}

impl Db {
    /// Open (and on first use initialize) the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create state directory {}", parent.display()))?;
            }
        }

        let db = Self { path };

        let mut installed = installed_paths()
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if !installed.contains(&db.path) {
            let conn = db.conn()?;
            conn.execute_batch(SCHEMA)
                .with_context(|| format!("failed to install schema in {}", db.path.display()))?;
            installed.insert(db.path.clone());
        }

        Ok(db)
    }

    /// Path of the backing database file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Open a connection with the bridge pragmas applied.
    pub(crate) fn conn(&self) -> Result<Connection> {
        let conn = Connection::open(&self.path)
            .with_context(|| format!("failed to open database at {}", self.path.display()))?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        Ok(conn)
    }
}
