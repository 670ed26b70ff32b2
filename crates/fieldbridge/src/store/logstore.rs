// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-channel traffic log.
//!
//! Every line crossing the bridge is recorded twice: as a row in the `logs`
//! table (queried by the admin tail endpoint, pruned by a per-channel
//! retention window) and as a JSONL record appended to
//! `<log_dir>/<channel>.log`. File append failures are reported via tracing
//! and never fail the caller; losing a log line must not stall the queues.

use super::{now_ts, Db};
use anyhow::Result;
use rusqlite::{params, Row};
use serde::Serialize;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

/// One log record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogRecord {
    pub ts: f64,
    pub channel: String,
    pub direction: String,
    pub message: String,
}

impl LogRecord {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            ts: row.get(0)?,
            channel: row.get(1)?,
            direction: row.get(2)?,
            message: row.get(3)?,
        })
    }
}

/// Log table and per-channel file access.
#[derive(Debug, Clone)]
pub struct LogStore {
    db: Db,
    dir: Option<PathBuf>,
}

impl LogStore {
    /// Create a store; `dir` is the directory for per-channel append files,
    /// `None` disables file output (tests).
    #[must_use]
    pub fn new(db: Db, dir: Option<PathBuf>) -> Self {
        Self { db, dir }
    }

    /// Record one line on a channel with a direction tag (`in`, `out`,
    /// `error`, `info`).
    pub fn log(&self, channel: &str, direction: &str, message: &str) -> Result<()> {
        let ts = now_ts();
        let conn = self.db.conn()?;
        conn.execute(
            "INSERT INTO logs (ts, channel, direction, message) VALUES (?1, ?2, ?3, ?4)",
            params![ts, channel, direction, message],
        )?;

        if let Some(dir) = &self.dir {
            let record = LogRecord {
                ts,
                channel: channel.to_string(),
                direction: direction.to_string(),
                message: message.to_string(),
            };
            if let Err(err) = self.append_file(dir.clone(), &record) {
                tracing::warn!("log file append failed for channel {}: {}", channel, err);
            }
        }

        Ok(())
    }

    fn append_file(&self, dir: PathBuf, record: &LogRecord) -> std::io::Result<()> {
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(format!("{}.log", sanitize_channel(&record.channel)));
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        let line = serde_json::to_string(record).map_err(std::io::Error::other)?;
        writeln!(file, "{}", line)
    }

    /// The most recent `limit` records of a channel, oldest first.
    pub fn tail(&self, channel: &str, limit: u32) -> Result<Vec<LogRecord>> {
        let limit = limit.clamp(1, 1000);
        let conn = self.db.conn()?;
        let mut stmt = conn.prepare(
            "SELECT ts, channel, direction, message FROM logs
             WHERE channel = ?1
             ORDER BY ts DESC, id DESC
             LIMIT ?2",
        )?;
        let mut records = stmt
            .query_map(params![channel, limit], LogRecord::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        records.reverse();
        Ok(records)
    }

    /// Drop records of a channel older than the retention window. Returns
    /// the number of rows removed.
    pub fn prune(&self, channel: &str, retention_days: u32) -> Result<u64> {
        let cutoff = now_ts() - f64::from(retention_days) * 86_400.0;
        let conn = self.db.conn()?;
        let removed = conn.execute(
            "DELETE FROM logs WHERE channel = ?1 AND ts < ?2",
            params![channel, cutoff],
        )?;
        Ok(removed as u64)
    }

    /// Channels that currently hold records.
    pub fn channels(&self) -> Result<Vec<String>> {
        let conn = self.db.conn()?;
        let mut stmt = conn.prepare("SELECT DISTINCT channel FROM logs ORDER BY channel")?;
        let channels = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(channels)
    }
}

/// Keep channel-derived file names flat and shell-safe.
fn sanitize_channel(channel: &str) -> String {
    channel
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testutil::temp_db;

    #[test]
    fn test_log_and_tail() {
        let (_dir, db) = temp_db();
        let logs = LogStore::new(db, None);

        logs.log("raspi", "in", "peer: TTP00002=?").expect("log");
        logs.log("raspi", "out", "to peer: TTP00002=75").expect("log");
        logs.log("printer", "in", "raspi-> printer: TTP00002=?").expect("log");

        let tail = logs.tail("raspi", 10).expect("tail");
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].direction, "in");
        assert_eq!(tail[1].direction, "out");

        let channels = logs.channels().expect("channels");
        assert_eq!(channels, vec!["printer".to_string(), "raspi".to_string()]);
    }

    #[test]
    fn test_tail_limit_keeps_newest() {
        let (_dir, db) = temp_db();
        let logs = LogStore::new(db, None);
        for i in 0..5 {
            logs.log("raspi", "info", &format!("line {i}")).expect("log");
        }

        let tail = logs.tail("raspi", 2).expect("tail");
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].message, "line 3");
        assert_eq!(tail[1].message, "line 4");
    }

    #[test]
    fn test_file_append() {
        let (dir, db) = temp_db();
        let logdir = dir.path().join("logs");
        let logs = LogStore::new(db, Some(logdir.clone()));

        logs.log("plc", "out", "MAP0001=?").expect("log");

        let content = std::fs::read_to_string(logdir.join("plc.log")).expect("read");
        let record: serde_json::Value =
            serde_json::from_str(content.lines().next().expect("line")).expect("json");
        assert_eq!(record["message"], "MAP0001=?");
        assert_eq!(record["direction"], "out");
    }

    #[test]
    fn test_prune_removes_old_rows() {
        let (_dir, db) = temp_db();
        let logs = LogStore::new(db.clone(), None);
        logs.log("raspi", "info", "old").expect("log");

        // Backdate the row past the retention window
        let conn = db.conn().expect("conn");
        conn.execute("UPDATE logs SET ts = ts - 10.0 * 86400.0", [])
            .expect("backdate");
        drop(conn);

        logs.log("raspi", "info", "fresh").expect("log");

        let removed = logs.prune("raspi", 7).expect("prune");
        assert_eq!(removed, 1);
        let tail = logs.tail("raspi", 10).expect("tail");
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].message, "fresh");
    }

    #[test]
    fn test_sanitize_channel() {
        assert_eq!(sanitize_channel("raspi"), "raspi");
        assert_eq!(sanitize_channel("../etc/passwd"), "___etc_passwd");
    }
}
