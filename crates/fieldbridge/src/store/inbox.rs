// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Durable set of incoming peer messages with idempotent intake and a
//! claim/ack state machine.
//!
//! A message moves `pending -> processing -> done`; `nack` sends it back to
//! `pending`. The claim runs inside `BEGIN IMMEDIATE`, so concurrent routers
//! never observe the same row as pending.

use super::{now_ts, Db};
use anyhow::Result;
use rusqlite::{params, OptionalExtension, Row, TransactionBehavior};
use serde::Serialize;
use std::collections::BTreeMap;

/// Processing state of an inbox row.
pub const STATE_PENDING: &str = "pending";
pub const STATE_PROCESSING: &str = "processing";
pub const STATE_DONE: &str = "done";

/// One received message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InboxMsg {
    pub id: i64,
    pub received_ts: f64,
    pub source: Option<String>,
    pub headers_json: String,
    pub body_json: Option<String>,
    pub idempotency_key: String,
    pub state: String,
}

impl InboxMsg {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            received_ts: row.get(1)?,
            source: row.get(2)?,
            headers_json: row.get(3)?,
            body_json: row.get(4)?,
            idempotency_key: row.get(5)?,
            state: row.get(6)?,
        })
    }
}

const MSG_COLUMNS: &str =
    "id, received_ts, source, headers_json, body_json, idempotency_key, state";

/// Inbox table access.
#[derive(Debug, Clone)]
pub struct Inbox {
    db: Db,
}

impl Inbox {
    #[must_use]
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Store a message; returns false when the idempotency key already
    /// exists and the duplicate was silently dropped.
    pub fn store(
        &self,
        source: Option<&str>,
        headers: &BTreeMap<String, String>,
        body: Option<&str>,
        idempotency_key: &str,
    ) -> Result<bool> {
        let conn = self.db.conn()?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO inbox (received_ts, source, headers_json, body_json, idempotency_key, state)
             VALUES (?1, ?2, ?3, ?4, ?5, 'pending')",
            params![
                now_ts(),
                source,
                serde_json::to_string(headers)?,
                body,
                idempotency_key,
            ],
        )?;
        Ok(inserted > 0)
    }

    /// Peek at the oldest pending message without claiming it.
    pub fn next_pending(&self) -> Result<Option<InboxMsg>> {
        let conn = self.db.conn()?;
        let msg = conn
            .query_row(
                &format!(
                    "SELECT {MSG_COLUMNS} FROM inbox
                     WHERE state = 'pending'
                     ORDER BY received_ts ASC
                     LIMIT 1"
                ),
                [],
                InboxMsg::from_row,
            )
            .optional()?;
        Ok(msg)
    }

    /// Atomically take the oldest pending message and mark it `processing`.
    ///
    /// `BEGIN IMMEDIATE` takes the write lock up front; two routers claiming
    /// concurrently always receive disjoint rows.
    pub fn claim_next_pending(&self) -> Result<Option<InboxMsg>> {
        let mut conn = self.db.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let msg = tx
            .query_row(
                &format!(
                    "SELECT {MSG_COLUMNS} FROM inbox
                     WHERE state = 'pending'
                     ORDER BY received_ts ASC
                     LIMIT 1"
                ),
                [],
                InboxMsg::from_row,
            )
            .optional()?;

        let Some(mut msg) = msg else {
            tx.commit()?;
            return Ok(None);
        };

        tx.execute(
            "UPDATE inbox SET state = 'processing' WHERE id = ?1 AND state = 'pending'",
            params![msg.id],
        )?;
        tx.commit()?;

        msg.state = STATE_PROCESSING.to_string();
        Ok(Some(msg))
    }

    /// Mark a message done.
    pub fn ack(&self, id: i64) -> Result<()> {
        self.set_state(id, STATE_DONE)
    }

    /// Return a message to `pending` for another attempt.
    pub fn nack(&self, id: i64) -> Result<()> {
        self.set_state(id, STATE_PENDING)
    }

    fn set_state(&self, id: i64, state: &str) -> Result<()> {
        let conn = self.db.conn()?;
        conn.execute(
            "UPDATE inbox SET state = ?1 WHERE id = ?2",
            params![state, id],
        )?;
        Ok(())
    }

    /// Number of messages waiting to be claimed.
    pub fn count_pending(&self) -> Result<u64> {
        let conn = self.db.conn()?;
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM inbox WHERE state = 'pending'",
            [],
            |row| row.get(0),
        )?;
        Ok(n as u64)
    }
}
