// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Durable FIFO of outbound HTTP jobs.
//!
//! Every reply the bridge owes the peer becomes an outbox row. The sender
//! loop pops the oldest due job, POSTs it, and deletes it on success or
//! reschedules it with backoff on failure. Jobs always carry an
//! `X-Idempotency-Key` header so the peer can dedupe retried deliveries.

use super::{now_ts, Db};
use anyhow::Result;
use rusqlite::{params, OptionalExtension, Row};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

/// One enqueued HTTP job.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboxJob {
    pub id: i64,
    pub created_ts: f64,
    pub method: String,
    pub url: String,
    pub headers_json: String,
    pub body_json: Option<String>,
    pub idempotency_key: String,
    pub retry_count: u32,
    pub next_attempt_ts: f64,
}

impl OutboxJob {
    /// Deserialized request headers.
    #[must_use]
    pub fn headers(&self) -> BTreeMap<String, String> {
        serde_json::from_str(&self.headers_json).unwrap_or_default()
    }

    /// Deserialized JSON body, if any.
    #[must_use]
    pub fn body(&self) -> Option<Value> {
        self.body_json
            .as_deref()
            .and_then(|b| serde_json::from_str(b).ok())
    }

    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            created_ts: row.get(1)?,
            method: row.get(2)?,
            url: row.get(3)?,
            headers_json: row.get(4)?,
            body_json: row.get(5)?,
            idempotency_key: row.get(6)?,
            retry_count: row.get(7)?,
            next_attempt_ts: row.get(8)?,
        })
    }
}

const JOB_COLUMNS: &str =
    "id, created_ts, method, url, headers_json, body_json, idempotency_key, retry_count, next_attempt_ts";

/// Outbox table access.
#[derive(Debug, Clone)]
pub struct Outbox {
    db: Db,
}

impl Outbox {
    #[must_use]
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Enqueue a job, generating a fresh idempotency key when none is given.
    ///
    /// `X-Idempotency-Key` and `Content-Type: application/json` are filled in
    /// unless the caller already set them. Returns the idempotency key.
    pub fn enqueue(
        &self,
        method: &str,
        url: &str,
        headers: &BTreeMap<String, String>,
        body: Option<&Value>,
        idempotency_key: Option<String>,
    ) -> Result<String> {
        let key = idempotency_key.unwrap_or_else(|| Uuid::new_v4().to_string());

        let mut headers = headers.clone();
        headers
            .entry("X-Idempotency-Key".to_string())
            .or_insert_with(|| key.clone());
        headers
            .entry("Content-Type".to_string())
            .or_insert_with(|| "application/json".to_string());

        let body_json = body.map(serde_json::to_string).transpose()?;

        let conn = self.db.conn()?;
        conn.execute(
            "INSERT INTO outbox (created_ts, method, url, headers_json, body_json, idempotency_key)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                now_ts(),
                method.to_ascii_uppercase(),
                url,
                serde_json::to_string(&headers)?,
                body_json,
                key,
            ],
        )?;

        Ok(key)
    }

    /// The single oldest job whose `next_attempt_ts` has passed.
    pub fn next_due(&self) -> Result<Option<OutboxJob>> {
        let conn = self.db.conn()?;
        let job = conn
            .query_row(
                &format!(
                    "SELECT {JOB_COLUMNS} FROM outbox
                     WHERE next_attempt_ts <= ?1
                     ORDER BY next_attempt_ts ASC, retry_count ASC, created_ts ASC
                     LIMIT 1"
                ),
                params![now_ts()],
                OutboxJob::from_row,
            )
            .optional()?;
        Ok(job)
    }

    /// Remove a delivered job.
    pub fn delete(&self, id: i64) -> Result<()> {
        let conn = self.db.conn()?;
        conn.execute("DELETE FROM outbox WHERE id = ?1", params![id])?;
        Ok(())
    }

    /// Push a failed job's next attempt into the future.
    pub fn reschedule(&self, id: i64, retry_count: u32, next_attempt_ts: f64) -> Result<()> {
        let conn = self.db.conn()?;
        conn.execute(
            "UPDATE outbox SET retry_count = ?1, next_attempt_ts = ?2 WHERE id = ?3",
            params![retry_count, next_attempt_ts, id],
        )?;
        Ok(())
    }

    /// Number of jobs still waiting for delivery.
    pub fn count(&self) -> Result<u64> {
        let conn = self.db.conn()?;
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM outbox", [], |row| row.get(0))?;
        Ok(n as u64)
    }
}
