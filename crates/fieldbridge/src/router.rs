// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The router: drains the inbox one message at a time and turns each into a
//! device exchange plus a queued reply to the peer.
//!
//! Every claimed message is acked, even when handling fails: a poison
//! message gets one log line and leaves the queue, so the pipeline can never
//! wedge behind an unparseable body. Replies go back through the outbox with
//! the original idempotency key forwarded as `X-Correlation-Id`.

use crate::config::Settings;
use crate::device::{Device, DeviceBridge};
use crate::protocol;
use crate::store::inbox::{Inbox, InboxMsg};
use crate::store::logstore::LogStore;
use crate::store::outbox::Outbox;
use anyhow::Result;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Sleep between polls when the inbox is empty.
const IDLE_SLEEP: Duration = Duration::from_millis(200);

/// Inbox drain loop.
pub struct Router {
    settings: Settings,
    inbox: Inbox,
    outbox: Outbox,
    logs: LogStore,
    bridge: DeviceBridge,
    running: Arc<AtomicBool>,
}

impl Router {
    #[must_use]
    pub fn new(
        settings: Settings,
        inbox: Inbox,
        outbox: Outbox,
        logs: LogStore,
        bridge: DeviceBridge,
        running: Arc<AtomicBool>,
    ) -> Self {
        Self {
            settings,
            inbox,
            outbox,
            logs,
            bridge,
            running,
        }
    }

    /// Run until the running flag is cleared.
    pub fn run(&self) {
        tracing::info!("router loop started");
        while self.running.load(Ordering::Relaxed) {
            match self.tick_once() {
                Ok(true) => {}
                Ok(false) => std::thread::sleep(IDLE_SLEEP),
                Err(err) => {
                    tracing::error!("router tick failed: {:#}", err);
                    std::thread::sleep(IDLE_SLEEP);
                }
            }
        }
        tracing::info!("router loop stopped");
    }

    /// Process at most one message; returns whether one was claimed.
    pub fn tick_once(&self) -> Result<bool> {
        let Some(msg) = self.inbox.claim_next_pending()? else {
            return Ok(false);
        };

        let Some(line) = extract_line(msg.body_json.as_deref()) else {
            self.logs.log(
                "raspi",
                "info",
                &format!("inbox id={} carries no msg/line/text/cmd, ignored", msg.id),
            )?;
            self.inbox.ack(msg.id)?;
            return Ok(true);
        };

        if let Err(err) = self.handle_line(&line, &msg) {
            // Deliberate policy: the message is acked anyway so a poison
            // line cannot block the queue.
            self.logs.log(
                "raspi",
                "error",
                &format!("router error for inbox id={}: {:#}", msg.id, err),
            )?;
        }
        self.inbox.ack(msg.id)?;
        Ok(true)
    }

    /// Decode the line, run the device exchange, queue the reply.
    fn handle_line(&self, line: &str, msg: &InboxMsg) -> Result<()> {
        let Some(request) = protocol::parse_request(line) else {
            self.logs
                .log("raspi", "info", &format!("unroutable line: {}", line))?;
            return Ok(());
        };

        let device = Device::for_ptype(&request.ptype);
        let channel = device.channel();

        self.logs.log("raspi", "in", &format!("peer: {}", line))?;
        self.logs
            .log(channel, "in", &format!("raspi-> {}: {}", channel, line))?;

        let reply = self.bridge.execute(device, &request);

        self.logs
            .log(channel, "out", &format!("{}->raspi: {}", channel, reply))?;
        self.logs.log("raspi", "out", &format!("to peer: {}", reply))?;

        self.enqueue_reply(&reply, Some(&msg.idempotency_key))?;
        Ok(())
    }

    /// Queue a reply line for the peer inbox.
    pub fn enqueue_reply(&self, line: &str, correlation: Option<&str>) -> Result<()> {
        let mut headers = BTreeMap::new();
        if let Some(correlation) = correlation {
            headers.insert("X-Correlation-Id".to_string(), correlation.to_string());
        }
        let body = serde_json::json!({ "msg": line, "source": "raspi" });

        self.outbox.enqueue(
            "POST",
            &self.settings.peer_inbox_url(),
            &headers,
            Some(&body),
            None,
        )?;
        Ok(())
    }
}

/// Pull the routable line out of an inbox body.
///
/// A JSON string is the line itself; a JSON object yields its first
/// non-empty `msg`/`line`/`text`/`cmd` field; anything unparseable is taken
/// as plain text.
fn extract_line(body: Option<&str>) -> Option<String> {
    let body = body?;

    let Ok(value) = serde_json::from_str::<Value>(body) else {
        let s = body.trim();
        return if s.is_empty() { None } else { Some(s.to_string()) };
    };

    match value {
        Value::String(s) => {
            let s = s.trim().to_string();
            (!s.is_empty()).then_some(s)
        }
        Value::Object(map) => ["msg", "line", "text", "cmd"].iter().find_map(|key| {
            map.get(*key)
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        }),
        _ => None,
    }
}
