// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! fieldbridge - edge data bridge between a control host and field devices.
//!
//! Runs on a small Linux gateway between an industrial control host (the
//! "peer") and three field devices: a line-protocol PLC, a ZBC-framed
//! thermal-transfer printer and an Ultimate-ASCII laser marker. The peer
//! pushes request lines over HTTP; the bridge routes them to the right
//! device, normalizes the answer and delivers it back - at least once, with
//! idempotency keys, surviving crashes and peer outages through durable
//! on-disk queues.
//!
//! # Architecture
//!
//! ```text
//! Peer -> intake -> Inbox -> Router -> DeviceBridge -> device
//!                                          |
//! Peer <- Sender <- Outbox <- reply line <-+
//! ```
//!
//! Three concurrent activities share the SQLite store: the axum intake
//! server, one sender loop (which also runs the peer watchdog) and one
//! router loop. See the module docs for the wire formats and queue
//! semantics.

pub mod api;
pub mod config;
pub mod device;
pub mod http;
pub mod params;
pub mod protocol;
pub mod router;
pub mod sender;
pub mod store;
pub mod watchdog;

pub use config::{ConfigError, DeviceEndpoint, Settings, SettingsPatch};
pub use device::{Device, DeviceBridge};
pub use params::{DeviceMap, MetaPatch, ParamMeta, ParamStore, Verdict};
pub use protocol::{NakKind, Op, ParamRequest};
pub use router::Router;
pub use sender::Sender;
pub use store::inbox::Inbox;
pub use store::logstore::LogStore;
pub use store::outbox::Outbox;
pub use store::Db;
pub use watchdog::{Watchdog, WatchdogState};
