// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Outbox sender loop.
//!
//! One worker: while the peer watchdog reports up, pop the oldest due job,
//! POST it, delete it on 2xx, otherwise reschedule with exponential backoff.
//! Configuration is reloaded every iteration so edits through the admin API
//! take effect without a restart.

use crate::config::Settings;
use crate::http::HttpClient;
use crate::store::logstore::LogStore;
use crate::store::outbox::Outbox;
use crate::store::{now_ts, Db};
use crate::watchdog::{Watchdog, WatchdogState};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Sleep when the outbox has nothing due.
const IDLE_SLEEP: Duration = Duration::from_millis(200);

/// How often the log retention window is enforced.
const PRUNE_INTERVAL: Duration = Duration::from_secs(600);

/// Exponential backoff with a cap: `min(cap, base * 2^min(n, 10))`.
#[must_use]
pub fn backoff_s(retry_count: u32, base: f64, cap: f64) -> f64 {
    let exp = retry_count.min(10);
    (base * f64::from(1u32 << exp)).min(cap)
}

/// Outbox sender worker.
pub struct Sender {
    config_path: PathBuf,
    db: Db,
    state: WatchdogState,
    running: Arc<AtomicBool>,
}

impl Sender {
    #[must_use]
    pub fn new(
        config_path: PathBuf,
        db: Db,
        state: WatchdogState,
        running: Arc<AtomicBool>,
    ) -> Self {
        Self {
            config_path,
            db,
            state,
            running,
        }
    }

    /// Run until the running flag is cleared.
    pub fn run(&self) {
        tracing::info!("sender loop started");

        let outbox = Outbox::new(self.db.clone());
        let mut settings = match Settings::load(&self.config_path) {
            Ok(settings) => settings,
            Err(err) => {
                tracing::error!("sender cannot load config: {:#}", err);
                return;
            }
        };
        let mut watchdog = build_watchdog(&settings, self.state.clone());
        let mut client = build_client(&settings);
        let mut last_prune: Option<Instant> = None;

        while self.running.load(Ordering::Relaxed) {
            // Pick up config edits without restart; peers and timeouts may
            // have changed, so dependent handles are rebuilt on change.
            match Settings::load(&self.config_path) {
                Ok(fresh) => {
                    if fresh != settings {
                        tracing::info!("configuration changed, rebuilding sender state");
                        watchdog = build_watchdog(&fresh, self.state.clone());
                        client = build_client(&fresh);
                        settings = fresh;
                    }
                }
                Err(err) => tracing::warn!("config reload failed: {:#}", err),
            }

            if last_prune.map_or(true, |t| t.elapsed() >= PRUNE_INTERVAL) {
                last_prune = Some(Instant::now());
                self.prune_logs(&settings);
            }

            if !watchdog.tick() {
                std::thread::sleep(Duration::from_secs_f64(
                    settings.watchdog_interval_s.clamp(0.1, 60.0),
                ));
                continue;
            }

            let job = match outbox.next_due() {
                Ok(Some(job)) => job,
                Ok(None) => {
                    std::thread::sleep(IDLE_SLEEP);
                    continue;
                }
                Err(err) => {
                    tracing::error!("outbox query failed: {:#}", err);
                    std::thread::sleep(IDLE_SLEEP);
                    continue;
                }
            };

            let Some(client) = &client else {
                std::thread::sleep(IDLE_SLEEP);
                continue;
            };

            tracing::debug!(
                "sending outbox id={} rc={} {} {}",
                job.id,
                job.retry_count,
                job.method,
                job.url
            );

            match client.request(&job.method, &job.url, &job.headers(), job.body().as_ref()) {
                Ok(_) => {
                    tracing::info!("delivered outbox id={} to {}", job.id, job.url);
                    if let Err(err) = outbox.delete(job.id) {
                        tracing::error!("outbox delete failed for id={}: {:#}", job.id, err);
                    }
                }
                Err(err) => {
                    let retry_count = job.retry_count + 1;
                    // First failure waits the base interval: exponent is the
                    // count of failures before this one.
                    let delay =
                        backoff_s(job.retry_count, settings.retry_base_s, settings.retry_cap_s);
                    tracing::warn!(
                        "delivery failed for outbox id={} rc={} next_in={:.0}s: {}",
                        job.id,
                        retry_count,
                        delay,
                        err
                    );
                    if let Err(err) = outbox.reschedule(job.id, retry_count, now_ts() + delay) {
                        tracing::error!("outbox reschedule failed for id={}: {:#}", job.id, err);
                    }
                }
            }
        }

        tracing::info!("sender loop stopped");
    }

    fn prune_logs(&self, settings: &Settings) {
        let logs = LogStore::new(self.db.clone(), None);
        match logs.channels() {
            Ok(channels) => {
                for channel in channels {
                    let days = settings.retention_days_for(&channel);
                    match logs.prune(&channel, days) {
                        Ok(0) => {}
                        Ok(n) => tracing::debug!("pruned {} log rows on {}", n, channel),
                        Err(err) => tracing::warn!("log prune failed on {}: {:#}", channel, err),
                    }
                }
            }
            Err(err) => tracing::warn!("log prune skipped: {:#}", err),
        }
    }
}

fn build_watchdog(settings: &Settings, state: WatchdogState) -> Watchdog {
    Watchdog::new(
        &settings.peer_watchdog_host,
        settings.peer_health_url(),
        Duration::from_secs_f64(settings.watchdog_interval_s.clamp(0.1, 3600.0)),
        Duration::from_secs_f64(settings.watchdog_timeout_s.clamp(0.1, 60.0)),
        settings.watchdog_down_after,
        settings.tls_verify,
        state,
    )
}

fn build_client(settings: &Settings) -> Option<HttpClient> {
    let source_ip = if settings.source_ip.is_empty() {
        None
    } else {
        match settings.source_ip.parse() {
            Ok(ip) => Some(ip),
            Err(_) => {
                tracing::warn!("invalid source_ip {:?}, binding disabled", settings.source_ip);
                None
            }
        }
    };

    match HttpClient::new(
        Duration::from_secs_f64(settings.http_timeout_s.clamp(0.1, 600.0)),
        source_ip,
        settings.tls_verify,
    ) {
        Ok(client) => Some(client),
        Err(err) => {
            tracing::error!("HTTP client construction failed: {}", err);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_schedule() {
        assert_eq!(backoff_s(0, 1.0, 60.0), 1.0);
        assert_eq!(backoff_s(1, 1.0, 60.0), 2.0);
        assert_eq!(backoff_s(2, 1.0, 60.0), 4.0);
        assert_eq!(backoff_s(3, 1.0, 60.0), 8.0);
        // capped
        assert_eq!(backoff_s(6, 1.0, 60.0), 60.0);
        // exponent clamp keeps large retry counts finite
        assert_eq!(backoff_s(500, 1.0, 1.0e9), 1024.0);
    }

    #[test]
    fn test_backoff_monotonic_and_capped() {
        let (base, cap) = (0.5, 30.0);
        let mut prev = 0.0;
        for n in 0..64 {
            let b = backoff_s(n, base, cap);
            assert!(b >= prev, "backoff must not shrink at n={n}");
            assert!(b <= cap, "backoff must respect the cap at n={n}");
            prev = b;
        }
        assert_eq!(backoff_s(0, base, cap), base);
    }
}
