// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Bridge configuration.
//!
//! A single JSON file, every key optional with a default, unknown keys
//! ignored. The sender loop reloads it each iteration, so edits through the
//! admin API take effect without a restart. Partial edits arrive as a
//! [`SettingsPatch`] and are merged explicitly.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

/// Default config file location.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/fieldbridge/config.json";

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// One field device endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceEndpoint {
    /// Device host; empty disables the endpoint.
    pub host: String,
    pub port: u16,
    /// Answer from the local parameter store instead of the wire.
    pub simulation: bool,
    /// Liveness probe target; falls back to `host` when empty.
    pub watchdog_host: String,
}

impl Default for DeviceEndpoint {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 0,
            simulation: true,
            watchdog_host: String::new(),
        }
    }
}

impl DeviceEndpoint {
    fn at(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
            ..Default::default()
        }
    }
}

/// Bridge settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    // Storage
    pub db_path: String,
    pub log_dir: String,

    // HTTP server
    pub http_host: String,
    pub http_port: u16,
    pub http_tls: bool,
    pub tls_cert: String,
    pub tls_key: String,

    // Peer
    pub peer_base_url: String,
    pub peer_watchdog_host: String,
    pub peer_health_path: String,

    // Outbound HTTP
    pub source_ip: String,
    pub tls_verify: bool,
    pub http_timeout_s: f64,

    // Watchdog
    pub watchdog_interval_s: f64,
    pub watchdog_timeout_s: f64,
    pub watchdog_down_after: u32,

    // Outbox retry
    pub retry_base_s: f64,
    pub retry_cap_s: f64,

    // Auth
    pub ui_token: String,
    pub shared_secret: String,

    // Field devices
    pub plc: DeviceEndpoint,
    pub printer: DeviceEndpoint,
    pub laser: DeviceEndpoint,

    // Log retention
    pub log_retention_days: u32,
    pub log_retention_overrides: BTreeMap<String, u32>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            db_path: "/var/lib/fieldbridge/bridge.db".to_string(),
            log_dir: "/var/log/fieldbridge".to_string(),
            http_host: "0.0.0.0".to_string(),
            http_port: 8080,
            http_tls: false,
            tls_cert: String::new(),
            tls_key: String::new(),
            peer_base_url: "http://127.0.0.1:9090".to_string(),
            peer_watchdog_host: "127.0.0.1".to_string(),
            peer_health_path: "/health".to_string(),
            source_ip: String::new(),
            tls_verify: false,
            http_timeout_s: 10.0,
            watchdog_interval_s: 2.0,
            watchdog_timeout_s: 1.0,
            watchdog_down_after: 3,
            retry_base_s: 1.0,
            retry_cap_s: 60.0,
            ui_token: "change-me".to_string(),
            shared_secret: String::new(),
            plc: DeviceEndpoint::at("192.168.2.10", 5000),
            printer: DeviceEndpoint::at("192.168.2.30", 3007),
            laser: DeviceEndpoint::at("192.168.2.20", 20000),
            log_retention_days: 14,
            log_retention_overrides: BTreeMap::new(),
        }
    }
}

impl Settings {
    /// Load settings; a missing file is created with defaults so the first
    /// boot leaves an editable config behind.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            let settings = Self::default();
            settings.save(path)?;
            return Ok(settings);
        }

        let content = std::fs::read_to_string(path)?;
        let settings: Self = serde_json::from_str(&content)?;
        Ok(settings)
    }

    /// Write settings as pretty-printed JSON, creating parent directories.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Reject configurations the process cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.http_tls {
            if self.tls_cert.is_empty() || self.tls_key.is_empty() {
                return Err(ConfigError::Invalid(
                    "http_tls enabled but tls_cert/tls_key not configured".into(),
                ));
            }
            for path in [&self.tls_cert, &self.tls_key] {
                if !Path::new(path).exists() {
                    return Err(ConfigError::Invalid(format!(
                        "TLS material missing: {}",
                        path
                    )));
                }
            }
        }

        if self.retry_base_s <= 0.0 || self.retry_cap_s < self.retry_base_s {
            return Err(ConfigError::Invalid(
                "retry_base_s must be > 0 and retry_cap_s >= retry_base_s".into(),
            ));
        }

        Ok(())
    }

    /// Full peer health URL, when a health path is configured.
    #[must_use]
    pub fn peer_health_url(&self) -> Option<String> {
        if self.peer_health_path.is_empty() {
            return None;
        }
        Some(format!(
            "{}{}",
            self.peer_base_url.trim_end_matches('/'),
            self.peer_health_path
        ))
    }

    /// Peer inbox endpoint replies are POSTed to.
    #[must_use]
    pub fn peer_inbox_url(&self) -> String {
        format!("{}/api/inbox", self.peer_base_url.trim_end_matches('/'))
    }

    /// Retention window for one log channel.
    #[must_use]
    pub fn retention_days_for(&self, channel: &str) -> u32 {
        self.log_retention_overrides
            .get(channel)
            .copied()
            .unwrap_or(self.log_retention_days)
    }
}

/// Partial settings update; unset fields keep their current value. Device
/// endpoint sections are replaced whole.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SettingsPatch {
    pub db_path: Option<String>,
    pub log_dir: Option<String>,
    pub http_host: Option<String>,
    pub http_port: Option<u16>,
    pub http_tls: Option<bool>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub peer_base_url: Option<String>,
    pub peer_watchdog_host: Option<String>,
    pub peer_health_path: Option<String>,
    pub source_ip: Option<String>,
    pub tls_verify: Option<bool>,
    pub http_timeout_s: Option<f64>,
    pub watchdog_interval_s: Option<f64>,
    pub watchdog_timeout_s: Option<f64>,
    pub watchdog_down_after: Option<u32>,
    pub retry_base_s: Option<f64>,
    pub retry_cap_s: Option<f64>,
    pub ui_token: Option<String>,
    pub shared_secret: Option<String>,
    pub plc: Option<DeviceEndpoint>,
    pub printer: Option<DeviceEndpoint>,
    pub laser: Option<DeviceEndpoint>,
    pub log_retention_days: Option<u32>,
    pub log_retention_overrides: Option<BTreeMap<String, u32>>,
}

impl SettingsPatch {
    /// Apply the patch onto existing settings.
    pub fn merge_into(self, settings: &mut Settings) {
        fn set<T>(slot: &mut T, value: Option<T>) {
            if let Some(value) = value {
                *slot = value;
            }
        }

        set(&mut settings.db_path, self.db_path);
        set(&mut settings.log_dir, self.log_dir);
        set(&mut settings.http_host, self.http_host);
        set(&mut settings.http_port, self.http_port);
        set(&mut settings.http_tls, self.http_tls);
        set(&mut settings.tls_cert, self.tls_cert);
        set(&mut settings.tls_key, self.tls_key);
        set(&mut settings.peer_base_url, self.peer_base_url);
        set(&mut settings.peer_watchdog_host, self.peer_watchdog_host);
        set(&mut settings.peer_health_path, self.peer_health_path);
        set(&mut settings.source_ip, self.source_ip);
        set(&mut settings.tls_verify, self.tls_verify);
        set(&mut settings.http_timeout_s, self.http_timeout_s);
        set(&mut settings.watchdog_interval_s, self.watchdog_interval_s);
        set(&mut settings.watchdog_timeout_s, self.watchdog_timeout_s);
        set(&mut settings.watchdog_down_after, self.watchdog_down_after);
        set(&mut settings.retry_base_s, self.retry_base_s);
        set(&mut settings.retry_cap_s, self.retry_cap_s);
        set(&mut settings.ui_token, self.ui_token);
        set(&mut settings.shared_secret, self.shared_secret);
        set(&mut settings.plc, self.plc);
        set(&mut settings.printer, self.printer);
        set(&mut settings.laser, self.laser);
        set(&mut settings.log_retention_days, self.log_retention_days);
        set(&mut settings.log_retention_overrides, self.log_retention_overrides);
    }
}
