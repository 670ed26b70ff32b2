// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! fieldbridge service CLI
//!
//! # Usage
//!
//! ```bash
//! # Run with the default config path
//! fieldbridge
//!
//! # Run against a specific config file
//! fieldbridge --config /etc/fieldbridge/config.json
//!
//! # Generate an editable default configuration
//! fieldbridge gen-config --output config.json
//!
//! # Validate a configuration file
//! fieldbridge validate --config config.json
//!
//! # Seed parameter metadata from a JSON file
//! fieldbridge import-params --file params.json
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fieldbridge::api::{self, AppState};
use fieldbridge::config::{Settings, DEFAULT_CONFIG_PATH};
use fieldbridge::device::DeviceBridge;
use fieldbridge::params::{DeviceMap, ParamMeta, ParamStore};
use fieldbridge::store::inbox::Inbox;
use fieldbridge::store::logstore::LogStore;
use fieldbridge::store::outbox::Outbox;
use fieldbridge::store::Db;
use fieldbridge::watchdog::WatchdogState;
use fieldbridge::{protocol, Router, Sender};
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Edge data bridge between a control host and field devices
#[derive(Parser, Debug)]
#[command(name = "fieldbridge")]
#[command(about = "Edge data bridge between a control host and field devices")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate an example configuration file
    GenConfig {
        /// Output file path
        #[arg(short, long, default_value = "config.json")]
        output: PathBuf,
    },

    /// Validate a configuration file
    Validate {
        /// Configuration file path
        #[arg(short, long)]
        config: PathBuf,
    },

    /// Import parameter metadata from a JSON file
    ImportParams {
        /// JSON file with an array of parameter records
        #[arg(short, long)]
        file: PathBuf,
    },

    /// Show queue depths
    Stats,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    if let Some(cmd) = args.command {
        return match cmd {
            Commands::GenConfig { output } => cmd_gen_config(output),
            Commands::Validate { config } => cmd_validate(config),
            Commands::ImportParams { file } => cmd_import_params(&args.config, file),
            Commands::Stats => cmd_stats(&args.config),
        };
    }

    run(args.config).await
}

async fn run(config_path: PathBuf) -> Result<()> {
    let settings = Settings::load(&config_path)
        .with_context(|| format!("cannot load config {}", config_path.display()))?;
    settings.validate().context("unrecoverable config error")?;

    let db = Db::open(&settings.db_path)?;

    tracing::info!("fieldbridge v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("  config: {}", config_path.display());
    tracing::info!("  database: {}", settings.db_path);
    tracing::info!("  peer: {}", settings.peer_base_url);

    let running = Arc::new(AtomicBool::new(true));
    let peer_state = WatchdogState::new();

    // Sender loop: outbox delivery plus the peer watchdog.
    let sender = Sender::new(
        config_path.clone(),
        db.clone(),
        peer_state.clone(),
        running.clone(),
    );
    let sender_handle = std::thread::Builder::new()
        .name("sender".into())
        .spawn(move || sender.run())
        .context("failed to spawn sender thread")?;

    // Router loop: inbox -> device bridge -> outbox.
    let logs = LogStore::new(db.clone(), Some(PathBuf::from(&settings.log_dir)));
    let bridge = DeviceBridge::new(&settings, ParamStore::new(db.clone()), logs.clone());
    let router = Router::new(
        settings.clone(),
        Inbox::new(db.clone()),
        Outbox::new(db.clone()),
        logs,
        bridge,
        running.clone(),
    );
    let router_handle = std::thread::Builder::new()
        .name("router".into())
        .spawn(move || router.run())
        .context("failed to spawn router thread")?;

    // Intake server; returns on ctrl-c.
    let state = Arc::new(AppState {
        config_path: config_path.clone(),
        db,
        peer_state,
    });
    let serve_result = api::serve(state, &settings).await;

    tracing::info!("shutting down");
    running.store(false, Ordering::Relaxed);
    let _ = sender_handle.join();
    let _ = router_handle.join();

    serve_result
}

fn cmd_gen_config(output: PathBuf) -> Result<()> {
    let settings = Settings::default();
    settings
        .save(&output)
        .with_context(|| format!("cannot write {}", output.display()))?;
    println!("Generated configuration file: {}", output.display());
    Ok(())
}

fn cmd_validate(config: PathBuf) -> Result<()> {
    match Settings::load(&config).and_then(|s| s.validate().map(|()| s)) {
        Ok(settings) => {
            println!("Configuration valid!");
            println!();
            println!("Peer: {}", settings.peer_base_url);
            println!("Database: {}", settings.db_path);
            println!(
                "Devices: plc={}:{} printer={}:{} laser={}:{}",
                settings.plc.host,
                settings.plc.port,
                settings.printer.host,
                settings.printer.port,
                settings.laser.host,
                settings.laser.port,
            );
            Ok(())
        }
        Err(e) => {
            eprintln!("Configuration invalid: {}", e);
            std::process::exit(1);
        }
    }
}

/// One record of the parameter import file.
#[derive(Debug, Deserialize)]
struct ImportRecord {
    ptype: String,
    pid: String,
    #[serde(default)]
    min: Option<f64>,
    #[serde(default)]
    max: Option<f64>,
    #[serde(default)]
    default: Option<String>,
    #[serde(default)]
    unit: Option<String>,
    #[serde(default)]
    rw: Option<String>,
    #[serde(default)]
    dtype: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    map: Option<DeviceMap>,
}

fn cmd_import_params(config_path: &PathBuf, file: PathBuf) -> Result<()> {
    let settings = Settings::load(config_path)?;
    let db = Db::open(&settings.db_path)?;
    let store = ParamStore::new(db);

    let content = std::fs::read_to_string(&file)
        .with_context(|| format!("cannot read {}", file.display()))?;
    let records: Vec<ImportRecord> =
        serde_json::from_str(&content).context("parameter file must be a JSON array")?;

    let mut imported = 0usize;
    let mut skipped = 0usize;
    for record in records {
        let ptype = record.ptype.trim().to_ascii_uppercase();
        let pid = record.pid.trim();
        if ptype.len() != 3 || pid.is_empty() {
            skipped += 1;
            continue;
        }

        let pid = protocol::normalize_pid(&ptype, pid);
        let pkey = format!("{}{}", ptype, pid);
        store.upsert_meta(&ParamMeta {
            pkey: pkey.clone(),
            ptype,
            pid,
            min: record.min,
            max: record.max,
            default: record.default,
            unit: record.unit,
            rw: record.rw,
            dtype: record.dtype,
            name: record.name,
            message: record.message,
        })?;
        if let Some(map) = record.map {
            store.set_device_map(&pkey, &map)?;
        }
        imported += 1;
    }

    println!("Imported {} parameters ({} skipped)", imported, skipped);
    Ok(())
}

fn cmd_stats(config_path: &PathBuf) -> Result<()> {
    let settings = Settings::load(config_path)?;
    let db = Db::open(&settings.db_path)?;

    println!("Outbox jobs:   {}", Outbox::new(db.clone()).count()?);
    println!("Inbox pending: {}", Inbox::new(db).count_pending()?);
    Ok(())
}
