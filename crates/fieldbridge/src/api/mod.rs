// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! HTTP surface of the bridge: peer intake plus the token-guarded admin API.
//!
//! # Endpoints
//!
//! - `POST /api/inbox` - peer intake (optional `X-Shared-Secret`)
//! - `GET  /health` - liveness for upstream probes
//! - `GET  /api/inbox/next`, `POST /api/inbox/{id}/ack` - admin drain
//! - `POST /api/outbox/enqueue` - admin enqueue
//! - `GET  /api/status` - queue depths and peer liveness
//! - `GET/POST /api/config` - settings read / patch
//! - `GET  /api/logs` - per-channel tail
//! - `POST /api/send` - operator line injection
//! - `GET  /api/params`, `GET/POST /api/params/{pkey}` - parameter admin
//!
//! Admin endpoints require `X-Token` equal to the configured UI token.

mod handlers;

use crate::config::Settings;
use crate::store::Db;
use crate::watchdog::WatchdogState;
use anyhow::{Context, Result};
use axum::routing::{get, post};
use axum::Router;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Shared application state.
pub struct AppState {
    pub config_path: PathBuf,
    pub db: Db,
    pub peer_state: WatchdogState,
}

impl AppState {
    /// Settings are re-read per request so admin edits apply immediately.
    pub(crate) fn settings(&self) -> Result<Settings, crate::config::ConfigError> {
        Settings::load(&self.config_path)
    }
}

/// Build the application router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/api/inbox", post(handlers::intake))
        .route("/api/inbox/next", get(handlers::inbox_next))
        .route("/api/inbox/:id/ack", post(handlers::inbox_ack))
        .route("/api/outbox/enqueue", post(handlers::outbox_enqueue))
        .route("/api/status", get(handlers::status))
        .route("/api/config", get(handlers::config_get).post(handlers::config_update))
        .route("/api/logs", get(handlers::logs_tail))
        .route("/api/send", post(handlers::send_line))
        .route("/api/params", get(handlers::params_list))
        .route(
            "/api/params/:pkey",
            get(handlers::params_get).post(handlers::params_edit),
        )
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve plain HTTP or, when configured, TLS-terminated HTTPS.
pub async fn serve(state: Arc<AppState>, settings: &Settings) -> Result<()> {
    let addr = format!("{}:{}", settings.http_host, settings.http_port);
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;

    if settings.http_tls {
        tracing::info!("HTTPS server on https://{}", addr);
        serve_tls(listener, app, &settings.tls_cert, &settings.tls_key).await
    } else {
        tracing::info!("HTTP server on http://{}", addr);
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .context("HTTP server error")
    }
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

/// TLS accept loop: rustls handshake per connection, then hand the stream to
/// hyper with the axum router as the service.
async fn serve_tls(
    listener: tokio::net::TcpListener,
    app: Router,
    cert_path: &str,
    key_path: &str,
) -> Result<()> {
    use hyper_util::rt::{TokioExecutor, TokioIo};
    use hyper_util::server::conn::auto::Builder;
    use hyper_util::service::TowerToHyperService;
    use tokio_rustls::TlsAcceptor;

    let certs = load_certs(cert_path)?;
    let key = load_key(key_path)?;
    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("invalid TLS certificate/key pair")?;
    let acceptor = TlsAcceptor::from(Arc::new(config));

    loop {
        let (stream, peer) = tokio::select! {
            accepted = listener.accept() => accepted.context("TLS accept failed")?,
            _ = shutdown_signal() => return Ok(()),
        };

        let acceptor = acceptor.clone();
        let service = TowerToHyperService::new(app.clone());
        tokio::spawn(async move {
            let tls_stream = match acceptor.accept(stream).await {
                Ok(tls_stream) => tls_stream,
                Err(err) => {
                    tracing::debug!("TLS handshake failed from {}: {}", peer, err);
                    return;
                }
            };
            if let Err(err) = Builder::new(TokioExecutor::new())
                .serve_connection(TokioIo::new(tls_stream), service)
                .await
            {
                tracing::debug!("connection error from {}: {}", peer, err);
            }
        });
    }
}

fn load_certs(path: &str) -> Result<Vec<rustls::pki_types::CertificateDer<'static>>> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("cannot open TLS certificate {}", path))?;
    let certs = rustls_pemfile::certs(&mut std::io::BufReader::new(file))
        .collect::<std::io::Result<Vec<_>>>()
        .with_context(|| format!("cannot parse TLS certificate {}", path))?;
    anyhow::ensure!(!certs.is_empty(), "no certificates found in {}", path);
    Ok(certs)
}

fn load_key(path: &str) -> Result<rustls::pki_types::PrivateKeyDer<'static>> {
    let file =
        std::fs::File::open(path).with_context(|| format!("cannot open TLS key {}", path))?;
    rustls_pemfile::private_key(&mut std::io::BufReader::new(file))
        .with_context(|| format!("cannot parse TLS key {}", path))?
        .ok_or_else(|| anyhow::anyhow!("no private key found in {}", path))
}

/// Constant-time string comparison for tokens and shared secrets.
#[must_use]
pub(crate) fn constant_time_eq(a: &str, b: &str) -> bool {
    let a = a.as_bytes();
    let b = b.as_bytes();

    let mut diff = a.len() ^ b.len();
    for i in 0..a.len().max(b.len()) {
        let x = a.get(i).copied().unwrap_or(0);
        let y = b.get(i).copied().unwrap_or(0);
        diff |= usize::from(x ^ y);
    }
    diff == 0
}
