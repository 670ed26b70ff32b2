// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! HTTP request handlers.

use crate::api::{constant_time_eq, AppState};
use crate::config::{Settings, SettingsPatch};
use crate::params::{MetaPatch, ParamStore, Verdict};
use crate::protocol::{self, Op};
use crate::store::inbox::Inbox;
use crate::store::logstore::LogStore;
use crate::store::outbox::Outbox;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

/// API error response.
#[derive(Serialize)]
pub struct ApiError {
    pub error: String,
    pub code: u16,
}

impl ApiError {
    fn new(code: u16, error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            code,
        }
    }

    fn unauthorized() -> Self {
        Self::new(401, "unauthorized")
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(self)).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self::new(500, format!("{:#}", err))
    }
}

impl From<crate::config::ConfigError> for ApiError {
    fn from(err: crate::config::ConfigError) -> Self {
        Self::new(500, err.to_string())
    }
}

/// Reject admin requests without the configured UI token.
fn require_token(settings: &Settings, headers: &HeaderMap) -> Result<(), ApiError> {
    let supplied = headers
        .get("x-token")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if constant_time_eq(supplied, &settings.ui_token) {
        Ok(())
    } else {
        Err(ApiError::unauthorized())
    }
}

fn header_map(headers: &HeaderMap) -> BTreeMap<String, String> {
    headers
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                value.to_str().unwrap_or("").to_string(),
            )
        })
        .collect()
}

/// GET /health
pub async fn health() -> Response {
    (StatusCode::OK, Json(json!({"ok": true}))).into_response()
}

/// POST /api/inbox - peer intake with idempotent storage.
pub async fn intake(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let settings = state.settings()?;

    if !settings.shared_secret.is_empty() {
        let supplied = headers
            .get("x-shared-secret")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if !constant_time_eq(supplied, &settings.shared_secret) {
            return Err(ApiError::unauthorized());
        }
    }

    let idempotency_key = headers
        .get("x-idempotency-key")
        .or_else(|| headers.get("idempotency-key"))
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let body_text = String::from_utf8_lossy(&body).to_string();
    let source = serde_json::from_str::<Value>(&body_text)
        .ok()
        .and_then(|v| v.get("source").and_then(Value::as_str).map(str::to_string));

    let stored = Inbox::new(state.db.clone()).store(
        source.as_deref(),
        &header_map(&headers),
        Some(&body_text),
        &idempotency_key,
    )?;

    Ok((
        StatusCode::OK,
        Json(json!({
            "ok": true,
            "stored": stored,
            "idempotency_key": idempotency_key,
        })),
    )
        .into_response())
}

/// GET /api/inbox/next - peek at the oldest pending message.
pub async fn inbox_next(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let settings = state.settings()?;
    require_token(&settings, &headers)?;

    let msg = Inbox::new(state.db.clone()).next_pending()?;
    Ok((StatusCode::OK, Json(json!({"ok": true, "msg": msg}))).into_response())
}

/// POST /api/inbox/{id}/ack
pub async fn inbox_ack(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let settings = state.settings()?;
    require_token(&settings, &headers)?;

    Inbox::new(state.db.clone()).ack(id)?;
    Ok((StatusCode::OK, Json(json!({"ok": true}))).into_response())
}

#[derive(Deserialize)]
pub struct EnqueueRequest {
    #[serde(default = "default_method")]
    method: String,
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    headers: BTreeMap<String, String>,
    #[serde(default)]
    body: Option<Value>,
    #[serde(default)]
    idempotency_key: Option<String>,
}

fn default_method() -> String {
    "POST".to_string()
}

/// POST /api/outbox/enqueue - admin enqueue; `path` resolves against the
/// peer base URL.
pub async fn outbox_enqueue(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<EnqueueRequest>,
) -> Result<Response, ApiError> {
    let settings = state.settings()?;
    require_token(&settings, &headers)?;

    let url = match (request.url, request.path) {
        (Some(url), _) if !url.is_empty() => url,
        (_, Some(path)) if !path.is_empty() => {
            format!("{}{}", settings.peer_base_url.trim_end_matches('/'), path)
        }
        _ => return Err(ApiError::new(400, "url or path required")),
    };

    let key = Outbox::new(state.db.clone()).enqueue(
        &request.method,
        &url,
        &request.headers,
        request.body.as_ref(),
        request.idempotency_key,
    )?;

    Ok((
        StatusCode::OK,
        Json(json!({"ok": true, "idempotency_key": key})),
    )
        .into_response())
}

/// GET /api/status - queue depths and cached peer liveness.
pub async fn status(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let settings = state.settings()?;
    require_token(&settings, &headers)?;

    let outbox_count = Outbox::new(state.db.clone()).count()?;
    let inbox_pending = Inbox::new(state.db.clone()).count_pending()?;

    Ok((
        StatusCode::OK,
        Json(json!({
            "ok": true,
            "outbox_count": outbox_count,
            "inbox_pending": inbox_pending,
            "peer_up": state.peer_state.is_up(),
            "peer_base_url": settings.peer_base_url,
        })),
    )
        .into_response())
}

/// GET /api/config - settings with credentials masked.
pub async fn config_get(State(state): State<Arc<AppState>>) -> Result<Response, ApiError> {
    let settings = state.settings()?;
    let mut value = serde_json::to_value(&settings).map_err(anyhow::Error::from)?;
    value["ui_token"] = json!("***");
    if !settings.shared_secret.is_empty() {
        value["shared_secret"] = json!("***");
    }
    Ok((StatusCode::OK, Json(value)).into_response())
}

/// POST /api/config - merge a settings patch and persist it.
pub async fn config_update(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(patch): Json<SettingsPatch>,
) -> Result<Response, ApiError> {
    let mut settings = state.settings()?;
    require_token(&settings, &headers)?;

    patch.merge_into(&mut settings);
    settings
        .validate()
        .map_err(|err| ApiError::new(400, err.to_string()))?;
    settings.save(&state.config_path)?;

    Ok((StatusCode::OK, Json(json!({"ok": true}))).into_response())
}

#[derive(Deserialize)]
pub struct LogsQuery {
    #[serde(default = "default_channel")]
    channel: String,
    #[serde(default = "default_log_limit")]
    limit: u32,
}

fn default_channel() -> String {
    "raspi".to_string()
}

fn default_log_limit() -> u32 {
    200
}

/// GET /api/logs - tail one channel.
pub async fn logs_tail(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<LogsQuery>,
) -> Result<Response, ApiError> {
    let settings = state.settings()?;
    require_token(&settings, &headers)?;

    let records = LogStore::new(state.db.clone(), None).tail(&query.channel, query.limit)?;
    Ok((
        StatusCode::OK,
        Json(json!({"ok": true, "channel": query.channel, "items": records})),
    )
        .into_response())
}

#[derive(Deserialize)]
pub struct SendRequest {
    #[serde(default = "default_channel")]
    channel: String,
    line: String,
    #[serde(default)]
    correlation: Option<String>,
}

/// POST /api/send - operator line injection.
///
/// From the bridge channel the line goes straight to the peer. From a device
/// channel it is logged as device traffic, recorded in the parameter store
/// when it is a value report, and then forwarded to the peer.
pub async fn send_line(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<SendRequest>,
) -> Result<Response, ApiError> {
    let settings = state.settings()?;
    require_token(&settings, &headers)?;

    let line = request.line.trim().to_string();
    if line.is_empty() {
        return Err(ApiError::new(400, "line required"));
    }

    let logs = LogStore::new(state.db.clone(), Some(settings.log_dir.clone().into()));
    let outbox = Outbox::new(state.db.clone());
    let channel = request.channel.as_str();

    let mut enqueue_headers = BTreeMap::new();
    if let Some(correlation) = &request.correlation {
        enqueue_headers.insert("X-Correlation-Id".to_string(), correlation.clone());
    }

    let (source, mode) = if channel == "raspi" {
        logs.log("raspi", "out", &format!("manual->peer: {}", line))?;
        ("raspi".to_string(), "raspi_to_peer".to_string())
    } else {
        // device -> raspi -> peer
        logs.log(channel, "out", &format!("{}->raspi: {}", channel, line))?;
        logs.log("raspi", "in", &format!("{}: {}", channel, line))?;
        logs.log("raspi", "out", &format!("to peer: {}", line))?;

        // A value report from a device channel updates the local store, the
        // same way a live read would.
        if let Some(parsed) = protocol::parse_request(&line) {
            if parsed.op == Op::Write {
                let _ = ParamStore::new(state.db.clone())
                    .apply_device_value(&parsed.pkey, &parsed.value)?;
            }
        }

        (channel.to_string(), format!("{}_to_raspi_to_peer", channel))
    };

    outbox.enqueue(
        "POST",
        &settings.peer_inbox_url(),
        &enqueue_headers,
        Some(&json!({"msg": line, "source": source})),
        None,
    )?;

    Ok((
        StatusCode::OK,
        Json(json!({"ok": true, "sent": true, "mode": mode})),
    )
        .into_response())
}

#[derive(Deserialize)]
pub struct ParamsQuery {
    #[serde(default)]
    ptype: Option<String>,
    #[serde(default)]
    q: Option<String>,
    #[serde(default = "default_params_limit")]
    limit: u32,
    #[serde(default)]
    offset: u32,
}

fn default_params_limit() -> u32 {
    200
}

/// GET /api/params - metadata listing with resolved values.
pub async fn params_list(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<ParamsQuery>,
) -> Result<Response, ApiError> {
    let settings = state.settings()?;
    require_token(&settings, &headers)?;

    let items = ParamStore::new(state.db.clone()).list(
        query.ptype.as_deref(),
        query.q.as_deref(),
        query.limit,
        query.offset,
    )?;
    Ok((StatusCode::OK, Json(json!({"ok": true, "items": items}))).into_response())
}

/// GET /api/params/{pkey}
pub async fn params_get(
    State(state): State<Arc<AppState>>,
    Path(pkey): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let settings = state.settings()?;
    require_token(&settings, &headers)?;

    let store = ParamStore::new(state.db.clone());
    let Some(meta) = store.get_meta(&pkey)? else {
        return Err(ApiError::new(404, "unknown parameter"));
    };
    let current = store.get_value(&pkey)?;
    let effective = store.get_effective_value(&pkey)?;

    Ok((
        StatusCode::OK,
        Json(json!({
            "ok": true,
            "meta": meta,
            "current": current,
            "effective": effective,
        })),
    )
        .into_response())
}

#[derive(Deserialize)]
pub struct ParamEditRequest {
    #[serde(default)]
    default: Option<String>,
    #[serde(default)]
    min: Option<f64>,
    #[serde(default)]
    max: Option<f64>,
    #[serde(default)]
    rw: Option<String>,
}

/// POST /api/params/{pkey} - partial metadata edit.
pub async fn params_edit(
    State(state): State<Arc<AppState>>,
    Path(pkey): Path<String>,
    headers: HeaderMap,
    Json(request): Json<ParamEditRequest>,
) -> Result<Response, ApiError> {
    let settings = state.settings()?;
    require_token(&settings, &headers)?;

    let patch = MetaPatch {
        default: request.default,
        min: request.min,
        max: request.max,
        rw: request.rw,
    };

    match ParamStore::new(state.db.clone()).update_meta(&pkey, &patch)? {
        Verdict::Accepted => Ok((StatusCode::OK, Json(json!({"ok": true}))).into_response()),
        Verdict::Rejected(kind) => Ok((
            StatusCode::OK,
            Json(json!({"ok": false, "error": kind.to_string()})),
        )
            .into_response()),
    }
}
