//! HTTP API for the agent.
//!
//! Thin axum layer over [`Agent`]: token auth, JSON decode, and the
//! error-code envelope. Reload-style endpoints acknowledge with 202 and
//! run the actual work in a detached task.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::agent::Agent;
use crate::storage::{SlotCounts, StoreError};

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub agent: Arc<Agent>,
}

pub fn build_router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/adduser", post(add_user))
        .route("/deleteuser", post(delete_user))
        .route("/reload", post(reload))
        .route("/restart", post(restart))
        .route("/reset", post(reset))
        .route("/stats", get(stats))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));

    Router::new()
        .merge(protected)
        .route("/healthz", get(healthz))
        .method_not_allowed_fallback(method_not_allowed)
        .with_state(state)
}

/// Reject requests without the configured `X-Auth-Token`.
async fn require_auth(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let token = &state.agent.cfg().auth_token;
    if !token.is_empty() {
        let presented = req
            .headers()
            .get("X-Auth-Token")
            .and_then(|v| v.to_str().ok());
        if presented != Some(token.as_str()) {
            return error_response(StatusCode::UNAUTHORIZED, "unauthorized");
        }
    }
    next.run(req).await
}

async fn method_not_allowed() -> Response {
    error_response(StatusCode::METHOD_NOT_ALLOWED, "method_not_allowed")
}

async fn healthz() -> Response {
    (StatusCode::OK, Json(serde_json::json!({"status": "ok"}))).into_response()
}

#[derive(Debug, Default, Deserialize)]
struct AddUserRequest {
    #[serde(default)]
    user_id: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AddUserResponse {
    status: &'static str,
    slot_id: i64,
    shard_id: i64,
    listen_port: u16,
    /// Composite credential `<server_psk>:<slot_password>`.
    password: String,
    method: String,
    ip: String,
    free_slots: i64,
}

async fn add_user(State(state): State<AppState>, body: Bytes) -> Response {
    let req: AddUserRequest = match decode_body(&body) {
        Ok(req) => req,
        Err(resp) => return resp,
    };

    let agent = &state.agent;
    let _op = agent.op_read().await;

    let user_id = (!req.user_id.is_empty()).then_some(req.user_id.as_str());
    let slot = match agent.store().allocate(user_id).await {
        Ok(slot) => slot,
        Err(StoreError::NoFreePorts) => {
            return error_response(StatusCode::CONFLICT, "no_free_ports");
        }
        Err(e) => {
            error!(error = %e, "slot allocation failed");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal_error");
        }
    };

    let Some(shard) = agent.shard(slot.shard_id) else {
        error!(shard = slot.shard_id, "allocated slot belongs to unknown shard");
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, "unknown_shard");
    };

    let totals = match agent.store().slot_stats().await {
        Ok((_, totals)) => totals,
        Err(e) => {
            error!(error = %e, "slot stats failed");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "stats_error");
        }
    };

    let response = AddUserResponse {
        status: "ok",
        slot_id: slot.slot_id,
        shard_id: shard.id,
        listen_port: shard.port,
        password: format!(
            "{}:{}",
            agent.store().server_password(shard.id),
            slot.password
        ),
        method: agent.cfg().method.clone(),
        ip: agent.cfg().public_ip.clone(),
        free_slots: totals.free,
    };
    (StatusCode::OK, Json(response)).into_response()
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeleteUserRequest {
    #[serde(default)]
    slot_id: i64,
    #[serde(default)]
    slot_ids: Vec<i64>,
}

async fn delete_user(State(state): State<AppState>, body: Bytes) -> Response {
    let req: DeleteUserRequest = match decode_body_required(&body) {
        Ok(req) => req,
        Err(resp) => return resp,
    };

    let mut targets = req.slot_ids;
    if targets.is_empty() && req.slot_id != 0 {
        targets.push(req.slot_id);
    }
    if targets.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "slot_required");
    }

    let agent = &state.agent;
    let _op = agent.op_read().await;

    for slot_id in targets {
        if let Err(e) = agent.store().reserve(slot_id).await {
            return match e {
                StoreError::SlotNotFound => {
                    error_response(StatusCode::NOT_FOUND, "slot_not_found")
                }
                StoreError::SlotReserved => {
                    error_response(StatusCode::BAD_REQUEST, "already_reserved")
                }
                StoreError::SlotFree | StoreError::SlotNotInUse => {
                    error_response(StatusCode::BAD_REQUEST, "slot_not_in_use")
                }
                e => {
                    error!(slot = slot_id, error = %e, "slot reservation failed");
                    error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal_error")
                }
            };
        }
    }
    (StatusCode::OK, Json(serde_json::json!({"status": "ok"}))).into_response()
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ShardTargetRequest {
    #[serde(default)]
    shard_id: i64,
}

impl ShardTargetRequest {
    fn targets(&self) -> Vec<i64> {
        if self.shard_id > 0 {
            vec![self.shard_id]
        } else {
            Vec::new()
        }
    }
}

async fn reload(State(state): State<AppState>, body: Bytes) -> Response {
    let req: ShardTargetRequest = match decode_body(&body) {
        Ok(req) => req,
        Err(resp) => return resp,
    };
    let target = req.targets();

    let agent = Arc::clone(&state.agent);
    tokio::spawn(async move {
        match agent.reload(true, &target).await {
            Ok(processed) => info!(?processed, "async reload finished"),
            Err(e) => error!(error = %e, "async reload failed"),
        }
    });

    accepted("reload started")
}

async fn restart(State(state): State<AppState>, body: Bytes) -> Response {
    let req: ShardTargetRequest = match decode_body(&body) {
        Ok(req) => req,
        Err(resp) => return resp,
    };
    let target = req.targets();

    let agent = Arc::clone(&state.agent);
    tokio::spawn(async move {
        match agent.reload_and_restart(true, &target).await {
            Ok(processed) => info!(?processed, "async restart finished"),
            Err(e) => error!(error = %e, "async restart failed"),
        }
    });

    accepted("restart started")
}

async fn reset(State(state): State<AppState>) -> Response {
    let agent = Arc::clone(&state.agent);
    tokio::spawn(async move {
        match agent.hard_reset().await {
            Ok(()) => info!("async hard reset finished"),
            Err(e) => error!(error = %e, "async hard reset failed"),
        }
    });

    (
        StatusCode::ACCEPTED,
        Json(serde_json::json!({"status": "accepted"})),
    )
        .into_response()
}

#[derive(Serialize)]
struct ShardStats {
    id: i64,
    port: u16,
    free: i64,
    used: i64,
    reserved: i64,
}

#[derive(Serialize)]
struct StatsResponse {
    shards: Vec<ShardStats>,
    totals: SlotCounts,
}

async fn stats(State(state): State<AppState>) -> Response {
    let agent = &state.agent;
    let _op = agent.op_read().await;

    let (by_shard, totals) = match agent.store().slot_stats().await {
        Ok(stats) => stats,
        Err(e) => {
            error!(error = %e, "slot stats failed");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "stats_error");
        }
    };

    let shards = agent
        .shards()
        .iter()
        .map(|sh| {
            let counts = by_shard.get(&sh.id).copied().unwrap_or_default();
            ShardStats {
                id: sh.id,
                port: sh.port,
                free: counts.free,
                used: counts.used,
                reserved: counts.reserved,
            }
        })
        .collect();

    (StatusCode::OK, Json(StatsResponse { shards, totals })).into_response()
}

fn accepted(message: &str) -> Response {
    (
        StatusCode::ACCEPTED,
        Json(serde_json::json!({"status": "accepted", "message": message})),
    )
        .into_response()
}

fn error_response(status: StatusCode, code: &str) -> Response {
    (
        status,
        Json(serde_json::json!({"status": "error", "error": code})),
    )
        .into_response()
}

/// Decode a request body, treating an empty body as all-defaults.
fn decode_body<T: DeserializeOwned + Default>(body: &Bytes) -> Result<T, Response> {
    if body.is_empty() {
        return Ok(T::default());
    }
    serde_json::from_slice(body)
        .map_err(|_| error_response(StatusCode::BAD_REQUEST, "invalid_json"))
}

/// Decode a request body that must be present.
fn decode_body_required<T: DeserializeOwned>(body: &Bytes) -> Result<T, Response> {
    serde_json::from_slice(body)
        .map_err(|_| error_response(StatusCode::BAD_REQUEST, "invalid_json"))
}
