//! # Management API
//!
//! REST endpoints on the base domain for operating the gateway:
//! provisioning devices, toggling forwarding, dispatching commands, and
//! reading tunnel state. Mutating routes require the configured admin
//! bearer token, compared in constant time.

use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use tracing::info;

use crate::error::ServerError;
use crate::state::AppState;
use crate::store::{RegistryStore, Tier};
use crate::tunnel::TunnelError;

/// Check the `Authorization: Bearer …` header against the configured
/// admin token. An empty configured token disables the gate.
fn authorized(state: &AppState, headers: &HeaderMap) -> bool {
    let secret = &state.settings.auth.admin_token;
    if secret.is_empty() {
        return true;
    }
    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or_default();
    presented.as_bytes().ct_eq(secret.as_bytes()).into()
}

fn forbidden() -> Response {
    (StatusCode::UNAUTHORIZED, "authentication required").into_response()
}

/// `GET /api/health`
pub async fn health() -> &'static str {
    "ok"
}

/// `GET /api/tunnels` — active subdomains and count.
pub async fn tunnel_stats(State(state): State<AppState>) -> Response {
    Json(state.registry.stats()).into_response()
}

#[derive(Serialize)]
pub struct DeviceListItem {
    pub id: String,
    pub subdomain: String,
    pub tier: Tier,
    pub forwarding_enabled: bool,
    pub online: bool,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// `GET /api/devices` — every provisioned device, hashes omitted.
pub async fn list_devices(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if !authorized(&state, &headers) {
        return forbidden();
    }
    let devices: Vec<DeviceListItem> = state
        .store
        .list_devices()
        .into_iter()
        .map(|d| DeviceListItem {
            id: d.id,
            subdomain: d.subdomain,
            tier: d.tier,
            forwarding_enabled: d.forwarding_enabled,
            online: d.online,
            created_at: d.created_at,
        })
        .collect();
    Json(devices).into_response()
}

#[derive(Deserialize)]
pub struct CreateDeviceRequest {
    pub subdomain: String,
    #[serde(default)]
    pub tier: Option<Tier>,
}

#[derive(Serialize)]
pub struct CreateDeviceResponse {
    pub id: String,
    pub subdomain: String,
    /// Returned exactly once; only a hash is stored.
    pub token: String,
}

/// `POST /api/devices` — provision a device and hand back its token.
pub async fn create_device(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<CreateDeviceRequest>,
) -> Response {
    if !authorized(&state, &headers) {
        return forbidden();
    }

    let tier = request.tier.unwrap_or(Tier::Free);
    match state.store.create_device(&request.subdomain, tier) {
        Ok((device, token)) => {
            info!(subdomain = %device.subdomain, "device provisioned");
            (
                StatusCode::CREATED,
                Json(CreateDeviceResponse {
                    id: device.id,
                    subdomain: device.subdomain,
                    token,
                }),
            )
                .into_response()
        }
        Err(ServerError::SubdomainTaken(s)) => {
            (StatusCode::CONFLICT, format!("subdomain '{s}' is already taken")).into_response()
        }
        Err(ServerError::InvalidSubdomain(s)) => (
            StatusCode::UNPROCESSABLE_ENTITY,
            format!("subdomain '{s}' is invalid"),
        )
            .into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

#[derive(Deserialize)]
pub struct ForwardingRequest {
    pub enabled: bool,
}

/// `POST /api/devices/{subdomain}/forwarding` — admission gate toggle.
/// Takes effect for new tunnel connections; a connected agent keeps its
/// snapshot until it reconnects.
pub async fn set_forwarding(
    State(state): State<AppState>,
    Path(subdomain): Path<String>,
    headers: HeaderMap,
    Json(request): Json<ForwardingRequest>,
) -> Response {
    if !authorized(&state, &headers) {
        return forbidden();
    }
    match state.store.set_forwarding(&subdomain, request.enabled) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(_) => (StatusCode::NOT_FOUND, "no such device").into_response(),
    }
}

#[derive(Deserialize)]
pub struct ExecRequest {
    pub shell: String,
    #[serde(default)]
    pub dry_run: bool,
}

#[derive(Serialize)]
pub struct ExecResponse {
    pub exit_code: i32,
    pub output: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// `POST /api/devices/{subdomain}/exec` — run a shell command on the
/// device and wait for the correlated result.
pub async fn exec_command(
    State(state): State<AppState>,
    Path(subdomain): Path<String>,
    headers: HeaderMap,
    Json(request): Json<ExecRequest>,
) -> Response {
    if !authorized(&state, &headers) {
        return forbidden();
    }
    let Some(tunnel) = state.registry.get(&subdomain) else {
        return (StatusCode::NOT_FOUND, "device is not connected").into_response();
    };

    match tunnel.exec(request.shell, request.dry_run).await {
        Ok(result) => Json(ExecResponse {
            exit_code: result.exit_code,
            output: String::from_utf8_lossy(&result.output).into_owned(),
            error: result.error,
        })
        .into_response(),
        Err(TunnelError::Timeout) => {
            (StatusCode::GATEWAY_TIMEOUT, "command timed out").into_response()
        }
        Err(TunnelError::Closed | TunnelError::ClosedBeforeSend) => {
            (StatusCode::BAD_GATEWAY, "tunnel closed").into_response()
        }
    }
}

/// `POST /api/devices/{subdomain}/reboot` — fire-and-forget.
pub async fn reboot_device(
    State(state): State<AppState>,
    Path(subdomain): Path<String>,
    headers: HeaderMap,
) -> Response {
    if !authorized(&state, &headers) {
        return forbidden();
    }
    let Some(tunnel) = state.registry.get(&subdomain) else {
        return (StatusCode::NOT_FOUND, "device is not connected").into_response();
    };
    match tunnel.reboot() {
        Ok(()) => (StatusCode::ACCEPTED, "reboot dispatched").into_response(),
        Err(_) => (StatusCode::BAD_GATEWAY, "tunnel closed").into_response(),
    }
}

#[derive(Serialize)]
pub struct MetricsResponse {
    #[serde(flatten)]
    pub metrics: burrow_protocol::HostMetrics,
    pub age_secs: u64,
}

/// `GET /api/devices/{subdomain}/metrics` — last reported snapshot.
pub async fn device_metrics(
    State(state): State<AppState>,
    Path(subdomain): Path<String>,
    headers: HeaderMap,
) -> Response {
    if !authorized(&state, &headers) {
        return forbidden();
    }
    let Some(tunnel) = state.registry.get(&subdomain) else {
        return (StatusCode::NOT_FOUND, "device is not connected").into_response();
    };
    match tunnel.metrics_snapshot() {
        Some((metrics, age)) => Json(MetricsResponse {
            metrics,
            age_secs: age.as_secs(),
        })
        .into_response(),
        None => (StatusCode::NOT_FOUND, "no metrics reported yet").into_response(),
    }
}
