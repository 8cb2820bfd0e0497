use std::sync::Arc;

use axum::{extract::State, http::StatusCode, Json};
use serde::{Deserialize, Serialize};

use crate::activity::Entry;
use crate::auth::SessionContext;
use crate::controller::Snapshot;
use crate::errors::ControllerError;
use crate::models::Sku;
use crate::mutation::{Approved, Confirmation, Declined};
use crate::AppState;

// ── Request / Response DTOs ──────────────────────────────────

#[derive(Serialize)]
pub struct SessionResponse {
    pub signed_in: bool,
    pub context: Option<SessionContext>,
}

#[derive(Deserialize)]
pub struct SelectRequest {
    pub id: Option<String>,
}

#[derive(Deserialize)]
pub struct SkuRequest {
    pub sku: String,
    /// Must be true to resize a running capacity.
    #[serde(default)]
    pub confirm: bool,
}

#[derive(Deserialize)]
pub struct DebugRequest {
    pub enabled: bool,
}

type ApiResult<T> = Result<Json<T>, ControllerError>;

fn selected_id(state: &AppState) -> Result<String, ControllerError> {
    state
        .controller
        .selected()
        .map(|c| c.id)
        .ok_or(ControllerError::NotSelected)
}

// ── Handlers ─────────────────────────────────────────────────

/// GET /api/v1/session
pub async fn get_session(State(state): State<Arc<AppState>>) -> Json<SessionResponse> {
    let signed_in = state.controller.tokens().peek().await.is_some();
    Json(SessionResponse {
        signed_in,
        context: state.controller.session().await,
    })
}

/// POST /api/v1/login: interactive sign-in if no valid session exists
pub async fn login(State(state): State<Arc<AppState>>) -> ApiResult<SessionResponse> {
    let context = state.controller.authenticate().await?;
    Ok(Json(SessionResponse {
        signed_in: true,
        context,
    }))
}

/// POST /api/v1/logout
pub async fn logout(State(state): State<Arc<AppState>>) -> Result<StatusCode, ControllerError> {
    state.controller.logout().await?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /api/v1/capacities: current snapshot, no network traffic
pub async fn get_capacities(State(state): State<Arc<AppState>>) -> Json<Snapshot> {
    Json(state.controller.snapshot())
}

/// POST /api/v1/capacities/load: full discovery
pub async fn load_capacities(State(state): State<Arc<AppState>>) -> ApiResult<Snapshot> {
    Ok(Json(state.controller.load().await?))
}

/// POST /api/v1/capacities/refresh: known subscriptions only
pub async fn refresh_capacities(State(state): State<Arc<AppState>>) -> ApiResult<Snapshot> {
    Ok(Json(state.controller.refresh().await?))
}

/// POST /api/v1/capacities/select
pub async fn select_capacity(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<SelectRequest>,
) -> ApiResult<Snapshot> {
    Ok(Json(state.controller.select(payload.id.as_deref())?))
}

/// POST /api/v1/capacities/start
pub async fn start_selected(
    State(state): State<Arc<AppState>>,
) -> Result<(StatusCode, Json<Snapshot>), ControllerError> {
    let id = selected_id(&state)?;
    state.controller.start(&id).await?;
    Ok((StatusCode::ACCEPTED, Json(state.controller.snapshot())))
}

/// POST /api/v1/capacities/stop
pub async fn stop_selected(
    State(state): State<Arc<AppState>>,
) -> Result<(StatusCode, Json<Snapshot>), ControllerError> {
    let id = selected_id(&state)?;
    state.controller.stop(&id).await?;
    Ok((StatusCode::ACCEPTED, Json(state.controller.snapshot())))
}

/// POST /api/v1/capacities/sku
pub async fn change_selected_sku(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<SkuRequest>,
) -> Result<(StatusCode, Json<Snapshot>), ControllerError> {
    let id = selected_id(&state)?;
    let sku: Sku = payload.sku.parse().unwrap_or(Sku::Other(payload.sku.clone()));
    let confirm: &dyn Confirmation = if payload.confirm { &Approved } else { &Declined };
    state.controller.change_sku(&id, sku, confirm).await?;
    Ok((StatusCode::ACCEPTED, Json(state.controller.snapshot())))
}

/// GET /api/v1/logs
pub async fn get_logs(State(state): State<Arc<AppState>>) -> Json<Vec<Entry>> {
    Json(state.controller.log().entries())
}

/// PUT /api/v1/debug
pub async fn set_debug(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<DebugRequest>,
) -> Result<StatusCode, ControllerError> {
    state.controller.set_debug(payload.enabled).await?;
    Ok(StatusCode::NO_CONTENT)
}
