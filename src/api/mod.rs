//! Local dashboard API.
//!
//! Loopback-only HTTP surface for a UI: it reads controller snapshots and
//! posts user intents (select, start, stop, resize, refresh, logout).
//! Every route requires the per-process dashboard key printed at startup.

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::Response,
    routing::{get, post, put},
    Router,
};
use tower_http::trace::TraceLayer;

use crate::AppState;

pub mod handlers;

pub const DASHBOARD_KEY_HEADER: &str = "x-dashboard-key";

/// Build the dashboard router. The caller mounts it under `/api/v1`.
pub fn api_router(state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .route("/session", get(handlers::get_session))
        .route("/login", post(handlers::login))
        .route("/logout", post(handlers::logout))
        .route("/capacities", get(handlers::get_capacities))
        .route("/capacities/load", post(handlers::load_capacities))
        .route("/capacities/refresh", post(handlers::refresh_capacities))
        .route("/capacities/select", post(handlers::select_capacity))
        .route("/capacities/start", post(handlers::start_selected))
        .route("/capacities/stop", post(handlers::stop_selected))
        .route("/capacities/sku", post(handlers::change_selected_sku))
        .route("/logs", get(handlers::get_logs))
        .route("/debug", put(handlers::set_debug))
        .layer(middleware::from_fn_with_state(state, dashboard_auth))
        .layer(TraceLayer::new_for_http())
        .fallback(fallback_404)
}

async fn fallback_404() -> StatusCode {
    StatusCode::NOT_FOUND
}

/// Middleware: compares `X-Dashboard-Key` with the key generated at startup.
async fn dashboard_auth(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let provided = req
        .headers()
        .get(DASHBOARD_KEY_HEADER)
        .and_then(|v| v.to_str().ok());

    match provided {
        Some(k) if k == state.dashboard_key => Ok(next.run(req).await),
        Some(_) => {
            tracing::warn!("dashboard API: invalid key");
            Err(StatusCode::UNAUTHORIZED)
        }
        None => {
            tracing::warn!("dashboard API: missing X-Dashboard-Key header");
            Err(StatusCode::UNAUTHORIZED)
        }
    }
}
