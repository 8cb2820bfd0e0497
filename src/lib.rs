//! capctl: library crate for the CLI and integration tests.
//!
//! Signs in against the Microsoft identity platform, discovers Fabric
//! capacities across every accessible subscription and starts, stops or
//! resizes them through Azure Resource Manager.

use std::sync::Arc;

pub mod activity;
pub mod api;
pub mod auth;
pub mod client;
pub mod clock;
pub mod config;
pub mod controller;
pub mod discovery;
pub mod errors;
pub mod jobs;
pub mod models;
pub mod mutation;
pub mod store;

/// Shared state for the dashboard API.
pub struct AppState {
    pub controller: Arc<controller::Controller>,
    /// Per-process key the dashboard must send as `X-Dashboard-Key`.
    pub dashboard_key: String,
}
