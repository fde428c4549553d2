//! Dashboard JSON endpoints.

use axum::extract::{Path, State};
use axum::Json;
use serde::Serialize;

use crate::tunnel::TunnelStats;
use crate::AppState;

/// `GET /api/stats` - registry counters, uptime, and the live tunnel list.
pub async fn stats(State(state): State<AppState>) -> Json<TunnelStats> {
    Json(state.manager.stats().await)
}

#[derive(Debug, Serialize)]
pub struct Availability {
    pub subdomain: String,
    pub available: bool,
}

/// `GET /api/check/{subdomain}` - whether a subdomain is free to register.
pub async fn check_subdomain(
    State(state): State<AppState>,
    Path(subdomain): Path<String>,
) -> Json<Availability> {
    let available = !state.manager.is_taken(&subdomain).await;
    Json(Availability {
        subdomain,
        available,
    })
}
