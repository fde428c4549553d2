//! Router assembly and background tasks.

use std::time::Duration;

use axum::{middleware, routing::get, Router};
use tokio::task::JoinHandle;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::services::{ServeDir, ServeFile};
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

use crate::routes;
use crate::tunnel::{handler, router, TunnelManager};
use crate::AppState;

/// Build the full HTTP surface.
///
/// Every request first passes the host router: `<sub>.<domain>` traffic is
/// forwarded to its agent, anything else reaches the base-domain routes below.
pub fn build_router(state: AppState) -> Router {
    let api = Router::new()
        .route("/ping", get(routes::health::ping))
        .route("/api/stats", get(routes::stats::stats))
        .route("/api/check/{subdomain}", get(routes::stats::check_subdomain))
        .route("/events", get(routes::events::event_stream))
        .layer(CorsLayer::permissive());

    let app = Router::new()
        .route(&state.config.tunnel.path, get(handler::agent_ws_upgrade))
        .merge(api);

    let app = match &state.config.server.static_dir {
        Some(dir) => {
            info!(dir = %dir, "Serving static dashboard");
            let index = ServeFile::new(format!("{}/index.html", dir.trim_end_matches('/')));
            app.fallback_service(ServeDir::new(dir).fallback(index))
        }
        None => app.fallback(router::default_page_handler),
    };

    app.layer(
        ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            .layer(middleware::from_fn_with_state(
                state.clone(),
                router::route_by_host,
            )),
    )
    .with_state(state)
}

/// Periodically fail forwarded requests whose agent never answered.
pub fn spawn_expiry_sweep(manager: TunnelManager, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every.max(Duration::from_millis(100)));
        loop {
            interval.tick().await;
            let expired = manager.sweep_expired().await;
            if expired > 0 {
                debug!(expired, "Expiry sweep");
            }
        }
    })
}
