//! Unauthenticated liveness probe.

/// `GET /ping` - returns `pong`. Suitable for load-balancer health checks.
pub async fn ping() -> &'static str {
    "pong"
}
