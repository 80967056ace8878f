//! Unauthenticated health-check endpoint.

/// `GET /health` — liveness probe, served on both planes.
pub async fn health() -> &'static str {
    "OK"
}
