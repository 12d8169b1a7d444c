//! API router for sitepulse-ingest.
//!
//! Mounts all endpoint groups under /v1/:
//! - /v1/ingest       — manual single-site runs
//! - /v1/credentials  — administrative token refresh
//! - /v1/events       — tenant-creation trigger (spawns backfill)
//! - /v1/sites        — site metadata for internal callers
//! - /v1/status       — health check

pub mod routes;

use crate::SharedState;
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub fn router(state: SharedState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .nest("/v1", routes::v1_router(state))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}
