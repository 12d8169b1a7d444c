//! API route handlers.
//!
//! All handlers receive `SharedState` via Axum state extraction. Callers are
//! other platform services (dashboard API, scheduler front door); they
//! authenticate with the shared internal secret and identify the acting user
//! via the `x-user-id` header.

use axum::{
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use tracing::{error, info};
use uuid::Uuid;

use crate::error::IngestError;
use crate::ingest;
use crate::sources::SourceKind;
use crate::store::{CredentialKey, Site, SiteStore};
use crate::SharedState;

pub fn v1_router(state: SharedState) -> Router {
    Router::new()
        // ── Health ───────────────────────────────────────────────────────
        .route("/status", get(status))
        // ── Ingestion ────────────────────────────────────────────────────
        .route("/ingest/run", post(ingest_run))
        // ── Credentials ──────────────────────────────────────────────────
        .route("/credentials/refresh", post(credentials_refresh))
        // ── Events ───────────────────────────────────────────────────────
        .route("/events/site-created", post(site_created))
        // ── Sites ────────────────────────────────────────────────────────
        .route("/sites", get(sites_list))
        .with_state(state)
}

// =============================================================================
// Auth helpers
// =============================================================================

/// Internal service-to-service check; all endpoints require it.
fn require_internal(state: &SharedState, headers: &HeaderMap) -> Result<(), IngestError> {
    let presented = headers
        .get("x-internal-secret")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    if presented.is_empty() || presented != state.config.internal_secret {
        return Err(IngestError::Unauthorized);
    }
    Ok(())
}

/// The user the calling service is acting for.
fn acting_user(headers: &HeaderMap) -> Result<String, IngestError> {
    headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .ok_or(IngestError::Unauthorized)
}

// =============================================================================
// Health
// =============================================================================

async fn status() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "sitepulse-ingest",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

// =============================================================================
// Ingestion
// =============================================================================

#[derive(Deserialize)]
struct IngestRunRequest {
    site_id: Uuid,
}

/// POST /v1/ingest/run — on-demand refresh of one site's reports.
///
/// Only the site's owner may trigger it. One source failing is reported next
/// to the other's success, never thrown.
async fn ingest_run(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(body): Json<IngestRunRequest>,
) -> Result<Json<serde_json::Value>, IngestError> {
    require_internal(&state, &headers)?;
    let user_id = acting_user(&headers)?;

    let site = state
        .store
        .site(body.site_id)
        .await?
        .ok_or_else(|| IngestError::NotFound("site".into()))?;

    if site.owner_id != user_id {
        return Err(IngestError::Forbidden("not the site owner".into()));
    }

    let results = state.orchestrator.run_manual(body.site_id).await?;

    Ok(Json(json!({
        "success": results.all_ok(),
        "results": results,
    })))
}

// =============================================================================
// Credentials
// =============================================================================

#[derive(Deserialize)]
struct RefreshRequest {
    owner_id: String,
    provider: SourceKind,
}

/// POST /v1/credentials/refresh — administrative refresh, bypassing the
/// expiry check but still coalesced with any in-flight refresh.
async fn credentials_refresh(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(body): Json<RefreshRequest>,
) -> Result<Json<serde_json::Value>, IngestError> {
    require_internal(&state, &headers)?;

    let key = CredentialKey {
        owner_id: body.owner_id,
        provider: body.provider,
    };
    let bearer = state.broker.refresh_now(&key).await?;

    Ok(Json(json!({
        "success": true,
        "message": format!("token refreshed, valid until {}", bearer.expires_at_ms),
    })))
}

// =============================================================================
// Events
// =============================================================================

/// POST /v1/events/site-created — consumes the tenant-creation event.
///
/// The site record is persisted and acknowledged immediately; the historical
/// backfill runs on a detached task so a slow or failing backfill can never
/// block onboarding.
async fn site_created(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(site): Json<Site>,
) -> Result<impl IntoResponse, IngestError> {
    require_internal(&state, &headers)?;

    state.store.upsert_site(&site).await?;
    info!(site = %site.id, owner = %site.owner_id, "Site registered");

    if site.configured_sources().is_empty() {
        return Ok((
            StatusCode::ACCEPTED,
            Json(json!({ "accepted": true, "site_id": site.id, "backfill": false })),
        ));
    }

    let orchestrator = state.orchestrator.clone();
    let months = state.config.backfill_months;
    let site_id = site.id;
    tokio::spawn(async move {
        let summary = ingest::run_backfill(&orchestrator, &site, months).await;
        if summary.failed > 0 {
            error!(
                site = %site_id,
                failed = summary.failed,
                "Backfill completed with failures"
            );
        }
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "accepted": true, "site_id": site_id, "backfill": true })),
    ))
}

// =============================================================================
// Sites
// =============================================================================

#[derive(Deserialize)]
struct SitesQuery {
    owner_id: String,
}

/// GET /v1/sites?owner_id= — site metadata for an owner, no token material.
async fn sites_list(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(q): Query<SitesQuery>,
) -> Result<Json<serde_json::Value>, IngestError> {
    require_internal(&state, &headers)?;

    let sites = state.store.sites_for_owner(&q.owner_id).await?;
    Ok(Json(json!({ "sites": sites })))
}
