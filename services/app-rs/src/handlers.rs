//! HTTP handlers for the URL shortener edge service.
//!
//! Handlers stay thin: extract, delegate to the service layer, serialize.
//! The redirect path is the only latency-sensitive route; everything it
//! needs beyond the cache lookup happens after the response is chosen.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{ConnectInfo, Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Extension, Json,
};
use chrono::{NaiveDate, Utc};
use serde::Deserialize;

use crate::auth::Principal;
use crate::cache::summary_key;
use crate::enums::HealthStatus;
use crate::error::ServiceError;
use crate::models::{
    BulkShortenRequest, BulkShortenResponse, DailySummary, HealthResponse, ResolveResponse,
    ShortenRequest,
};
use crate::redirect::ClickContext;
use crate::state::AppState;

// ── Health / readiness ────────────────────────────────────────────────────────

pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let db_status = match state.store.ping().await {
        Ok(_) => HealthStatus::Healthy,
        Err(_) => HealthStatus::Unhealthy,
    };
    let cache_status = match state.redis.ping().await {
        Ok(_) => HealthStatus::Healthy,
        Err(_) => HealthStatus::Unhealthy,
    };
    // The bus is probed at boot; in direct mode it is known to be down.
    let bus_status = if state.pipeline.mode() == "bus" {
        HealthStatus::Healthy
    } else {
        HealthStatus::Unhealthy
    };

    let overall = if db_status == HealthStatus::Healthy && cache_status == HealthStatus::Healthy {
        HealthStatus::Healthy
    } else {
        HealthStatus::Unhealthy
    };

    Json(HealthResponse {
        status: overall,
        database: db_status,
        cache: cache_status,
        bus: bus_status,
    })
}

pub async fn ready(State(state): State<Arc<AppState>>) -> Response {
    let db_ok = state.store.ping().await.is_ok();
    let cache_ok = state.redis.ping().await.is_ok();
    if db_ok && cache_ok {
        StatusCode::OK.into_response()
    } else {
        StatusCode::SERVICE_UNAVAILABLE.into_response()
    }
}

pub async fn live() -> StatusCode {
    StatusCode::OK
}

pub async fn metrics(State(state): State<Arc<AppState>>) -> String {
    crate::metrics::gather(&state.registry)
}

// ── POST /api/v1/url/shorten ──────────────────────────────────────────────────

pub async fn shorten(
    State(state): State<Arc<AppState>>,
    principal: Option<Extension<Principal>>,
    Json(payload): Json<ShortenRequest>,
) -> Response {
    let user_id = principal.map(|Extension(p)| p.user_id);
    match state.shortener.create_short_url(&payload, user_id).await {
        Ok(resp) => {
            state
                .metrics
                .http_requests_total
                .with_label_values(&["shorten", "POST", "200"])
                .inc();
            state.metrics.db_writes_total.inc();
            Json(resp).into_response()
        }
        Err(e) => {
            state
                .metrics
                .http_requests_total
                .with_label_values(&["shorten", "POST", e.http_status().as_str()])
                .inc();
            e.into_response()
        }
    }
}

// ── POST /api/v1/url/shorten/bulk ─────────────────────────────────────────────

pub async fn shorten_bulk(
    State(state): State<Arc<AppState>>,
    principal: Option<Extension<Principal>>,
    Json(payload): Json<BulkShortenRequest>,
) -> Response {
    if payload.items.is_empty() {
        return ServiceError::Validation("bulk request has no items".to_string()).into_response();
    }
    let user_id = principal.map(|Extension(p)| p.user_id);
    let results = state
        .shortener
        .create_bulk(payload.items, user_id)
        .await;
    state
        .metrics
        .http_requests_total
        .with_label_values(&["shorten_bulk", "POST", "200"])
        .inc();
    Json(BulkShortenResponse { results }).into_response()
}

// ── GET /:short_code (redirect) ───────────────────────────────────────────────

pub async fn redirect(
    State(state): State<Arc<AppState>>,
    Path(short_code): Path<String>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    let ctx = click_context(&headers, addr);
    match state.redirect.handle_redirect(&short_code, ctx).await {
        Ok(location) => {
            state
                .metrics
                .http_requests_total
                .with_label_values(&["redirect", "GET", "301"])
                .inc();
            (
                StatusCode::MOVED_PERMANENTLY,
                [(header::LOCATION, location)],
            )
                .into_response()
        }
        Err(e) => {
            state
                .metrics
                .http_requests_total
                .with_label_values(&["redirect", "GET", e.http_status().as_str()])
                .inc();
            e.into_response()
        }
    }
}

// ── GET /api/v1/url/resolve/:short_code ───────────────────────────────────────

pub async fn resolve(
    State(state): State<Arc<AppState>>,
    Path(short_code): Path<String>,
) -> Response {
    match lookup_live(&state, &short_code).await {
        Ok(resp) => {
            state
                .metrics
                .http_requests_total
                .with_label_values(&["resolve", "GET", "200"])
                .inc();
            Json(resp).into_response()
        }
        Err(e) => e.into_response(),
    }
}

// ── GET /api/v1/url/:short_code/stats ─────────────────────────────────────────

/// Unlike `resolve`, stats bypass the cache so `access_count` reflects the
/// authoritative row, not a possibly stale cached copy.
pub async fn url_stats(
    State(state): State<Arc<AppState>>,
    Path(short_code): Path<String>,
) -> Response {
    if !crate::validate::is_valid_short_code(&short_code) {
        return ServiceError::InvalidShortCode.into_response();
    }
    let result = async {
        let mapping = state
            .store
            .fetch_live_mapping(&short_code)
            .await?
            .ok_or(ServiceError::UrlNotFound)?;
        if mapping.is_expired_at(Utc::now()) {
            return Err(ServiceError::UrlExpired);
        }
        Ok(ResolveResponse::from_mapping(&mapping, &state.config.base_url))
    }
    .await;
    match result {
        Ok(resp) => Json(resp).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn lookup_live(
    state: &AppState,
    short_code: &str,
) -> Result<ResolveResponse, ServiceError> {
    if !crate::validate::is_valid_short_code(short_code) {
        return Err(ServiceError::InvalidShortCode);
    }
    let looked = state.cache.lookup(short_code).await?;
    match crate::redirect::decide(looked.entry.as_ref(), Utc::now()) {
        crate::redirect::RedirectOutcome::NotFound => Err(ServiceError::UrlNotFound),
        crate::redirect::RedirectOutcome::Expired { needs_tombstone } => {
            if needs_tombstone {
                state.cache.mark_expired_default(short_code).await;
            }
            Err(ServiceError::UrlExpired)
        }
        crate::redirect::RedirectOutcome::Redirect { .. } => {
            let mapping = looked
                .entry
                .as_ref()
                .and_then(|e| e.mapping())
                .cloned()
                .ok_or(ServiceError::UrlNotFound)?;
            Ok(ResolveResponse::from_mapping(&mapping, &state.config.base_url))
        }
    }
}

// ── DELETE /api/v1/url/:short_code ────────────────────────────────────────────

pub async fn delete_url(
    State(state): State<Arc<AppState>>,
    principal: Option<Extension<Principal>>,
    Path(short_code): Path<String>,
) -> Response {
    let Some(Extension(principal)) = principal else {
        return ServiceError::Unauthorized.into_response();
    };

    let result = async {
        let mapping = state
            .store
            .fetch_live_mapping(&short_code)
            .await?
            .ok_or(ServiceError::UrlNotFound)?;
        if mapping.user_id != Some(principal.user_id) {
            return Err(ServiceError::Forbidden);
        }
        state.store.soft_delete(&short_code).await?;
        state.cache.mark_deleted(&short_code).await;
        Ok::<_, ServiceError>(())
    }
    .await;

    match result {
        Ok(()) => {
            state
                .metrics
                .http_requests_total
                .with_label_values(&["delete", "DELETE", "200"])
                .inc();
            Json(serde_json::json!({ "deleted": true, "shortCode": short_code })).into_response()
        }
        Err(e) => e.into_response(),
    }
}

// ── GET /api/v1/analytics/:short_code/summary ─────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct SummaryQuery {
    pub date: Option<NaiveDate>,
}

pub async fn daily_summary(
    State(state): State<Arc<AppState>>,
    Path(short_code): Path<String>,
    Query(query): Query<SummaryQuery>,
) -> Response {
    if !crate::validate::is_valid_short_code(&short_code) {
        return ServiceError::InvalidShortCode.into_response();
    }
    let date = query.date.unwrap_or_else(|| Utc::now().date_naive());
    let key = summary_key(&short_code, date);

    if let Some(summary) = state.redis.get_json::<DailySummary>(&key).await {
        return Json(summary).into_response();
    }

    match state.store.fetch_daily_summary(&short_code, date).await {
        Ok(Some(summary)) => {
            if let Err(e) = state
                .redis
                .set_json(&key, &summary, state.config.cache_summary_ttl_seconds)
                .await
            {
                tracing::warn!(%short_code, error = %e, "summary cache write failed");
            }
            Json(summary).into_response()
        }
        Ok(None) => ServiceError::UrlNotFound.into_response(),
        Err(e) => e.into_response(),
    }
}

// ── GET /api/v1/idgen/status ──────────────────────────────────────────────────

pub async fn idgen_status(State(state): State<Arc<AppState>>) -> Response {
    Json(state.idgen.status().await).into_response()
}

// ── GET /api/v1/system/stats ──────────────────────────────────────────────────

pub async fn system_stats(State(state): State<Arc<AppState>>) -> Response {
    Json(serde_json::json!({
        "redirect": state.redirect.stats_snapshot(),
        "fanout": state.fanout.stats(),
        "cache": { "memory_entries": state.cache.memory_entries() },
        "analytics": {
            "mode": state.pipeline.mode(),
            "pending": state.pipeline.pending().await,
        },
    }))
    .into_response()
}

// ── Helpers ───────────────────────────────────────────────────────────────────

/// Click attributes from the request. Geo headers come pre-resolved from an
/// upstream edge; nothing here does its own IP lookup.
fn click_context(headers: &HeaderMap, addr: SocketAddr) -> ClickContext {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
    };

    let ip_address = header("x-forwarded-for")
        .and_then(|v| v.split(',').next().map(|s| s.trim().to_string()))
        .filter(|s| !s.is_empty())
        .or_else(|| Some(addr.ip().to_string()));

    ClickContext {
        ip_address,
        user_agent: header("user-agent"),
        referrer: header("referer"),
        country_code: header("x-geo-country"),
        region: header("x-geo-region"),
        city: header("x-geo-city"),
    }
}
