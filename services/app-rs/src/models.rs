use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::enums::{DuplicateStrategy, HealthStatus, IdMethod};

/// Authoritative mapping row, keyed by `short_code` among non-deleted rows.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct UrlMapping {
    pub id: i64,
    pub short_code: String,
    pub long_url: String,
    pub long_url_hash: Vec<u8>,
    pub user_id: Option<Uuid>,
    pub is_custom_alias: bool,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub access_count: i64,
    pub is_deleted: bool,
}

impl UrlMapping {
    /// Expiry comparison is wall-clock with second precision.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(expires_at) => expires_at.timestamp() <= now.timestamp(),
            None => false,
        }
    }
}

/// Per-user preferences consulted by the shortener. The caller's tier
/// rides in the access token, not here.
#[derive(Debug, Clone, FromRow)]
pub struct UserRecord {
    pub duplicate_strategy: String,
    pub default_expiry_days: Option<i32>,
}

impl UserRecord {
    pub fn duplicate_strategy(&self) -> DuplicateStrategy {
        DuplicateStrategy::from_str(&self.duplicate_strategy)
    }
}

/// Raw click event, append-only. The Kafka payload is this struct as JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClickEvent {
    pub event_id: Uuid,
    pub short_code: String,
    pub clicked_at: DateTime<Utc>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub referrer: Option<String>,
    pub country_code: Option<String>,
    pub region: Option<String>,
    pub city: Option<String>,
    pub device_type: Option<String>,
    pub browser: Option<String>,
    pub os: Option<String>,
}

impl ClickEvent {
    pub fn new(short_code: &str) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            short_code: short_code.to_string(),
            clicked_at: Utc::now(),
            ip_address: None,
            user_agent: None,
            referrer: None,
            country_code: None,
            region: None,
            city: None,
            device_type: None,
            browser: None,
            os: None,
        }
    }
}

/// Request body for POST /api/v1/url/shorten.
#[derive(Debug, Clone, Deserialize)]
pub struct ShortenRequest {
    pub url: String,
    #[serde(default)]
    pub custom_alias: Option<String>,
    /// Fractional days are accepted so short-lived mappings can be created.
    #[serde(default)]
    pub expiry_days: Option<f64>,
}

/// Response for POST /api/v1/url/shorten.
#[derive(Debug, Clone, Serialize)]
pub struct ShortenResponse {
    pub short_code: String,
    pub long_url: String,
    pub short_url: String,
    pub is_custom_alias: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    pub was_reused: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<Uuid>,
}

impl ShortenResponse {
    pub fn from_mapping(mapping: &UrlMapping, base_url: &str, was_reused: bool) -> Self {
        Self {
            short_code: mapping.short_code.clone(),
            long_url: mapping.long_url.clone(),
            short_url: format!("{}/{}", base_url, mapping.short_code),
            is_custom_alias: mapping.is_custom_alias,
            expires_at: mapping.expires_at,
            was_reused,
            user_id: mapping.user_id,
        }
    }
}

/// Request body for POST /api/v1/url/shorten/bulk.
#[derive(Debug, Deserialize)]
pub struct BulkShortenRequest {
    pub items: Vec<ShortenRequest>,
}

/// One per-item outcome in a bulk response; failures never abort the batch.
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum BulkShortenItem {
    Ok(ShortenResponse),
    Err { error: String, message: String },
}

#[derive(Debug, Serialize)]
pub struct BulkShortenResponse {
    pub results: Vec<BulkShortenItem>,
}

/// Response for GET /api/v1/url/resolve/:short_code and /:code/stats.
#[derive(Debug, Serialize)]
pub struct ResolveResponse {
    pub short_code: String,
    pub long_url: String,
    pub short_url: String,
    pub is_custom_alias: bool,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_accessed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    pub access_count: i64,
}

impl ResolveResponse {
    pub fn from_mapping(mapping: &UrlMapping, base_url: &str) -> Self {
        Self {
            short_code: mapping.short_code.clone(),
            long_url: mapping.long_url.clone(),
            short_url: format!("{}/{}", base_url, mapping.short_code),
            is_custom_alias: mapping.is_custom_alias,
            created_at: mapping.created_at,
            last_accessed_at: mapping.last_accessed_at,
            expires_at: mapping.expires_at,
            access_count: mapping.access_count,
        }
    }
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub database: HealthStatus,
    pub cache: HealthStatus,
    pub bus: HealthStatus,
}

/// Status report for GET /api/v1/idgen/status.
#[derive(Debug, Serialize)]
pub struct IdGenStatus {
    pub capability: &'static str,
    pub preferred: IdMethod,
    pub allocator_remaining: u64,
    pub allocator_range: Option<(u64, u64)>,
}

/// Daily roll-up row (read side; written by ingestion).
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct DailySummary {
    pub short_code: String,
    pub date: chrono::NaiveDate,
    pub total_clicks: i64,
    pub top_countries: serde_json::Value,
    pub top_referrers: serde_json::Value,
    pub top_devices: serde_json::Value,
    pub top_browsers: serde_json::Value,
    pub hourly: serde_json::Value,
    pub peak_hour: i32,
}
