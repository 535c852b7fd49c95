//! Service error taxonomy.
//!
//! Every failure the HTTP surface can report carries a stable machine code
//! and a fixed status, so clients can branch on `error` without parsing
//! messages. Infrastructure errors (`anyhow`) stay confined to bootstrap.

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

pub type ServiceResult<T> = Result<T, ServiceError>;

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("invalid alias: {0}")]
    InvalidAlias(String),

    #[error("invalid short code")]
    InvalidShortCode,

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("authentication required")]
    Unauthorized,

    #[error("not allowed to modify this mapping")]
    Forbidden,

    #[error("alias '{alias}' is already taken")]
    AliasTaken {
        alias: String,
        suggestions: Vec<String>,
    },

    #[error("short code '{0}' already exists")]
    DuplicateCode(String),

    #[error("short URL not found")]
    UrlNotFound,

    #[error("short URL has expired")]
    UrlExpired,

    #[error("rate limit exceeded")]
    RateLimitExceeded { retry_after: i64 },

    #[error("cache unavailable: {0}")]
    CacheUnavailable(String),

    #[error("message bus unavailable: {0}")]
    BusUnavailable(String),

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("store query failed: {0}")]
    StoreQuery(#[from] sqlx::Error),

    #[error("counter allocator unavailable")]
    AllocatorUnavailable,

    #[error("hash id space exhausted after {0} attempts")]
    HashExhausted(u32),

    #[error("hash id generation unavailable: {0}")]
    HashUnavailable(String),

    #[error("could not generate a unique short code after {attempts} attempts")]
    GenerationFailed { attempts: u32 },
}

impl ServiceError {
    /// Stable machine-readable code surfaced in the JSON body.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidUrl(_) => "INVALID_URL",
            Self::InvalidAlias(_) => "INVALID_ALIAS",
            Self::InvalidShortCode => "INVALID_SHORT_CODE",
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::Forbidden => "FORBIDDEN",
            Self::AliasTaken { .. } => "ALIAS_TAKEN",
            Self::DuplicateCode(_) => "DUPLICATE_CODE",
            Self::UrlNotFound => "URL_NOT_FOUND",
            Self::UrlExpired => "URL_EXPIRED",
            Self::RateLimitExceeded { .. } => "RATE_LIMIT_EXCEEDED",
            Self::CacheUnavailable(_) => "CACHE_UNAVAILABLE",
            Self::BusUnavailable(_) => "BUS_UNAVAILABLE",
            Self::StoreUnavailable(_) => "STORE_UNAVAILABLE",
            Self::StoreQuery(_) => "STORE_QUERY_FAILED",
            Self::AllocatorUnavailable => "ALLOCATOR_UNAVAILABLE",
            Self::HashExhausted(_) => "HASH_EXHAUSTED",
            Self::HashUnavailable(_) => "HASH_UNAVAILABLE",
            Self::GenerationFailed { .. } => "GENERATION_FAILED",
        }
    }

    pub fn http_status(&self) -> StatusCode {
        match self {
            Self::InvalidUrl(_)
            | Self::InvalidAlias(_)
            | Self::InvalidShortCode
            | Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::AliasTaken { .. } | Self::DuplicateCode(_) => StatusCode::CONFLICT,
            Self::UrlNotFound => StatusCode::NOT_FOUND,
            Self::UrlExpired => StatusCode::GONE,
            Self::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::CacheUnavailable(_) | Self::BusUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether a caller may retry the identical request.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimitExceeded { .. }
                | Self::CacheUnavailable(_)
                | Self::BusUnavailable(_)
                | Self::StoreUnavailable(_)
                | Self::AllocatorUnavailable
                | Self::GenerationFailed { .. }
        )
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.http_status();
        let mut body = json!({
            "error": self.code(),
            "message": self.to_string(),
            "retryable": self.retryable(),
        });
        if let Self::AliasTaken { ref suggestions, .. } = self {
            body["suggestions"] = json!(suggestions);
        }

        let mut resp = (status, Json(body)).into_response();
        if let Self::RateLimitExceeded { retry_after } = self {
            if let Ok(v) = HeaderValue::from_str(&retry_after.to_string()) {
                resp.headers_mut().insert(header::RETRY_AFTER, v);
            }
        }
        resp
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(ServiceError::UrlNotFound.code(), "URL_NOT_FOUND");
        assert_eq!(ServiceError::UrlExpired.code(), "URL_EXPIRED");
        assert_eq!(
            ServiceError::AliasTaken {
                alias: "promo".into(),
                suggestions: vec![]
            }
            .code(),
            "ALIAS_TAKEN"
        );
    }

    #[test]
    fn statuses_follow_taxonomy() {
        assert_eq!(
            ServiceError::InvalidShortCode.http_status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(ServiceError::UrlExpired.http_status(), StatusCode::GONE);
        assert_eq!(
            ServiceError::RateLimitExceeded { retry_after: 10 }.http_status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert!(ServiceError::AllocatorUnavailable.retryable());
        assert!(!ServiceError::UrlNotFound.retryable());
    }
}
