//! Tiered token-bucket admission control backed by the distributed cache.
//!
//! Bucket state lives in Redis hash fields keyed by principal so every
//! replica shares one budget. The refill arithmetic is a pure function;
//! the adapter around it fails open when Redis is unreachable.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{ConnectInfo, Request, State},
    http::HeaderValue,
    middleware::Next,
    response::{IntoResponse, Response},
};
use chrono::Utc;

use crate::auth;
use crate::cache::{bucket_key, RedisCache};
use crate::enums::Tier;
use crate::error::ServiceError;
use crate::state::AppState;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketState {
    pub tokens: i64,
    pub last_refill: i64,
    pub reset_time: i64,
}

#[derive(Debug, Clone, Copy)]
pub struct TierLimits {
    pub window_seconds: i64,
    pub max_requests: i64,
}

#[derive(Debug, Clone, Copy)]
pub struct Decision {
    pub allowed: bool,
    pub limit: i64,
    pub remaining: i64,
    pub reset_at: i64,
    pub retry_after: Option<i64>,
}

/// One admission step at wall-clock second `now`.
pub fn consume_at(
    state: Option<BucketState>,
    limits: &TierLimits,
    now: i64,
) -> (BucketState, Decision) {
    let mut bucket = match state {
        Some(existing) if now < existing.reset_time => existing,
        // Absent or past the window boundary: start a fresh full bucket.
        _ => BucketState {
            tokens: limits.max_requests,
            last_refill: now,
            reset_time: now + limits.window_seconds,
        },
    };

    let elapsed = (now - bucket.last_refill).max(0);
    if elapsed > 0 {
        let refill = elapsed * limits.max_requests / limits.window_seconds;
        if refill > 0 {
            bucket.tokens = (bucket.tokens + refill).min(limits.max_requests);
            bucket.last_refill = now;
        }
    }

    let decision = if bucket.tokens > 0 {
        bucket.tokens -= 1;
        Decision {
            allowed: true,
            limit: limits.max_requests,
            remaining: bucket.tokens,
            reset_at: bucket.reset_time,
            retry_after: None,
        }
    } else {
        Decision {
            allowed: false,
            limit: limits.max_requests,
            remaining: 0,
            reset_at: bucket.reset_time,
            retry_after: Some((bucket.reset_time - now).max(1)),
        }
    };
    (bucket, decision)
}

pub struct RateLimiter {
    redis: RedisCache,
    window_seconds: i64,
    max_anonymous: i64,
    max_standard: i64,
    max_premium: i64,
    max_enterprise: i64,
    max_strict: i64,
}

impl RateLimiter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        redis: RedisCache,
        window_seconds: i64,
        max_anonymous: i64,
        max_standard: i64,
        max_premium: i64,
        max_enterprise: i64,
        max_strict: i64,
    ) -> Self {
        Self {
            redis,
            window_seconds,
            max_anonymous,
            max_standard,
            max_premium,
            max_enterprise,
            max_strict,
        }
    }

    pub fn limits_for(&self, tier: Tier) -> TierLimits {
        let max_requests = match tier {
            Tier::Anonymous => self.max_anonymous,
            Tier::Standard => self.max_standard,
            Tier::Premium => self.max_premium,
            Tier::Enterprise => self.max_enterprise,
            Tier::Strict => self.max_strict,
        };
        TierLimits {
            window_seconds: self.window_seconds,
            max_requests,
        }
    }

    /// Admit or deny one request for `principal`. Redis trouble fails open.
    pub async fn consume(&self, principal: &str, tier: Tier) -> Decision {
        let limits = self.limits_for(tier);
        let now = Utc::now().timestamp();
        let key = bucket_key(principal);

        let loaded = match self.redis.read_bucket(&key).await {
            Ok(map) => parse_bucket(&map),
            Err(e) => {
                tracing::warn!(principal, error = %e, "limiter state read failed, failing open");
                return fail_open(&limits, now);
            }
        };

        let (bucket, decision) = consume_at(loaded, &limits, now);

        let fields = [
            ("tokens", bucket.tokens.to_string()),
            ("last_refill", bucket.last_refill.to_string()),
            ("reset_time", bucket.reset_time.to_string()),
        ];
        if let Err(e) = self
            .redis
            .write_bucket(&key, &fields, limits.window_seconds)
            .await
        {
            tracing::warn!(principal, error = %e, "limiter state write failed, failing open");
            return fail_open(&limits, now);
        }

        decision
    }
}

fn fail_open(limits: &TierLimits, now: i64) -> Decision {
    Decision {
        allowed: true,
        limit: limits.max_requests,
        remaining: limits.max_requests.saturating_sub(1),
        reset_at: now + limits.window_seconds,
        retry_after: None,
    }
}

fn parse_bucket(map: &std::collections::HashMap<String, String>) -> Option<BucketState> {
    if map.is_empty() {
        return None;
    }
    Some(BucketState {
        tokens: map.get("tokens")?.parse().ok()?,
        last_refill: map.get("last_refill")?.parse().ok()?,
        reset_time: map.get("reset_time")?.parse().ok()?,
    })
}

/// Paths that monitors hit; these bypass admission entirely.
fn is_exempt(path: &str) -> bool {
    matches!(path, "/health" | "/ready" | "/live" | "/metrics")
}

/// Axum middleware: resolves the principal, consumes one token, stamps the
/// rate headers, and rejects with 429 + Retry-After when the bucket is dry.
pub async fn rate_limit_middleware(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Response {
    if is_exempt(req.uri().path()) {
        return next.run(req).await;
    }

    let principal = auth::principal_from_headers(req.headers(), &state.config.access_secret);
    let (key, tier) = match principal {
        Some(p) => (format!("user:{}", p.user_id), p.tier),
        None => (client_ip(&req), Tier::Anonymous),
    };

    if let Some(p) = principal {
        req.extensions_mut().insert(p);
    }

    let decision = state.limiter.consume(&key, tier).await;

    if !decision.allowed {
        state
            .metrics
            .rate_limited_total
            .with_label_values(&[tier.as_str()])
            .inc();
        let mut resp = ServiceError::RateLimitExceeded {
            retry_after: decision.retry_after.unwrap_or(1),
        }
        .into_response();
        stamp_headers(&mut resp, &decision);
        return resp;
    }

    let mut resp = next.run(req).await;
    stamp_headers(&mut resp, &decision);
    resp
}

fn stamp_headers(resp: &mut Response, decision: &Decision) {
    let headers = resp.headers_mut();
    if let Ok(v) = HeaderValue::from_str(&decision.limit.to_string()) {
        headers.insert("x-ratelimit-limit", v);
    }
    if let Ok(v) = HeaderValue::from_str(&decision.remaining.to_string()) {
        headers.insert("x-ratelimit-remaining", v);
    }
    if let Ok(v) = HeaderValue::from_str(&decision.reset_at.to_string()) {
        headers.insert("x-ratelimit-reset", v);
    }
}

fn client_ip(req: &Request) -> String {
    if let Some(forwarded) = req
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
    {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return format!("ip:{first}");
            }
        }
    }
    match req.extensions().get::<ConnectInfo<SocketAddr>>() {
        Some(ConnectInfo(addr)) => format!("ip:{}", addr.ip()),
        None => "ip:unknown".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIMITS: TierLimits = TierLimits {
        window_seconds: 60,
        max_requests: 10,
    };

    #[test]
    fn fresh_bucket_starts_full_and_allows() {
        let (bucket, decision) = consume_at(None, &LIMITS, 1_000);
        assert!(decision.allowed);
        assert_eq!(bucket.tokens, 9);
        assert_eq!(decision.remaining, 9);
        assert_eq!(bucket.reset_time, 1_060);
    }

    #[test]
    fn window_limit_is_enforced() {
        let mut state = None;
        let mut allowed = 0;
        for _ in 0..15 {
            let (bucket, decision) = consume_at(state, &LIMITS, 1_000);
            state = Some(bucket);
            if decision.allowed {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 10);
    }

    #[test]
    fn denial_carries_retry_after() {
        let state = BucketState {
            tokens: 0,
            last_refill: 1_000,
            reset_time: 1_040,
        };
        let (_, decision) = consume_at(Some(state), &LIMITS, 1_000);
        assert!(!decision.allowed);
        assert_eq!(decision.retry_after, Some(40));
    }

    #[test]
    fn reset_boundary_refills_to_full() {
        let state = BucketState {
            tokens: 0,
            last_refill: 1_000,
            reset_time: 1_060,
        };
        let (bucket, decision) = consume_at(Some(state), &LIMITS, 1_060);
        assert!(decision.allowed);
        assert_eq!(bucket.tokens, 9);
        assert_eq!(bucket.reset_time, 1_120);
    }

    #[test]
    fn partial_elapse_refills_proportionally() {
        let state = BucketState {
            tokens: 0,
            last_refill: 1_000,
            reset_time: 1_060,
        };
        // 30 of 60 seconds elapsed at max=10 refills 5 tokens.
        let (bucket, decision) = consume_at(Some(state), &LIMITS, 1_030);
        assert!(decision.allowed);
        assert_eq!(bucket.tokens, 4);
        assert_eq!(bucket.last_refill, 1_030);
    }

    #[test]
    fn sub_token_elapse_does_not_advance_refill_clock() {
        let state = BucketState {
            tokens: 3,
            last_refill: 1_000,
            reset_time: 1_060,
        };
        // 5s at 10/60 tokens-per-second rounds down to zero refill.
        let (bucket, _) = consume_at(Some(state), &LIMITS, 1_005);
        assert_eq!(bucket.last_refill, 1_000);
        assert_eq!(bucket.tokens, 2);
    }

    #[test]
    fn refill_never_exceeds_max() {
        let state = BucketState {
            tokens: 9,
            last_refill: 1_000,
            reset_time: 1_060,
        };
        let (bucket, _) = consume_at(Some(state), &LIMITS, 1_059);
        assert!(bucket.tokens <= LIMITS.max_requests);
    }
}
