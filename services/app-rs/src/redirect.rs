//! Redirect resolution: the hot path.
//!
//! A cache-hit redirect performs exactly one synchronous round-trip (the
//! cache lookup). The access-count bump and the analytics event run as
//! fire-and-forget tasks after the response value is already decided.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

use crate::analytics::ClickPipeline;
use crate::error::{ServiceError, ServiceResult};
use crate::mlcache::{CacheEntry, MultiLayerCache};
use crate::metrics::AppMetrics;
use crate::models::ClickEvent;
use crate::store::UrlStore;
use crate::validate;

/// Request-scoped click attributes captured from the HTTP layer. Geo
/// fields arrive pre-resolved from an upstream collaborator when present.
#[derive(Debug, Clone, Default)]
pub struct ClickContext {
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub referrer: Option<String>,
    pub country_code: Option<String>,
    pub region: Option<String>,
    pub city: Option<String>,
}

#[derive(Debug, PartialEq)]
pub enum RedirectOutcome {
    Redirect { long_url: String },
    NotFound,
    Expired { needs_tombstone: bool },
}

/// Pure resolution decision over whatever the cache produced.
pub fn decide(entry: Option<&CacheEntry>, now: DateTime<Utc>) -> RedirectOutcome {
    match entry {
        None | Some(CacheEntry::Missing) | Some(CacheEntry::Deleted) => RedirectOutcome::NotFound,
        Some(CacheEntry::Expired) => RedirectOutcome::Expired {
            needs_tombstone: false,
        },
        Some(CacheEntry::Mapping { mapping }) => {
            if mapping.is_deleted {
                RedirectOutcome::NotFound
            } else if mapping.is_expired_at(now) {
                RedirectOutcome::Expired {
                    needs_tombstone: true,
                }
            } else {
                RedirectOutcome::Redirect {
                    long_url: mapping.long_url.clone(),
                }
            }
        }
    }
}

#[derive(Default)]
pub struct RedirectStats {
    pub total: AtomicU64,
    pub success: AtomicU64,
    pub not_found: AtomicU64,
    pub expired: AtomicU64,
    pub server_error: AtomicU64,
    pub latency_micros: AtomicU64,
}

#[derive(Debug, serde::Serialize)]
pub struct RedirectStatsSnapshot {
    pub total: u64,
    pub success: u64,
    pub not_found: u64,
    pub expired: u64,
    pub server_error: u64,
    pub avg_latency_ms: f64,
    pub cache_hit_rate: f64,
}

pub struct RedirectService {
    cache: Arc<MultiLayerCache>,
    store: Arc<UrlStore>,
    pipeline: Arc<ClickPipeline>,
    metrics: &'static AppMetrics,
    stats: RedirectStats,
    slo: Duration,
}

impl RedirectService {
    pub fn new(
        cache: Arc<MultiLayerCache>,
        store: Arc<UrlStore>,
        pipeline: Arc<ClickPipeline>,
        metrics: &'static AppMetrics,
        slo: Duration,
    ) -> Self {
        Self {
            cache,
            store,
            pipeline,
            metrics,
            stats: RedirectStats::default(),
            slo,
        }
    }

    /// Resolve a short code to its target. `Ok` carries the redirect
    /// location; every failure maps through the error taxonomy (400/404/410).
    pub async fn handle_redirect(
        &self,
        short_code: &str,
        ctx: ClickContext,
    ) -> ServiceResult<String> {
        let started = Instant::now();
        self.stats.total.fetch_add(1, Ordering::Relaxed);

        if !validate::is_valid_short_code(short_code) {
            return Err(ServiceError::InvalidShortCode);
        }

        let looked = match self.cache.lookup(short_code).await {
            Ok(looked) => looked,
            Err(e) => {
                self.stats.server_error.fetch_add(1, Ordering::Relaxed);
                return Err(e);
            }
        };
        tracing::debug!(short_code, source = looked.source.as_str(), "resolved");

        let outcome = decide(looked.entry.as_ref(), Utc::now());
        let result = match outcome {
            RedirectOutcome::NotFound => {
                self.stats.not_found.fetch_add(1, Ordering::Relaxed);
                Err(ServiceError::UrlNotFound)
            }
            RedirectOutcome::Expired { needs_tombstone } => {
                self.stats.expired.fetch_add(1, Ordering::Relaxed);
                if needs_tombstone {
                    self.cache.mark_expired_default(short_code).await;
                }
                Err(ServiceError::UrlExpired)
            }
            RedirectOutcome::Redirect { long_url } => {
                self.stats.success.fetch_add(1, Ordering::Relaxed);
                self.schedule_post_redirect(short_code, looked.entry, ctx);
                Ok(long_url)
            }
        };

        let elapsed = started.elapsed();
        self.stats
            .latency_micros
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
        self.metrics
            .redirect_latency_seconds
            .observe(elapsed.as_secs_f64());
        if elapsed > self.slo {
            tracing::warn!(
                short_code,
                latency_ms = elapsed.as_millis() as u64,
                "redirect exceeded latency objective"
            );
        }

        result
    }

    /// The two fire-and-forget follow-ups: access accounting and the click
    /// event. Neither can fail the redirect; both log on error.
    fn schedule_post_redirect(
        &self,
        short_code: &str,
        entry: Option<CacheEntry>,
        ctx: ClickContext,
    ) {
        let store = Arc::clone(&self.store);
        let cache = Arc::clone(&self.cache);
        let metrics = self.metrics;
        let code = short_code.to_string();
        tokio::spawn(async move {
            metrics.db_writes_total.inc();
            if let Err(e) = store.record_access(&code).await {
                tracing::warn!(short_code = %code, error = %e, "access-count update failed");
                return;
            }
            if let Some(CacheEntry::Mapping { mut mapping }) = entry {
                mapping.access_count += 1;
                mapping.last_accessed_at = Some(Utc::now());
                cache.populate(&mapping).await;
            }
        });

        let pipeline = Arc::clone(&self.pipeline);
        let code = short_code.to_string();
        tokio::spawn(async move {
            let mut event = ClickEvent::new(&code);
            event.ip_address = ctx.ip_address;
            event.user_agent = ctx.user_agent;
            event.referrer = ctx.referrer;
            event.country_code = ctx.country_code;
            event.region = ctx.region;
            event.city = ctx.city;
            pipeline.publish_click_event(event).await;
        });
    }

    pub fn stats_snapshot(&self) -> RedirectStatsSnapshot {
        let total = self.stats.total.load(Ordering::Relaxed);
        let latency_micros = self.stats.latency_micros.load(Ordering::Relaxed);
        let hits = self.cache.memory_hits();
        let misses = self.cache.memory_misses();
        RedirectStatsSnapshot {
            total,
            success: self.stats.success.load(Ordering::Relaxed),
            not_found: self.stats.not_found.load(Ordering::Relaxed),
            expired: self.stats.expired.load(Ordering::Relaxed),
            server_error: self.stats.server_error.load(Ordering::Relaxed),
            avg_latency_ms: if total == 0 {
                0.0
            } else {
                latency_micros as f64 / total as f64 / 1_000.0
            },
            cache_hit_rate: if hits + misses == 0 {
                0.0
            } else {
                hits as f64 / (hits + misses) as f64
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::UrlMapping;
    use chrono::TimeZone;

    fn mapping(expires_at: Option<DateTime<Utc>>, is_deleted: bool) -> UrlMapping {
        UrlMapping {
            id: 1,
            short_code: "abc1234".to_string(),
            long_url: "https://example.com/long/path".to_string(),
            long_url_hash: vec![0; 32],
            user_id: None,
            is_custom_alias: false,
            created_at: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            last_accessed_at: None,
            expires_at,
            deleted_at: None,
            access_count: 0,
            is_deleted,
        }
    }

    fn at(ts: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(ts, 0).unwrap()
    }

    #[test]
    fn live_mapping_redirects() {
        let entry = CacheEntry::Mapping {
            mapping: mapping(None, false),
        };
        assert_eq!(
            decide(Some(&entry), at(1_700_000_100)),
            RedirectOutcome::Redirect {
                long_url: "https://example.com/long/path".to_string()
            }
        );
    }

    #[test]
    fn future_expiry_still_redirects() {
        let entry = CacheEntry::Mapping {
            mapping: mapping(Some(at(1_700_000_500)), false),
        };
        assert!(matches!(
            decide(Some(&entry), at(1_700_000_100)),
            RedirectOutcome::Redirect { .. }
        ));
    }

    #[test]
    fn past_expiry_is_gone_and_wants_a_tombstone() {
        let entry = CacheEntry::Mapping {
            mapping: mapping(Some(at(1_700_000_000)), false),
        };
        assert_eq!(
            decide(Some(&entry), at(1_700_000_001)),
            RedirectOutcome::Expired {
                needs_tombstone: true
            }
        );
    }

    #[test]
    fn expiry_comparison_is_second_precision_inclusive() {
        let entry = CacheEntry::Mapping {
            mapping: mapping(Some(at(1_700_000_100)), false),
        };
        assert!(matches!(
            decide(Some(&entry), at(1_700_000_100)),
            RedirectOutcome::Expired { .. }
        ));
    }

    #[test]
    fn tombstones_map_to_their_statuses() {
        assert_eq!(decide(None, at(0)), RedirectOutcome::NotFound);
        assert_eq!(
            decide(Some(&CacheEntry::Missing), at(0)),
            RedirectOutcome::NotFound
        );
        assert_eq!(
            decide(Some(&CacheEntry::Deleted), at(0)),
            RedirectOutcome::NotFound
        );
        assert_eq!(
            decide(Some(&CacheEntry::Expired), at(0)),
            RedirectOutcome::Expired {
                needs_tombstone: false
            }
        );
    }

    #[test]
    fn stale_deleted_mapping_is_not_resolved() {
        let entry = CacheEntry::Mapping {
            mapping: mapping(None, true),
        };
        assert_eq!(decide(Some(&entry), at(0)), RedirectOutcome::NotFound);
    }
}
