//! Multi-layer cache: in-process LRU (L1) -> Redis (L2) -> store (L3).
//!
//! Lookups read through with promotion; misses against the store leave a
//! `missing` tombstone in L2 so repeated probes for junk codes never reach
//! the database. Cache writes are best-effort: L1/L2 failures are logged
//! and swallowed, only store errors propagate.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cache::{entry_key, RedisCache};
use crate::enums::CacheSource;
use crate::error::ServiceResult;
use crate::lru_cache::MemoryCache;
use crate::metrics::AppMetrics;
use crate::models::UrlMapping;
use crate::store::UrlStore;

/// Logical cache value: a live mapping, or an assertion of absence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CacheEntry {
    Mapping { mapping: UrlMapping },
    Missing,
    Expired,
    Deleted,
}

impl CacheEntry {
    pub fn mapping(&self) -> Option<&UrlMapping> {
        match self {
            Self::Mapping { mapping } => Some(mapping),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub struct CacheLookup {
    pub entry: Option<CacheEntry>,
    pub source: CacheSource,
}

pub struct MultiLayerCache {
    memory: MemoryCache<CacheEntry>,
    redis: RedisCache,
    store: Arc<UrlStore>,
    metrics: &'static AppMetrics,
    url_ttl_seconds: u64,
    expired_tombstone_ttl_seconds: u64,
}

impl MultiLayerCache {
    pub fn new(
        memory: MemoryCache<CacheEntry>,
        redis: RedisCache,
        store: Arc<UrlStore>,
        metrics: &'static AppMetrics,
        url_ttl_seconds: u64,
        expired_tombstone_ttl_seconds: u64,
    ) -> Self {
        Self {
            memory,
            redis,
            store,
            metrics,
            url_ttl_seconds,
            expired_tombstone_ttl_seconds,
        }
    }

    /// Read-through lookup. A cache-layer timeout falls through to the next
    /// layer; only a store failure is an error.
    pub async fn lookup(&self, short_code: &str) -> ServiceResult<CacheLookup> {
        if let Some(entry) = self.memory.get(short_code) {
            self.metrics.cache_hits_total.with_label_values(&["memory"]).inc();
            return Ok(CacheLookup {
                entry: Some(entry),
                source: CacheSource::Memory,
            });
        }
        self.metrics.cache_misses_total.with_label_values(&["memory"]).inc();

        let key = entry_key(short_code);
        if let Some(entry) = self.redis.get_json::<CacheEntry>(&key).await {
            self.metrics.cache_hits_total.with_label_values(&["redis"]).inc();
            self.memory.put(short_code, entry.clone());
            return Ok(CacheLookup {
                entry: Some(entry),
                source: CacheSource::Redis,
            });
        }
        self.metrics.cache_misses_total.with_label_values(&["redis"]).inc();

        self.metrics.db_reads_total.inc();
        match self.store.fetch_live_mapping(short_code).await? {
            Some(mapping) => {
                let entry = CacheEntry::Mapping { mapping };
                if let Err(e) = self.redis.set_json(&key, &entry, self.url_ttl_seconds).await {
                    tracing::warn!(short_code, error = %e, "L2 populate failed");
                }
                self.memory.put(short_code, entry.clone());
                Ok(CacheLookup {
                    entry: Some(entry),
                    source: CacheSource::Database,
                })
            }
            None => {
                self.metrics
                    .tombstone_writes_total
                    .with_label_values(&["missing"])
                    .inc();
                if let Err(e) = self
                    .redis
                    .set_json(&key, &CacheEntry::Missing, self.url_ttl_seconds)
                    .await
                {
                    tracing::warn!(short_code, error = %e, "missing tombstone write failed");
                }
                Ok(CacheLookup {
                    entry: None,
                    source: CacheSource::NotFound,
                })
            }
        }
    }

    /// Write-through after a successful store insert: L2 then L1, both
    /// best-effort.
    pub async fn populate(&self, mapping: &UrlMapping) {
        let entry = CacheEntry::Mapping {
            mapping: mapping.clone(),
        };
        let key = entry_key(&mapping.short_code);
        if let Err(e) = self.redis.set_json(&key, &entry, self.url_ttl_seconds).await {
            tracing::warn!(short_code = %mapping.short_code, error = %e, "L2 write-through failed");
        }
        self.memory.put(&mapping.short_code, entry);
    }

    /// Evict from L1 and L2 synchronously.
    pub async fn invalidate(&self, short_code: &str) {
        self.memory.remove(short_code);
        if let Err(e) = self.redis.del(&entry_key(short_code)).await {
            tracing::warn!(short_code, error = %e, "L2 invalidate failed");
        }
    }

    /// Replace the entry with an `expired` tombstone of the given TTL.
    pub async fn mark_expired(&self, short_code: &str, ttl: Duration) {
        self.metrics
            .tombstone_writes_total
            .with_label_values(&["expired"])
            .inc();
        self.memory.put(short_code, CacheEntry::Expired);
        if let Err(e) = self
            .redis
            .set_json(&entry_key(short_code), &CacheEntry::Expired, ttl.as_secs())
            .await
        {
            tracing::warn!(short_code, error = %e, "expired tombstone write failed");
        }
    }

    pub async fn mark_expired_default(&self, short_code: &str) {
        self.mark_expired(
            short_code,
            Duration::from_secs(self.expired_tombstone_ttl_seconds),
        )
        .await;
    }

    /// Replace the entry with a `deleted` tombstone after a soft delete.
    pub async fn mark_deleted(&self, short_code: &str) {
        self.metrics
            .tombstone_writes_total
            .with_label_values(&["deleted"])
            .inc();
        self.memory.put(short_code, CacheEntry::Deleted);
        if let Err(e) = self
            .redis
            .set_json(
                &entry_key(short_code),
                &CacheEntry::Deleted,
                self.expired_tombstone_ttl_seconds,
            )
            .await
        {
            tracing::warn!(short_code, error = %e, "deleted tombstone write failed");
        }
    }

    /// Batch-populate both layers with known-popular mappings.
    pub async fn warm_up(&self, mappings: &[UrlMapping]) {
        for mapping in mappings {
            self.populate(mapping).await;
        }
        tracing::info!(count = mappings.len(), "cache warm-up complete");
    }

    pub fn memory_hits(&self) -> u64 {
        self.memory.hits()
    }

    pub fn memory_misses(&self) -> u64 {
        self.memory.misses()
    }

    pub fn memory_entries(&self) -> usize {
        self.memory.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_entry_round_trips_tagged_json() {
        let raw = serde_json::to_string(&CacheEntry::Expired).unwrap();
        assert!(raw.contains("\"kind\":\"expired\""));
        let back: CacheEntry = serde_json::from_str(&raw).unwrap();
        assert_eq!(back, CacheEntry::Expired);
    }
}
