//! Expiry sweeper: background retirement of mappings past their TTL.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::metrics::AppMetrics;
use crate::mlcache::MultiLayerCache;
use crate::store::UrlStore;

pub struct ExpirySweeper {
    store: Arc<UrlStore>,
    cache: Arc<MultiLayerCache>,
    metrics: &'static AppMetrics,
    interval: Duration,
    batch_size: i64,
    tombstone_ttl: Duration,
    running: AtomicBool,
}

impl ExpirySweeper {
    pub fn new(
        store: Arc<UrlStore>,
        cache: Arc<MultiLayerCache>,
        metrics: &'static AppMetrics,
        interval: Duration,
        batch_size: i64,
        tombstone_ttl: Duration,
    ) -> Self {
        Self {
            store,
            cache,
            metrics,
            interval,
            batch_size,
            tombstone_ttl,
            running: AtomicBool::new(false),
        }
    }

    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        let sweeper = self;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweeper.interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => sweeper.tick().await,
                }
            }
            tracing::info!("expiry sweeper stopped");
        })
    }

    /// One sweep pass. The running flag makes overlapping ticks (slow store,
    /// short interval) a no-op instead of a double sweep.
    pub async fn tick(&self) {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!("sweep already in flight, skipping tick");
            return;
        }

        let swept = self.sweep_once().await;
        self.running.store(false, Ordering::Release);

        if let Err(e) = swept {
            tracing::warn!(error = %e, "expiry sweep failed");
        }
    }

    async fn sweep_once(&self) -> crate::error::ServiceResult<()> {
        let codes = self
            .store
            .sweep_expired(Utc::now(), self.batch_size)
            .await?;
        if codes.is_empty() {
            return Ok(());
        }

        for code in &codes {
            // Evict whatever is cached first, then leave the long-lived
            // tombstone so repeat lookups stop at L1/L2.
            self.cache.invalidate(code).await;
            self.cache.mark_expired(code, self.tombstone_ttl).await;
        }
        self.metrics.expired_swept_total.inc_by(codes.len() as u64);
        tracing::info!(count = codes.len(), "retired expired mappings");
        Ok(())
    }
}
