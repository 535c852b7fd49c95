//! Counter-range allocator.
//!
//! Holds one reserved range `[cursor, end)` in memory and hands out
//! monotonically increasing ids under a mutex. When the range runs dry it
//! reserves the next contiguous window from the store's `id_counter` row;
//! the store adapter already retries transient failures, so a refill error
//! here means the allocator is genuinely unavailable.

use std::sync::Arc;

use tokio::sync::Mutex;

use crate::error::{ServiceError, ServiceResult};
use crate::store::UrlStore;

#[derive(Debug, Clone, Copy)]
struct IdRange {
    cursor: i64,
    end: i64,
}

pub struct CounterAllocator {
    store: Arc<UrlStore>,
    counter_name: String,
    batch_size: i64,
    range: Mutex<Option<IdRange>>,
}

impl CounterAllocator {
    pub fn new(store: Arc<UrlStore>, counter_name: String, batch_size: i64) -> Self {
        Self {
            store,
            counter_name,
            batch_size,
            range: Mutex::new(None),
        }
    }

    /// Next unique id, refilling the range when exhausted.
    pub async fn next(&self) -> ServiceResult<u64> {
        let mut guard = self.range.lock().await;
        if let Some(ref mut range) = *guard {
            if range.cursor < range.end {
                let id = range.cursor;
                range.cursor += 1;
                return Ok(id as u64);
            }
        }

        let fresh = self.reserve().await?;
        let id = fresh.cursor;
        *guard = Some(IdRange {
            cursor: fresh.cursor + 1,
            end: fresh.end,
        });
        Ok(id as u64)
    }

    /// Force a range reservation; called at startup so the first request
    /// never pays the refill round-trip.
    pub async fn pre_allocate(&self) -> ServiceResult<()> {
        let mut guard = self.range.lock().await;
        if guard.is_none() {
            let fresh = self.reserve().await?;
            *guard = Some(fresh);
        }
        Ok(())
    }

    /// Ids left in the current range.
    pub async fn remaining(&self) -> u64 {
        match *self.range.lock().await {
            Some(range) => (range.end - range.cursor).max(0) as u64,
            None => 0,
        }
    }

    /// The current `[cursor, end)` window, if one is held.
    pub async fn current_range(&self) -> Option<(u64, u64)> {
        (*self.range.lock().await).map(|r| (r.cursor as u64, r.end as u64))
    }

    async fn reserve(&self) -> ServiceResult<IdRange> {
        match self
            .store
            .reserve_id_range(&self.counter_name, self.batch_size)
            .await
        {
            Ok((start, end)) => {
                tracing::info!(start, end, counter = %self.counter_name, "reserved id range");
                Ok(IdRange { cursor: start, end })
            }
            Err(e) => {
                tracing::error!(error = %e, counter = %self.counter_name, "id range reservation failed");
                Err(ServiceError::AllocatorUnavailable)
            }
        }
    }
}
