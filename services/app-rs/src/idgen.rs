//! ID generation façade: counter path first, hash fallback.

use std::sync::Arc;

use crate::allocator::CounterAllocator;
use crate::base62;
use crate::enums::IdMethod;
use crate::error::{ServiceError, ServiceResult};
use crate::hashgen::HashIdGenerator;
use crate::models::IdGenStatus;
use crate::store::UrlStore;

#[derive(Debug, Clone)]
pub struct GeneratedId {
    pub code: String,
    pub method: IdMethod,
    pub attempts: u32,
}

pub struct IdGenerator {
    allocator: Arc<CounterAllocator>,
    hash: HashIdGenerator,
    store: Arc<UrlStore>,
    min_length: usize,
}

impl IdGenerator {
    pub fn new(
        allocator: Arc<CounterAllocator>,
        hash: HashIdGenerator,
        store: Arc<UrlStore>,
        min_length: usize,
    ) -> Self {
        Self {
            allocator,
            hash,
            store,
            min_length,
        }
    }

    /// Issue a code for `seed_url`. Counter ids are monotone and cannot
    /// collide, but a single existence probe guards against historical
    /// divergences in the counter row. On the hash path the code derives
    /// from the URL content first; entropy only enters once the
    /// deterministic nonce range is exhausted.
    pub async fn generate(&self, seed_url: &str) -> ServiceResult<GeneratedId> {
        match self.allocator.next().await {
            Ok(id) => {
                let code = base62::encode_min_len(id, self.min_length);
                if self.store.short_code_exists(&code).await? {
                    tracing::warn!(%code, id, "counter id already present, falling back to hash");
                } else {
                    return Ok(GeneratedId {
                        code,
                        method: IdMethod::Counter,
                        attempts: 1,
                    });
                }
            }
            Err(ServiceError::AllocatorUnavailable) => {
                tracing::warn!("counter allocator unavailable, using hash fallback");
            }
            Err(e) => return Err(e),
        }

        let (code, attempts) = match self.hash.from_url(seed_url, self.min_length).await {
            Ok(generated) => generated,
            Err(ServiceError::HashExhausted(_)) => self.hash.random(self.min_length).await?,
            Err(e) => return Err(e),
        };
        Ok(GeneratedId {
            code,
            method: IdMethod::Hash,
            attempts,
        })
    }

    /// Capability report for the status endpoint.
    pub async fn status(&self) -> IdGenStatus {
        let remaining = self.allocator.remaining().await;
        let range = self.allocator.current_range().await;
        let store_up = self.store.ping().await.is_ok();

        let capability = match (range.is_some() || remaining > 0, store_up) {
            (true, true) => "both-available",
            (true, false) => "counter",
            (false, true) => "hash-fallback",
            (false, false) => "unavailable",
        };

        IdGenStatus {
            capability,
            preferred: IdMethod::Counter,
            allocator_remaining: remaining,
            allocator_range: range,
        }
    }
}
