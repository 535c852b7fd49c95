//! Short-URL creation orchestration.

use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use sha2::{Digest, Sha256};
use tokio::task::JoinSet;
use uuid::Uuid;

use crate::enums::DuplicateStrategy;
use crate::error::{ServiceError, ServiceResult};
use crate::idgen::IdGenerator;
use crate::mlcache::MultiLayerCache;
use crate::models::{BulkShortenItem, ShortenRequest, ShortenResponse};
use crate::store::{NewMapping, UrlStore};
use crate::validate;

/// Bulk requests are processed in slices of this size, each slice running
/// concurrently, so one slow item never stalls the whole submission.
const BULK_BATCH_SIZE: usize = 10;

pub fn hash_long_url(sanitized: &str) -> Vec<u8> {
    Sha256::digest(sanitized.as_bytes()).to_vec()
}

/// Expiry resolution: an explicit request wins, then the user's default;
/// fractional days are honored to the millisecond.
pub fn compute_expiry(
    now: DateTime<Utc>,
    requested_days: Option<f64>,
    default_days: Option<i32>,
) -> Option<DateTime<Utc>> {
    let days = match (requested_days, default_days) {
        (Some(d), _) => d,
        (None, Some(d)) => d as f64,
        (None, None) => return None,
    };
    if days <= 0.0 {
        return None;
    }
    let millis = (days * 86_400_000.0) as i64;
    Some(now + ChronoDuration::milliseconds(millis))
}

#[derive(Clone)]
pub struct ShortenerService {
    store: Arc<UrlStore>,
    cache: Arc<MultiLayerCache>,
    idgen: Arc<IdGenerator>,
    base_url: String,
    max_retries: u32,
}

impl ShortenerService {
    pub fn new(
        store: Arc<UrlStore>,
        cache: Arc<MultiLayerCache>,
        idgen: Arc<IdGenerator>,
        base_url: String,
        max_retries: u32,
    ) -> Self {
        Self {
            store,
            cache,
            idgen,
            base_url,
            max_retries,
        }
    }

    pub async fn create_short_url(
        &self,
        request: &ShortenRequest,
        user_id: Option<Uuid>,
    ) -> ServiceResult<ShortenResponse> {
        let sanitized = validate::validate_url(&request.url)?;
        let long_url_hash = hash_long_url(&sanitized);

        let user = match user_id {
            Some(id) => self.store.fetch_user(id).await?,
            None => None,
        };
        let strategy = user
            .as_ref()
            .map(|u| u.duplicate_strategy())
            .unwrap_or(DuplicateStrategy::GenerateNew);
        let expires_at = compute_expiry(
            Utc::now(),
            request.expiry_days,
            user.as_ref().and_then(|u| u.default_expiry_days),
        );

        if let Some(ref alias) = request.custom_alias {
            return self
                .create_with_alias(alias, &sanitized, long_url_hash, user_id, expires_at)
                .await;
        }

        if strategy == DuplicateStrategy::ReuseExisting {
            if let Some(id) = user_id {
                if let Some(existing) = self.store.find_reusable(&long_url_hash, id).await? {
                    self.cache.populate(&existing).await;
                    return Ok(ShortenResponse::from_mapping(&existing, &self.base_url, true));
                }
            }
        }

        self.create_generated(&sanitized, long_url_hash, user_id, expires_at)
            .await
    }

    async fn create_with_alias(
        &self,
        alias: &str,
        sanitized: &str,
        long_url_hash: Vec<u8>,
        user_id: Option<Uuid>,
        expires_at: Option<DateTime<Utc>>,
    ) -> ServiceResult<ShortenResponse> {
        let alias = validate::validate_alias(alias)?;

        if self.store.short_code_exists(&alias).await? {
            let suggestions = validate::suggest_aliases(&self.store, &alias).await;
            return Err(ServiceError::AliasTaken { alias, suggestions });
        }

        let new = NewMapping {
            short_code: alias.clone(),
            long_url: sanitized.to_string(),
            long_url_hash,
            user_id,
            is_custom_alias: true,
            expires_at,
        };
        match self.store.insert_mapping(&new).await {
            Ok(mapping) => {
                self.cache.populate(&mapping).await;
                Ok(ShortenResponse::from_mapping(&mapping, &self.base_url, false))
            }
            // Lost the race between the probe and the insert.
            Err(ServiceError::DuplicateCode(_)) => {
                let suggestions = validate::suggest_aliases(&self.store, &alias).await;
                Err(ServiceError::AliasTaken { alias, suggestions })
            }
            Err(e) => Err(e),
        }
    }

    async fn create_generated(
        &self,
        sanitized: &str,
        long_url_hash: Vec<u8>,
        user_id: Option<Uuid>,
        expires_at: Option<DateTime<Utc>>,
    ) -> ServiceResult<ShortenResponse> {
        for attempt in 1..=self.max_retries {
            let generated = self.idgen.generate(sanitized).await?;
            let new = NewMapping {
                short_code: generated.code,
                long_url: sanitized.to_string(),
                long_url_hash: long_url_hash.clone(),
                user_id,
                is_custom_alias: false,
                expires_at,
            };
            match self.store.insert_mapping(&new).await {
                Ok(mapping) => {
                    self.cache.populate(&mapping).await;
                    return Ok(ShortenResponse::from_mapping(&mapping, &self.base_url, false));
                }
                Err(ServiceError::DuplicateCode(code)) => {
                    tracing::warn!(%code, attempt, method = ?generated.method, "short code collision, regenerating");
                }
                Err(e) => return Err(e),
            }
        }
        Err(ServiceError::GenerationFailed {
            attempts: self.max_retries,
        })
    }

    /// Bulk creation. Items run in bounded-concurrency slices and each item
    /// fails alone; order of results matches order of inputs.
    pub async fn create_bulk(
        &self,
        items: Vec<ShortenRequest>,
        user_id: Option<Uuid>,
    ) -> Vec<BulkShortenItem> {
        let mut results: Vec<Option<BulkShortenItem>> = Vec::new();
        results.resize_with(items.len(), || None);

        for (chunk_start, chunk) in items
            .chunks(BULK_BATCH_SIZE)
            .enumerate()
            .map(|(i, c)| (i * BULK_BATCH_SIZE, c))
        {
            let mut set = JoinSet::new();
            for (offset, request) in chunk.iter().cloned().enumerate() {
                let service = self.clone();
                set.spawn(async move {
                    let outcome = match service.create_short_url(&request, user_id).await {
                        Ok(resp) => BulkShortenItem::Ok(resp),
                        Err(e) => BulkShortenItem::Err {
                            error: e.code().to_string(),
                            message: e.to_string(),
                        },
                    };
                    (chunk_start + offset, outcome)
                });
            }
            while let Some(joined) = set.join_next().await {
                match joined {
                    Ok((index, outcome)) => results[index] = Some(outcome),
                    Err(e) => tracing::error!(error = %e, "bulk shorten task panicked"),
                }
            }
        }

        results
            .into_iter()
            .map(|r| {
                r.unwrap_or(BulkShortenItem::Err {
                    error: "VALIDATION_ERROR".to_string(),
                    message: "item was not processed".to_string(),
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn explicit_days_win_over_user_default() {
        let now = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let expiry = compute_expiry(now, Some(2.0), Some(30)).unwrap();
        assert_eq!((expiry - now).num_days(), 2);
    }

    #[test]
    fn user_default_applies_when_request_is_silent() {
        let now = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let expiry = compute_expiry(now, None, Some(30)).unwrap();
        assert_eq!((expiry - now).num_days(), 30);
    }

    #[test]
    fn no_days_means_no_expiry() {
        let now = Utc::now();
        assert!(compute_expiry(now, None, None).is_none());
        assert!(compute_expiry(now, Some(0.0), None).is_none());
        assert!(compute_expiry(now, Some(-1.0), Some(5)).is_none());
    }

    #[test]
    fn fractional_days_resolve_to_milliseconds() {
        let now = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let expiry = compute_expiry(now, Some(0.0001), None).unwrap();
        let delta_ms = (expiry - now).num_milliseconds();
        assert_eq!(delta_ms, 8_640);
    }

    #[test]
    fn url_hash_tracks_canonical_form() {
        let a = hash_long_url(&validate::validate_url("https://Example.com/x").unwrap());
        let b = hash_long_url(&validate::validate_url("HTTPS://example.COM/x").unwrap());
        let c = hash_long_url(&validate::validate_url("https://example.com/y").unwrap());
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 32);
    }
}
