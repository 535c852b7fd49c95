//! Primary store adapter: typed CRUD over the mappings tables.
//!
//! Reads and idempotent writes retry transient Postgres failures with
//! exponential backoff (base 100 ms, x2, cap 2 s, 3 attempts). Every
//! attempt carries the configured statement deadline; a deadline expiry
//! counts as transient.

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use sqlx::{PgPool, QueryBuilder};
use uuid::Uuid;

use crate::error::{ServiceError, ServiceResult};
use crate::models::{ClickEvent, DailySummary, UrlMapping, UserRecord};

const RETRY_BASE_MS: u64 = 100;
const RETRY_CAP_MS: u64 = 2_000;
const RETRY_ATTEMPTS: u32 = 3;

const MAPPING_COLUMNS: &str = "id, short_code, long_url, long_url_hash, user_id, is_custom_alias, \
     created_at, last_accessed_at, expires_at, deleted_at, access_count, is_deleted";

/// Fields for a new mapping row; the store owns id and timestamps.
#[derive(Debug, Clone)]
pub struct NewMapping {
    pub short_code: String,
    pub long_url: String,
    pub long_url_hash: Vec<u8>,
    pub user_id: Option<Uuid>,
    pub is_custom_alias: bool,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Clone)]
pub struct UrlStore {
    pool: PgPool,
    statement_timeout: Duration,
}

impl UrlStore {
    pub fn new(pool: PgPool, statement_timeout: Duration) -> Self {
        Self {
            pool,
            statement_timeout,
        }
    }

    pub async fn fetch_live_mapping(&self, short_code: &str) -> ServiceResult<Option<UrlMapping>> {
        let pool = self.pool.clone();
        let code = short_code.to_string();
        self.with_retry("fetch_live_mapping", move || {
            let pool = pool.clone();
            let code = code.clone();
            async move {
                sqlx::query_as::<_, UrlMapping>(&format!(
                    "SELECT {MAPPING_COLUMNS} FROM url_mappings WHERE short_code = $1 AND NOT is_deleted"
                ))
                .bind(&code)
                .fetch_optional(&pool)
                .await
            }
        })
        .await
    }

    pub async fn short_code_exists(&self, short_code: &str) -> ServiceResult<bool> {
        let pool = self.pool.clone();
        let code = short_code.to_string();
        let row: Option<(i64,)> = self
            .with_retry("short_code_exists", move || {
                let pool = pool.clone();
                let code = code.clone();
                async move {
                    sqlx::query_as(
                        "SELECT 1::BIGINT FROM url_mappings WHERE short_code = $1 AND NOT is_deleted",
                    )
                    .bind(&code)
                    .fetch_optional(&pool)
                    .await
                }
            })
            .await?;
        Ok(row.is_some())
    }

    /// Insert a new mapping. A live-row uniqueness violation maps to
    /// `DuplicateCode` so callers can run their collision-retry loop.
    pub async fn insert_mapping(&self, new: &NewMapping) -> ServiceResult<UrlMapping> {
        let result = sqlx::query_as::<_, UrlMapping>(&format!(
            "INSERT INTO url_mappings \
                 (short_code, long_url, long_url_hash, user_id, is_custom_alias, expires_at) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             RETURNING {MAPPING_COLUMNS}"
        ))
        .bind(&new.short_code)
        .bind(&new.long_url)
        .bind(&new.long_url_hash)
        .bind(new.user_id)
        .bind(new.is_custom_alias)
        .bind(new.expires_at)
        .fetch_one(&self.pool)
        .await;

        match result {
            Ok(mapping) => Ok(mapping),
            Err(e) if is_unique_violation(&e) => {
                Err(ServiceError::DuplicateCode(new.short_code.clone()))
            }
            Err(e) if is_transient(&e) => Err(ServiceError::StoreUnavailable(e.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    /// Find a non-deleted, non-expired mapping by content hash for reuse.
    pub async fn find_reusable(
        &self,
        long_url_hash: &[u8],
        user_id: Uuid,
    ) -> ServiceResult<Option<UrlMapping>> {
        let pool = self.pool.clone();
        let hash = long_url_hash.to_vec();
        self.with_retry("find_reusable", move || {
            let pool = pool.clone();
            let hash = hash.clone();
            async move {
                sqlx::query_as::<_, UrlMapping>(&format!(
                    "SELECT {MAPPING_COLUMNS} FROM url_mappings \
                     WHERE long_url_hash = $1 AND user_id = $2 AND NOT is_deleted \
                       AND (expires_at IS NULL OR expires_at > now()) \
                     ORDER BY created_at DESC LIMIT 1"
                ))
                .bind(&hash)
                .bind(user_id)
                .fetch_optional(&pool)
                .await
            }
        })
        .await
    }

    /// Most-accessed live mappings, used to pre-warm the caches at boot.
    pub async fn fetch_popular(&self, limit: i64) -> ServiceResult<Vec<UrlMapping>> {
        let pool = self.pool.clone();
        self.with_retry("fetch_popular", move || {
            let pool = pool.clone();
            async move {
                sqlx::query_as::<_, UrlMapping>(&format!(
                    "SELECT {MAPPING_COLUMNS} FROM url_mappings \
                     WHERE NOT is_deleted AND (expires_at IS NULL OR expires_at > now()) \
                     ORDER BY access_count DESC LIMIT $1"
                ))
                .bind(limit)
                .fetch_all(&pool)
                .await
            }
        })
        .await
    }

    /// Soft-delete a live mapping; returns the row it retired, if any.
    pub async fn soft_delete(&self, short_code: &str) -> ServiceResult<Option<UrlMapping>> {
        let result = sqlx::query_as::<_, UrlMapping>(&format!(
            "UPDATE url_mappings SET is_deleted = TRUE, deleted_at = now() \
             WHERE short_code = $1 AND NOT is_deleted \
             RETURNING {MAPPING_COLUMNS}"
        ))
        .bind(short_code)
        .fetch_optional(&self.pool)
        .await?;
        Ok(result)
    }

    /// Bump access_count and refresh last_accessed_at. Idempotence is not
    /// required here; the counter is allowed to lag under crashes.
    pub async fn record_access(&self, short_code: &str) -> ServiceResult<()> {
        let pool = self.pool.clone();
        let code = short_code.to_string();
        self.with_retry("record_access", move || {
            let pool = pool.clone();
            let code = code.clone();
            async move {
                sqlx::query(
                    "UPDATE url_mappings \
                     SET access_count = access_count + 1, last_accessed_at = now() \
                     WHERE short_code = $1 AND NOT is_deleted",
                )
                .bind(&code)
                .execute(&pool)
                .await
                .map(|_| ())
            }
        })
        .await
    }

    pub async fn fetch_user(&self, user_id: Uuid) -> ServiceResult<Option<UserRecord>> {
        let pool = self.pool.clone();
        self.with_retry("fetch_user", move || {
            let pool = pool.clone();
            async move {
                sqlx::query_as::<_, UserRecord>(
                    "SELECT duplicate_strategy, default_expiry_days FROM users WHERE id = $1",
                )
                .bind(user_id)
                .fetch_optional(&pool)
                .await
            }
        })
        .await
    }

    /// Atomically reserve `[start, end)` from the named counter. The upsert
    /// seeds the row on first use so a fresh database can allocate.
    pub async fn reserve_id_range(&self, name: &str, batch: i64) -> ServiceResult<(i64, i64)> {
        let pool = self.pool.clone();
        let name = name.to_string();
        let (next,): (i64,) = self
            .with_retry("reserve_id_range", move || {
                let pool = pool.clone();
                let name = name.clone();
                async move {
                    sqlx::query_as(
                        "INSERT INTO id_counter (name, next_value) VALUES ($1, 1 + $2) \
                         ON CONFLICT (name) DO UPDATE \
                            SET next_value = id_counter.next_value + $2 \
                         RETURNING next_value",
                    )
                    .bind(&name)
                    .bind(batch)
                    .fetch_one(&pool)
                    .await
                }
            })
            .await?;
        Ok((next - batch, next))
    }

    /// Soft-delete up to `limit` expired rows in one statement, returning the
    /// short codes touched so the caller can invalidate caches.
    pub async fn sweep_expired(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> ServiceResult<Vec<String>> {
        let pool = self.pool.clone();
        let rows: Vec<(String,)> = self
            .with_retry("sweep_expired", move || {
                let pool = pool.clone();
                async move {
                    sqlx::query_as(
                        "UPDATE url_mappings SET is_deleted = TRUE, deleted_at = now() \
                         WHERE id IN ( \
                             SELECT id FROM url_mappings \
                             WHERE NOT is_deleted AND expires_at IS NOT NULL AND expires_at <= $1 \
                             ORDER BY expires_at \
                             LIMIT $2 \
                             FOR UPDATE SKIP LOCKED \
                         ) \
                         RETURNING short_code",
                    )
                    .bind(now)
                    .bind(limit)
                    .fetch_all(&pool)
                    .await
                }
            })
            .await?;
        Ok(rows.into_iter().map(|(code,)| code).collect())
    }

    /// Multi-row VALUES insert of raw click events. `event_id` is the primary
    /// key, so replays after a partial failure are harmless.
    pub async fn insert_events(&self, events: &[ClickEvent]) -> ServiceResult<u64> {
        if events.is_empty() {
            return Ok(0);
        }
        let pool = self.pool.clone();
        let events = events.to_vec();
        self.with_retry("insert_events", move || {
            let pool = pool.clone();
            let events = events.clone();
            async move {
                let mut qb: QueryBuilder<sqlx::Postgres> = QueryBuilder::new(
                    "INSERT INTO analytics_events \
                     (event_id, short_code, clicked_at, ip_address, user_agent, referrer, \
                      country_code, region, city, device_type, browser, os) ",
                );
                qb.push_values(events.iter(), |mut b, e| {
                    b.push_bind(e.event_id)
                        .push_bind(&e.short_code)
                        .push_bind(e.clicked_at)
                        .push_bind(&e.ip_address)
                        .push_bind(&e.user_agent)
                        .push_bind(&e.referrer)
                        .push_bind(&e.country_code)
                        .push_bind(&e.region)
                        .push_bind(&e.city)
                        .push_bind(&e.device_type)
                        .push_bind(&e.browser)
                        .push_bind(&e.os);
                });
                qb.push(" ON CONFLICT (event_id) DO NOTHING");
                qb.build().execute(&pool).await.map(|r| r.rows_affected())
            }
        })
        .await
    }

    pub async fn fetch_daily_summary(
        &self,
        short_code: &str,
        date: NaiveDate,
    ) -> ServiceResult<Option<DailySummary>> {
        let pool = self.pool.clone();
        let code = short_code.to_string();
        self.with_retry("fetch_daily_summary", move || {
            let pool = pool.clone();
            let code = code.clone();
            async move {
                sqlx::query_as::<_, DailySummary>(
                    "SELECT short_code, date, total_clicks, top_countries, top_referrers, \
                            top_devices, top_browsers, hourly, peak_hour \
                     FROM analytics_daily_summaries WHERE short_code = $1 AND date = $2",
                )
                .bind(&code)
                .bind(date)
                .fetch_optional(&pool)
                .await
            }
        })
        .await
    }

    pub async fn ping(&self) -> ServiceResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn with_retry<T, F, Fut>(&self, op: &'static str, make: F) -> ServiceResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, sqlx::Error>>,
    {
        let mut delay = Duration::from_millis(RETRY_BASE_MS);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let err = match tokio::time::timeout(self.statement_timeout, make()).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) if !is_transient(&e) => return Err(e.into()),
                Ok(Err(e)) => ServiceError::StoreUnavailable(e.to_string()),
                Err(_) => ServiceError::StoreUnavailable(format!("{op} exceeded deadline")),
            };
            if attempt >= RETRY_ATTEMPTS {
                return Err(err);
            }
            tracing::warn!(op, attempt, error = %err, "transient store error, retrying");
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(Duration::from_millis(RETRY_CAP_MS));
        }
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err.as_database_error().and_then(|d| d.code()).as_deref(),
        Some("23505")
    )
}

fn is_transient(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut => true,
        sqlx::Error::Database(db) => matches!(
            db.code().as_deref(),
            // admin shutdown, cannot connect now, too many connections,
            // connection failures
            Some("57P01" | "57P03" | "53300" | "08000" | "08001" | "08006")
        ),
        _ => false,
    }
}
