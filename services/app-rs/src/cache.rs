//! Distributed cache adapter (L2).
//!
//! Thin typed layer over a shared `ConnectionManager`. Every operation
//! carries the configured deadline and fails with `CacheUnavailable`;
//! reads additionally fail open and return `None`. Callers decide whether
//! an error is log-and-drop (cache writes) or fall-through (reads).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Mutex;

use crate::error::{ServiceError, ServiceResult};

pub fn entry_key(short_code: &str) -> String {
    format!("url:{short_code}")
}

pub fn summary_key(short_code: &str, date: NaiveDate) -> String {
    format!("analytics:summary:{short_code}:{date}")
}

pub fn bucket_key(principal: &str) -> String {
    format!("ratelimit:{principal}")
}

#[derive(Clone)]
pub struct RedisCache {
    conn: Arc<Mutex<ConnectionManager>>,
    op_timeout: Duration,
}

impl RedisCache {
    pub async fn connect(url: &str, op_timeout: Duration) -> ServiceResult<Self> {
        let client =
            redis::Client::open(url).map_err(|e| ServiceError::CacheUnavailable(e.to_string()))?;
        let mgr = ConnectionManager::new(client)
            .await
            .map_err(|e| ServiceError::CacheUnavailable(e.to_string()))?;
        Ok(Self::from_manager(mgr, op_timeout))
    }

    pub fn from_manager(mgr: ConnectionManager, op_timeout: Duration) -> Self {
        Self {
            conn: Arc::new(Mutex::new(mgr)),
            op_timeout,
        }
    }

    pub async fn ping(&self) -> ServiceResult<()> {
        let mut conn = self.conn.lock().await;
        let cmd = redis::cmd("PING");
        let fut = cmd.query_async::<_, String>(&mut *conn);
        deadline(self.op_timeout, fut).await?;
        Ok(())
    }

    /// Fetch and deserialize a JSON value. Miss, deadline expiry and broken
    /// payloads all read as a miss.
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = {
            let mut conn = self.conn.lock().await;
            let fut = conn.get::<_, Option<String>>(key);
            deadline(self.op_timeout, fut).await.ok()??
        };
        serde_json::from_str(&raw).ok()
    }

    pub async fn set_json<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl_seconds: u64,
    ) -> ServiceResult<()> {
        let payload = serde_json::to_string(value)
            .map_err(|e| ServiceError::Validation(format!("unencodable cache value: {e}")))?;
        let mut conn = self.conn.lock().await;
        let fut = conn.set_ex::<_, _, ()>(key, payload, ttl_seconds);
        deadline(self.op_timeout, fut).await
    }

    pub async fn del(&self, key: &str) -> ServiceResult<()> {
        let mut conn = self.conn.lock().await;
        let fut = conn.del::<_, ()>(key);
        deadline(self.op_timeout, fut).await
    }

    pub async fn del_many(&self, keys: &[String]) -> ServiceResult<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.lock().await;
        let fut = conn.del::<_, ()>(keys);
        deadline(self.op_timeout, fut).await
    }

    /// All hash fields of a limiter bucket.
    pub async fn read_bucket(&self, key: &str) -> ServiceResult<HashMap<String, String>> {
        let mut conn = self.conn.lock().await;
        let fut = conn.hgetall::<_, HashMap<String, String>>(key);
        deadline(self.op_timeout, fut).await
    }

    /// Write hash fields and the bucket expiry atomically.
    pub async fn write_bucket(
        &self,
        key: &str,
        fields: &[(&str, String)],
        ttl_seconds: i64,
    ) -> ServiceResult<()> {
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.hset_multiple(key, fields);
        pipe.expire(key, ttl_seconds);
        let mut conn = self.conn.lock().await;
        let fut = pipe.query_async::<_, ()>(&mut *conn);
        deadline(self.op_timeout, fut).await
    }
}

/// Apply the per-op deadline and fold both failure shapes into the cache
/// error kind.
async fn deadline<T>(
    timeout: Duration,
    fut: impl std::future::Future<Output = Result<T, redis::RedisError>>,
) -> ServiceResult<T> {
    match tokio::time::timeout(timeout, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(ServiceError::CacheUnavailable(e.to_string())),
        Err(_) => Err(ServiceError::CacheUnavailable(
            "operation exceeded deadline".to_string(),
        )),
    }
}
