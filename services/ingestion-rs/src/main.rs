/// Analytics ingestion worker.
///
/// Consumes click events from the `url_clicks` topic, batch-inserts them
/// into `analytics_events` in one transaction, and invalidates the cached
/// daily summaries the batch touched. Offsets commit only after a batch
/// lands, so delivery into the store is at-least-once; the event UUID key
/// makes any replayed rows harmless.
///
/// WebSocket emission is producer-side only; this worker never re-emits.
mod summary;

use std::{collections::HashSet, sync::Arc, time::Duration};

use axum::{routing::get, Router};
use chrono::{DateTime, Utc};
use prometheus::{IntCounter, Registry};
use rdkafka::{
    consumer::{CommitMode, Consumer, StreamConsumer},
    ClientConfig, Message,
};
use redis::{aio::ConnectionManager, AsyncCommands};
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, QueryBuilder};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

// ── Config ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct Config {
    database_url: String,
    redis_url: String,
    kafka_bootstrap_servers: String,
    kafka_click_topic: String,
    consumer_group: String,
    consumer_name: String,
    batch_size: usize,
    flush_interval_ms: u64,
    poll_timeout_ms: u64,
    summary_hour_utc: u32,
    metrics_port: u16,
}

fn evar(key: &str) -> anyhow::Result<String> {
    std::env::var(key).map_err(|_| anyhow::anyhow!("Missing env var: {key}"))
}

fn evar_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn evar_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        Ok(Self {
            database_url: evar("DATABASE_URL")?,
            redis_url: evar("REDIS_URL")?,
            kafka_bootstrap_servers: evar_or("KAFKA_BOOTSTRAP_SERVERS", "kafka:9092"),
            kafka_click_topic: evar_or("KAFKA_CLICK_TOPIC", "url_clicks"),
            consumer_group: evar_or("CONSUMER_GROUP", "analytics-event-consumer"),
            consumer_name: evar_or("CONSUMER_NAME", "analytics-consumer-1"),
            batch_size: evar_parse("CONSUMER_BATCH_SIZE", 1_000),
            flush_interval_ms: evar_parse("CONSUMER_FLUSH_INTERVAL_MS", 2_000),
            poll_timeout_ms: evar_parse("CONSUMER_POLL_TIMEOUT_MS", 250),
            summary_hour_utc: evar_parse("SUMMARY_HOUR_UTC", 0),
            metrics_port: evar_parse("METRICS_PORT", 9200),
        })
    }
}

// ── Models ────────────────────────────────────────────────────────────────────

/// Kafka payload — matches the producer's ClickEvent schema field-for-field.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ClickEvent {
    event_id: Uuid,
    short_code: String,
    clicked_at: DateTime<Utc>,
    ip_address: Option<String>,
    user_agent: Option<String>,
    referrer: Option<String>,
    country_code: Option<String>,
    region: Option<String>,
    city: Option<String>,
    device_type: Option<String>,
    browser: Option<String>,
    os: Option<String>,
}

// ── Metrics ───────────────────────────────────────────────────────────────────

struct WorkerMetrics {
    consumed_total: IntCounter,
    inserted_total: IntCounter,
    dropped_total: IntCounter,
    flush_failures_total: IntCounter,
    summaries_total: IntCounter,
}

fn init_metrics(registry: &Registry) -> WorkerMetrics {
    let consumed =
        IntCounter::new("ingestion_events_consumed_total", "Bus messages consumed").unwrap();
    let inserted =
        IntCounter::new("ingestion_events_inserted_total", "Events written to the store").unwrap();
    let dropped = IntCounter::new(
        "ingestion_events_dropped_total",
        "Events dropped after buffer overflow",
    )
    .unwrap();
    let failures =
        IntCounter::new("ingestion_flush_failures_total", "Failed batch inserts").unwrap();
    let summaries =
        IntCounter::new("ingestion_summaries_total", "Daily summary rows written").unwrap();
    registry.register(Box::new(consumed.clone())).ok();
    registry.register(Box::new(inserted.clone())).ok();
    registry.register(Box::new(dropped.clone())).ok();
    registry.register(Box::new(failures.clone())).ok();
    registry.register(Box::new(summaries.clone())).ok();
    WorkerMetrics {
        consumed_total: consumed,
        inserted_total: inserted,
        dropped_total: dropped,
        flush_failures_total: failures,
        summaries_total: summaries,
    }
}

// ── Store helpers ─────────────────────────────────────────────────────────────

async fn insert_batch(pool: &PgPool, events: &[ClickEvent]) -> anyhow::Result<u64> {
    if events.is_empty() {
        return Ok(0);
    }
    let mut tx = pool.begin().await?;
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
    let written = qb.build().execute(&mut *tx).await?.rows_affected();
    tx.commit().await?;
    Ok(written)
}

/// Drop the cached daily summary for every (code, day) in the batch.
async fn invalidate_summary_keys(conn: &mut ConnectionManager, events: &[ClickEvent]) {
    let keys: HashSet<String> = events
        .iter()
        .map(|e| {
            format!(
                "analytics:summary:{}:{}",
                e.short_code,
                e.clicked_at.date_naive()
            )
        })
        .collect();
    let keys: Vec<String> = keys.into_iter().collect();
    if keys.is_empty() {
        return;
    }
    if let Err(e) = conn.del::<_, ()>(keys).await {
        tracing::warn!(error = %e, "summary cache invalidation failed");
    }
}

// ── Main loop ─────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let config = Config::from_env()?;
    tracing::info!(consumer = %config.consumer_name, "starting ingestion-rs");

    // Prometheus metrics server.
    let registry = Arc::new(Registry::new());
    let metrics = Arc::new(init_metrics(&registry));
    {
        let registry = Arc::clone(&registry);
        let port = config.metrics_port;
        tokio::spawn(async move {
            let app = Router::new().route(
                "/metrics",
                get(move || {
                    let r = Arc::clone(&registry);
                    async move {
                        use prometheus::Encoder;
                        let enc = prometheus::TextEncoder::new();
                        let mut buf = Vec::new();
                        enc.encode(&r.gather(), &mut buf).ok();
                        String::from_utf8(buf).unwrap_or_default()
                    }
                }),
            );
            let addr = format!("0.0.0.0:{port}");
            match tokio::net::TcpListener::bind(&addr).await {
                Ok(listener) => {
                    tracing::info!("metrics server on {addr}");
                    axum::serve(listener, app).await.ok();
                }
                Err(e) => tracing::warn!(error = %e, "metrics server bind failed"),
            }
        });
    }

    // Database pool.
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(&config.database_url)
        .await?;
    tracing::info!("database ready");

    // Redis.
    let redis_client = redis::Client::open(config.redis_url.as_str())?;
    let mut redis_conn = ConnectionManager::new(redis_client).await?;
    tracing::info!("redis ready");

    // Nightly summarizer.
    {
        let pool = pool.clone();
        let metrics = Arc::clone(&metrics);
        let hour = config.summary_hour_utc;
        tokio::spawn(async move {
            summary::run_nightly(pool, metrics, hour).await;
        });
    }

    // Kafka consumer. Offsets are committed manually after a batch lands in
    // the store, never before.
    let consumer: StreamConsumer = ClientConfig::new()
        .set("bootstrap.servers", &config.kafka_bootstrap_servers)
        .set("group.id", &config.consumer_group)
        .set("client.id", &config.consumer_name)
        .set("enable.auto.commit", "false")
        .set("auto.offset.reset", "latest")
        .set("session.timeout.ms", "30000")
        .create()?;
    consumer.subscribe(&[&config.kafka_click_topic])?;
    tracing::info!(topic = %config.kafka_click_topic, "kafka consumer subscribed");

    let flush_interval = Duration::from_millis(config.flush_interval_ms);
    let mut last_flush = std::time::Instant::now();
    let mut pending: Vec<ClickEvent> = Vec::with_capacity(config.batch_size);

    loop {
        // Poll with a short timeout so time-based flushes still fire on an
        // idle topic.
        match tokio::time::timeout(
            Duration::from_millis(config.poll_timeout_ms),
            consumer.recv(),
        )
        .await
        {
            Ok(Ok(msg)) => {
                if let Some(payload) = msg.payload() {
                    match serde_json::from_slice::<ClickEvent>(payload) {
                        Ok(event) => {
                            pending.push(event);
                            metrics.consumed_total.inc();
                        }
                        Err(e) => tracing::warn!(error = %e, "invalid click payload, skipping"),
                    }
                }
            }
            Ok(Err(e)) => tracing::warn!(error = %e, "kafka recv error"),
            Err(_) => {} // poll timeout — fall through to the flush check
        }

        let due = pending.len() >= config.batch_size
            || (!pending.is_empty() && last_flush.elapsed() >= flush_interval);
        if !due {
            continue;
        }

        match insert_batch(&pool, &pending).await {
            Ok(written) => {
                metrics.inserted_total.inc_by(written);
                invalidate_summary_keys(&mut redis_conn, &pending).await;
                if let Err(e) = consumer.commit_consumer_state(CommitMode::Async) {
                    tracing::warn!(error = %e, "offset commit failed");
                }
                tracing::debug!(batch = pending.len(), written, "batch committed");
                pending.clear();
            }
            Err(e) => {
                metrics.flush_failures_total.inc();
                tracing::warn!(batch = pending.len(), error = %e, "batch insert failed, retrying");
                // Keep the batch for the next cycle, bounded by capacity.
                if pending.len() > config.batch_size {
                    let overflow = pending.len() - config.batch_size;
                    pending.drain(..overflow);
                    metrics.dropped_total.inc_by(overflow as u64);
                    tracing::warn!(overflow, "consumer buffer overflow, events dropped");
                }
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
        last_flush = std::time::Instant::now();
    }
}
