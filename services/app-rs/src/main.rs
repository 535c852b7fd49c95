mod allocator;
mod analytics;
mod auth;
mod base62;
mod cache;
mod config;
mod db;
mod enums;
mod error;
mod handlers;
mod hashgen;
mod idgen;
mod kafka;
mod limiter;
mod lru_cache;
mod metrics;
mod mlcache;
mod models;
mod redirect;
mod shortener;
mod state;
mod store;
mod sweeper;
mod validate;
mod ws;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    middleware,
    routing::{delete, get, post},
    Router,
};
use prometheus::Registry;
use tokio_util::sync::CancellationToken;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::analytics::{ClickPipeline, FlushTarget};
use crate::cache::RedisCache;
use crate::lru_cache::MemoryCache;
use crate::mlcache::MultiLayerCache;
use crate::state::AppState;
use crate::store::UrlStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let config = config::Config::from_env()?;
    tracing::info!(app = %config.app_name, env = %config.app_env, "starting app-rs");

    // Database
    let pool = db::create_pool(&config).await?;
    db::migrate(&pool).await?;
    let store = Arc::new(UrlStore::new(
        pool.clone(),
        Duration::from_millis(config.db_statement_timeout_ms),
    ));
    tracing::info!("database ready");

    // Redis
    let redis = RedisCache::connect(
        &config.redis_url,
        Duration::from_millis(config.cache_op_timeout_ms),
    )
    .await?;
    tracing::info!("redis ready");

    // Prometheus
    let registry = Registry::new();
    let app_metrics = metrics::init(&registry);

    // Multi-layer cache
    let memory = MemoryCache::new(
        config.lru_capacity,
        Duration::from_secs(config.lru_ttl_seconds),
        Duration::from_secs(300),
    );
    let cache = Arc::new(MultiLayerCache::new(
        memory,
        redis.clone(),
        Arc::clone(&store),
        app_metrics,
        config.cache_url_ttl_seconds,
        config.expired_tombstone_ttl_seconds,
    ));

    // Pre-warm with the most-accessed live mappings.
    if config.cache_warmup_count > 0 {
        match store.fetch_popular(config.cache_warmup_count).await {
            Ok(popular) => cache.warm_up(&popular).await,
            Err(e) => tracing::warn!(error = %e, "cache warm-up skipped"),
        }
    }

    // Id generation
    let allocator = Arc::new(allocator::CounterAllocator::new(
        Arc::clone(&store),
        config.counter_name.clone(),
        config.counter_batch_size,
    ));
    if let Err(e) = allocator.pre_allocate().await {
        tracing::warn!(error = %e, "allocator pre-allocation failed, hash fallback stays available");
    }
    let idgen = Arc::new(idgen::IdGenerator::new(
        Arc::clone(&allocator),
        hashgen::HashIdGenerator::new(Arc::clone(&store), config.hash_max_retries),
        Arc::clone(&store),
        config.min_code_length,
    ));

    // Analytics path selection: a single bus probe at boot decides between
    // the producer and the direct store writer. A running process never
    // switches paths on its own.
    let fanout = Arc::new(ws::Fanout::new());
    let bus_up = kafka::probe_bus(
        &config.kafka_bootstrap_servers,
        Duration::from_millis(config.bus_connect_timeout_ms),
    )
    .await;
    let target = if bus_up {
        kafka::ensure_click_topic(
            &config.kafka_bootstrap_servers,
            &config.kafka_click_topic,
            config.kafka_partitions,
            config.kafka_replication_factor,
        )
        .await
        .unwrap_or_else(|e| tracing::warn!(error = %e, "click topic provisioning failed"));
        let producer =
            kafka::create_producer(&config.kafka_bootstrap_servers, &config.kafka_client_id)?;
        tracing::info!("analytics path: message bus");
        FlushTarget::Bus {
            producer,
            topic: config.kafka_click_topic.clone(),
            publish_timeout: Duration::from_millis(config.bus_publish_timeout_ms),
        }
    } else {
        tracing::warn!("message bus unreachable at boot, analytics path: direct store writer");
        FlushTarget::Direct {
            store: Arc::clone(&store),
            redis: redis.clone(),
        }
    };
    let pipeline = Arc::new(ClickPipeline::new(
        Arc::clone(&fanout),
        target,
        config.analytics_buffer_max,
        app_metrics,
    ));

    // Services
    let shortener = Arc::new(shortener::ShortenerService::new(
        Arc::clone(&store),
        Arc::clone(&cache),
        Arc::clone(&idgen),
        config.base_url.clone(),
        config.generation_max_retries,
    ));
    let redirect = Arc::new(redirect::RedirectService::new(
        Arc::clone(&cache),
        Arc::clone(&store),
        Arc::clone(&pipeline),
        app_metrics,
        Duration::from_millis(config.redirect_slo_ms),
    ));

    // Background workers
    let shutdown = CancellationToken::new();
    let flush_task = Arc::clone(&pipeline).spawn_flush_timer(
        Duration::from_millis(config.analytics_flush_interval_ms),
        shutdown.clone(),
    );
    let sweeper = sweeper::ExpirySweeper::new(
        Arc::clone(&store),
        Arc::clone(&cache),
        app_metrics,
        Duration::from_secs(config.sweep_interval_seconds),
        config.sweep_batch_size,
        Duration::from_secs(config.expired_tombstone_ttl_seconds),
    );
    let sweeper_task = sweeper.spawn(shutdown.clone());

    // Shared state
    let limiter = limiter::RateLimiter::new(
        redis.clone(),
        config.rate_limit_window_seconds,
        config.rate_limit_max_anonymous,
        config.rate_limit_max_standard,
        config.rate_limit_max_premium,
        config.rate_limit_max_enterprise,
        config.rate_limit_max_strict,
    );
    let addr = format!("{}:{}", config.host, config.port);
    let drain = Duration::from_secs(config.shutdown_drain_seconds);
    let state = Arc::new(AppState {
        config,
        store,
        redis,
        cache,
        idgen,
        limiter,
        shortener,
        redirect,
        pipeline: Arc::clone(&pipeline),
        fanout,
        metrics: app_metrics,
        registry,
    });

    // Router
    let app = Router::new()
        .route("/health", get(handlers::health))
        .route("/ready", get(handlers::ready))
        .route("/live", get(handlers::live))
        .route("/metrics", get(handlers::metrics))
        .route("/api/v1/url/shorten", post(handlers::shorten))
        .route("/api/v1/url/shorten/bulk", post(handlers::shorten_bulk))
        .route("/api/v1/url/resolve/:short_code", get(handlers::resolve))
        .route("/api/v1/url/:short_code/stats", get(handlers::url_stats))
        .route("/api/v1/url/:short_code", delete(handlers::delete_url))
        .route("/api/v1/analytics/live/:short_code", get(ws::live_clicks))
        .route(
            "/api/v1/analytics/:short_code/summary",
            get(handlers::daily_summary),
        )
        .route("/api/v1/idgen/status", get(handlers::idgen_status))
        .route("/api/v1/system/stats", get(handlers::system_stats))
        .route("/:short_code", get(handlers::redirect))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            limiter::rate_limit_middleware,
        ))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::clone(&state));

    tracing::info!(%addr, "listening");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    // In-flight requests are drained by axum; now stop the workers, flush
    // what the pipeline still holds, and close the backends.
    tracing::info!("draining background workers");
    shutdown.cancel();
    if tokio::time::timeout(drain, async {
        let _ = flush_task.await;
        let _ = sweeper_task.await;
    })
    .await
    .is_err()
    {
        let pending = pipeline.pending().await;
        tracing::warn!(pending, "drain window elapsed before workers finished");
    }
    pool.close().await;
    tracing::info!("shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("termination signal received");
}
