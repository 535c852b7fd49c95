use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use crate::config::Config;

pub async fn create_pool(config: &Config) -> anyhow::Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.db_pool_max)
        .min_connections(config.db_pool_min)
        .acquire_timeout(Duration::from_millis(config.db_connect_timeout_ms))
        .idle_timeout(Duration::from_millis(config.db_idle_timeout_ms))
        .connect(&config.database_url)
        .await?;
    Ok(pool)
}

const MIGRATIONS: &[(&str, &str)] = &[
    (
        "0001_users",
        r#"
        CREATE TABLE IF NOT EXISTS users (
            id                  UUID PRIMARY KEY,
            email               TEXT NOT NULL UNIQUE,
            duplicate_strategy  TEXT NOT NULL DEFAULT 'generate_new',
            default_expiry_days INTEGER,
            tier                TEXT NOT NULL DEFAULT 'standard',
            created_at          TIMESTAMPTZ NOT NULL DEFAULT now()
        )
        "#,
    ),
    (
        "0002_url_mappings",
        r#"
        CREATE TABLE IF NOT EXISTS url_mappings (
            id               BIGSERIAL PRIMARY KEY,
            short_code       VARCHAR(30) NOT NULL,
            long_url         TEXT NOT NULL,
            long_url_hash    BYTEA NOT NULL,
            user_id          UUID REFERENCES users(id),
            is_custom_alias  BOOLEAN NOT NULL DEFAULT FALSE,
            created_at       TIMESTAMPTZ NOT NULL DEFAULT now(),
            last_accessed_at TIMESTAMPTZ,
            expires_at       TIMESTAMPTZ,
            deleted_at       TIMESTAMPTZ,
            access_count     BIGINT NOT NULL DEFAULT 0,
            is_deleted       BOOLEAN NOT NULL DEFAULT FALSE
        )
        "#,
    ),
    (
        "0003_url_mappings_indexes",
        r#"
        CREATE UNIQUE INDEX IF NOT EXISTS idx_url_mappings_short_code_live
            ON url_mappings (short_code) WHERE NOT is_deleted;
        CREATE INDEX IF NOT EXISTS idx_url_mappings_hash_user
            ON url_mappings (long_url_hash, user_id) WHERE NOT is_deleted;
        CREATE INDEX IF NOT EXISTS idx_url_mappings_expires
            ON url_mappings (expires_at) WHERE NOT is_deleted AND expires_at IS NOT NULL
        "#,
    ),
    (
        "0004_id_counter",
        r#"
        CREATE TABLE IF NOT EXISTS id_counter (
            name       TEXT PRIMARY KEY,
            next_value BIGINT NOT NULL DEFAULT 1
        )
        "#,
    ),
    (
        "0005_analytics_events",
        r#"
        CREATE TABLE IF NOT EXISTS analytics_events (
            event_id     UUID PRIMARY KEY,
            short_code   VARCHAR(30) NOT NULL,
            clicked_at   TIMESTAMPTZ NOT NULL,
            ip_address   TEXT,
            user_agent   TEXT,
            referrer     TEXT,
            country_code TEXT,
            region       TEXT,
            city         TEXT,
            device_type  TEXT,
            browser      TEXT,
            os           TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_analytics_events_code_time
            ON analytics_events (short_code, clicked_at)
        "#,
    ),
    (
        "0006_analytics_summaries",
        r#"
        CREATE TABLE IF NOT EXISTS analytics_daily_summaries (
            short_code    VARCHAR(30) NOT NULL,
            date          DATE NOT NULL,
            total_clicks  BIGINT NOT NULL DEFAULT 0,
            top_countries JSONB NOT NULL DEFAULT '[]',
            top_referrers JSONB NOT NULL DEFAULT '[]',
            top_devices   JSONB NOT NULL DEFAULT '[]',
            top_browsers  JSONB NOT NULL DEFAULT '[]',
            hourly        JSONB NOT NULL DEFAULT '[]',
            peak_hour     INTEGER NOT NULL DEFAULT 0,
            UNIQUE (short_code, date)
        );
        CREATE TABLE IF NOT EXISTS analytics_global_summaries (
            date          DATE NOT NULL UNIQUE,
            total_clicks  BIGINT NOT NULL DEFAULT 0,
            total_codes   BIGINT NOT NULL DEFAULT 0,
            top_countries JSONB NOT NULL DEFAULT '[]',
            top_referrers JSONB NOT NULL DEFAULT '[]',
            top_devices   JSONB NOT NULL DEFAULT '[]',
            top_browsers  JSONB NOT NULL DEFAULT '[]',
            hourly        JSONB NOT NULL DEFAULT '[]',
            peak_hour     INTEGER NOT NULL DEFAULT 0
        )
        "#,
    ),
];

/// Run DDL migrations, recording applied versions in schema_migrations.
///
/// An advisory lock serializes DDL when several replicas start at once.
pub async fn migrate(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::query("SELECT pg_advisory_lock(730551)")
        .execute(pool)
        .await?;

    let result = apply_migrations(pool).await;

    sqlx::query("SELECT pg_advisory_unlock(730551)")
        .execute(pool)
        .await?;

    result
}

async fn apply_migrations(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_migrations (
            version    TEXT PRIMARY KEY,
            applied_at TIMESTAMPTZ NOT NULL DEFAULT now()
        )
        "#,
    )
    .execute(pool)
    .await?;

    for &(version, ddl) in MIGRATIONS {
        let applied: Option<(String,)> =
            sqlx::query_as("SELECT version FROM schema_migrations WHERE version = $1")
                .bind(version)
                .fetch_optional(pool)
                .await?;
        if applied.is_some() {
            continue;
        }

        for statement in ddl.split(';').filter(|s| !s.trim().is_empty()) {
            sqlx::query(statement).execute(pool).await?;
        }
        sqlx::query("INSERT INTO schema_migrations (version) VALUES ($1)")
            .bind(version)
            .execute(pool)
            .await?;
        tracing::info!(version, "applied migration");
    }

    // Seed the mapping counter so the first range reservation finds a row.
    sqlx::query("INSERT INTO id_counter (name, next_value) VALUES ($1, 1) ON CONFLICT DO NOTHING")
        .bind("url_mappings")
        .execute(pool)
        .await?;

    Ok(())
}
