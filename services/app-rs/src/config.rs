/// All configuration loaded from environment variables.
///
/// Every recognized option has a default apart from DATABASE_URL and
/// REDIS_URL, which must point somewhere real.
#[derive(Debug, Clone)]
pub struct Config {
    pub app_name: String,
    pub app_env: String,
    pub base_url: String,
    pub host: String,
    pub port: u16,

    pub database_url: String,
    pub db_pool_min: u32,
    pub db_pool_max: u32,
    pub db_connect_timeout_ms: u64,
    pub db_idle_timeout_ms: u64,
    pub db_statement_timeout_ms: u64,

    pub redis_url: String,
    pub cache_op_timeout_ms: u64,
    pub cache_url_ttl_seconds: u64,
    pub cache_summary_ttl_seconds: u64,

    pub lru_capacity: usize,
    pub lru_ttl_seconds: u64,
    pub cache_warmup_count: i64,

    pub kafka_bootstrap_servers: String,
    pub kafka_client_id: String,
    pub kafka_click_topic: String,
    pub kafka_partitions: i32,
    pub kafka_replication_factor: i32,
    pub bus_publish_timeout_ms: u64,
    pub bus_connect_timeout_ms: u64,

    pub access_secret: String,

    pub rate_limit_window_seconds: i64,
    pub rate_limit_max_anonymous: i64,
    pub rate_limit_max_standard: i64,
    pub rate_limit_max_premium: i64,
    pub rate_limit_max_enterprise: i64,
    pub rate_limit_max_strict: i64,

    pub counter_batch_size: i64,
    pub counter_name: String,
    pub min_code_length: usize,
    pub generation_max_retries: u32,
    pub hash_max_retries: u32,

    pub sweep_interval_seconds: u64,
    pub sweep_batch_size: i64,
    pub expired_tombstone_ttl_seconds: u64,

    pub analytics_buffer_max: usize,
    pub analytics_flush_interval_ms: u64,

    pub shutdown_drain_seconds: u64,
    pub redirect_slo_ms: u64,
}

fn env(key: &str) -> anyhow::Result<String> {
    std::env::var(key).map_err(|_| anyhow::anyhow!("Missing env var: {key}"))
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        Ok(Self {
            app_name: env_or("APP_NAME", "shortly"),
            app_env: env_or("APP_ENV", "development"),
            base_url: env_or("BASE_URL", "https://short.ly"),
            host: env_or("HOST", "0.0.0.0"),
            port: env_parse("PORT", 8080),

            database_url: env("DATABASE_URL")?,
            db_pool_min: env_parse("DB_POOL_MIN", 2),
            db_pool_max: env_parse("DB_POOL_MAX", 20),
            db_connect_timeout_ms: env_parse("DB_CONNECT_TIMEOUT_MS", 5_000),
            db_idle_timeout_ms: env_parse("DB_IDLE_TIMEOUT_MS", 600_000),
            db_statement_timeout_ms: env_parse("DB_STATEMENT_TIMEOUT_MS", 2_000),

            redis_url: env("REDIS_URL")?,
            cache_op_timeout_ms: env_parse("CACHE_OP_TIMEOUT_MS", 500),
            cache_url_ttl_seconds: env_parse("CACHE_URL_TTL_SECONDS", 3_600),
            cache_summary_ttl_seconds: env_parse("CACHE_SUMMARY_TTL_SECONDS", 86_400),

            lru_capacity: env_parse("LRU_CAPACITY", 10_000),
            lru_ttl_seconds: env_parse("LRU_TTL_SECONDS", 300),
            cache_warmup_count: env_parse("CACHE_WARMUP_COUNT", 100),

            kafka_bootstrap_servers: env_or("KAFKA_BOOTSTRAP_SERVERS", "kafka:9092"),
            kafka_client_id: env_or("KAFKA_CLIENT_ID", "shortly-app"),
            kafka_click_topic: env_or("KAFKA_CLICK_TOPIC", "url_clicks"),
            kafka_partitions: env_parse("KAFKA_PARTITIONS", 6),
            kafka_replication_factor: env_parse("KAFKA_REPLICATION_FACTOR", 1),
            bus_publish_timeout_ms: env_parse("BUS_PUBLISH_TIMEOUT_MS", 5_000),
            bus_connect_timeout_ms: env_parse("BUS_CONNECT_TIMEOUT_MS", 3_000),

            access_secret: env_or("ACCESS_SECRET", "dev-access-secret"),

            rate_limit_window_seconds: env_parse("RATE_LIMIT_WINDOW_SECONDS", 60),
            rate_limit_max_anonymous: env_parse("RATE_LIMIT_MAX_ANONYMOUS", 100),
            rate_limit_max_standard: env_parse("RATE_LIMIT_MAX_STANDARD", 1_000),
            rate_limit_max_premium: env_parse("RATE_LIMIT_MAX_PREMIUM", 5_000),
            rate_limit_max_enterprise: env_parse("RATE_LIMIT_MAX_ENTERPRISE", 20_000),
            rate_limit_max_strict: env_parse("RATE_LIMIT_MAX_STRICT", 10),

            counter_batch_size: env_parse("ID_COUNTER_BATCH_SIZE", 10_000),
            counter_name: env_or("ID_COUNTER_NAME", "url_mappings"),
            min_code_length: env_parse("MIN_CODE_LENGTH", 7),
            generation_max_retries: env_parse("GENERATION_MAX_RETRIES", 3),
            hash_max_retries: env_parse("HASH_MAX_RETRIES", 5),

            sweep_interval_seconds: env_parse("EXPIRY_SWEEP_INTERVAL_SECONDS", 60),
            sweep_batch_size: env_parse("EXPIRY_SWEEP_BATCH_SIZE", 500),
            expired_tombstone_ttl_seconds: env_parse("EXPIRED_TOMBSTONE_TTL_SECONDS", 604_800),

            analytics_buffer_max: env_parse("ANALYTICS_BUFFER_MAX", 1_000),
            analytics_flush_interval_ms: env_parse("ANALYTICS_FLUSH_INTERVAL_MS", 1_000),

            shutdown_drain_seconds: env_parse("SHUTDOWN_DRAIN_SECONDS", 30),
            redirect_slo_ms: env_parse("REDIRECT_SLO_MS", 50),
        })
    }
}
