use prometheus::{
    Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry,
};
use std::sync::OnceLock;

pub struct AppMetrics {
    pub http_requests_total: IntCounterVec,
    pub redirect_latency_seconds: Histogram,
    pub cache_hits_total: IntCounterVec,
    pub cache_misses_total: IntCounterVec,
    pub tombstone_writes_total: IntCounterVec,
    pub db_reads_total: IntCounter,
    pub db_writes_total: IntCounter,
    pub bus_publish_total: IntCounter,
    pub bus_publish_failed_total: IntCounter,
    pub direct_writes_total: IntCounter,
    pub analytics_dropped_total: IntCounter,
    pub ws_events_total: IntCounter,
    pub rate_limited_total: IntCounterVec,
    pub expired_swept_total: IntCounter,
}

static METRICS: OnceLock<AppMetrics> = OnceLock::new();

pub fn init(registry: &Registry) -> &'static AppMetrics {
    METRICS.get_or_init(|| {
        let http_requests = IntCounterVec::new(
            Opts::new("http_requests_total", "HTTP requests by handler and status"),
            &["handler", "method", "status_code"],
        )
        .unwrap();
        let redirect_latency = Histogram::with_opts(
            HistogramOpts::new(
                "redirect_latency_seconds",
                "Redirect hot-path latency",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0]),
        )
        .unwrap();
        let cache_hits = IntCounterVec::new(
            Opts::new("cache_hits_total", "Cache hits by layer"),
            &["layer"],
        )
        .unwrap();
        let cache_misses = IntCounterVec::new(
            Opts::new("cache_misses_total", "Cache misses by layer"),
            &["layer"],
        )
        .unwrap();
        let tombstones = IntCounterVec::new(
            Opts::new("tombstone_writes_total", "Negative-cache writes by kind"),
            &["kind"],
        )
        .unwrap();
        let db_reads =
            IntCounter::with_opts(Opts::new("db_reads_total", "Store reads")).unwrap();
        let db_writes =
            IntCounter::with_opts(Opts::new("db_writes_total", "Store writes")).unwrap();
        let bus_publish =
            IntCounter::with_opts(Opts::new("bus_publish_total", "Click events published to the bus"))
                .unwrap();
        let bus_publish_failed = IntCounter::with_opts(Opts::new(
            "bus_publish_failed_total",
            "Click events that failed bus publish",
        ))
        .unwrap();
        let direct_writes = IntCounter::with_opts(Opts::new(
            "analytics_direct_writes_total",
            "Click events written by the direct path",
        ))
        .unwrap();
        let dropped = IntCounter::with_opts(Opts::new(
            "analytics_dropped_total",
            "Click events dropped after buffer overflow",
        ))
        .unwrap();
        let ws_events = IntCounter::with_opts(Opts::new(
            "ws_events_total",
            "WebSocket click events dispatched",
        ))
        .unwrap();
        let rate_limited = IntCounterVec::new(
            Opts::new("rate_limited_total", "Requests denied by the limiter"),
            &["tier"],
        )
        .unwrap();
        let swept = IntCounter::with_opts(Opts::new(
            "expired_swept_total",
            "Mappings retired by the expiry sweeper",
        ))
        .unwrap();

        registry.register(Box::new(http_requests.clone())).ok();
        registry.register(Box::new(redirect_latency.clone())).ok();
        registry.register(Box::new(cache_hits.clone())).ok();
        registry.register(Box::new(cache_misses.clone())).ok();
        registry.register(Box::new(tombstones.clone())).ok();
        registry.register(Box::new(db_reads.clone())).ok();
        registry.register(Box::new(db_writes.clone())).ok();
        registry.register(Box::new(bus_publish.clone())).ok();
        registry.register(Box::new(bus_publish_failed.clone())).ok();
        registry.register(Box::new(direct_writes.clone())).ok();
        registry.register(Box::new(dropped.clone())).ok();
        registry.register(Box::new(ws_events.clone())).ok();
        registry.register(Box::new(rate_limited.clone())).ok();
        registry.register(Box::new(swept.clone())).ok();

        AppMetrics {
            http_requests_total: http_requests,
            redirect_latency_seconds: redirect_latency,
            cache_hits_total: cache_hits,
            cache_misses_total: cache_misses,
            tombstone_writes_total: tombstones,
            db_reads_total: db_reads,
            db_writes_total: db_writes,
            bus_publish_total: bus_publish,
            bus_publish_failed_total: bus_publish_failed,
            direct_writes_total: direct_writes,
            analytics_dropped_total: dropped,
            ws_events_total: ws_events,
            rate_limited_total: rate_limited,
            expired_swept_total: swept,
        }
    })
}

pub fn gather(registry: &Registry) -> String {
    use prometheus::Encoder;
    let encoder = prometheus::TextEncoder::new();
    let mut buf = Vec::new();
    encoder.encode(&registry.gather(), &mut buf).unwrap_or_default();
    String::from_utf8(buf).unwrap_or_default()
}
