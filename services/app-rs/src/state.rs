use prometheus::Registry;
use std::sync::Arc;

use crate::analytics::ClickPipeline;
use crate::cache::RedisCache;
use crate::config::Config;
use crate::idgen::IdGenerator;
use crate::limiter::RateLimiter;
use crate::metrics::AppMetrics;
use crate::mlcache::MultiLayerCache;
use crate::redirect::RedirectService;
use crate::shortener::ShortenerService;
use crate::store::UrlStore;
use crate::ws::Fanout;

/// Shared application state injected into every handler via the axum State
/// extractor. Services receive their collaborators at construction; this
/// struct only aggregates the finished pieces.
pub struct AppState {
    pub config: Config,
    pub store: Arc<UrlStore>,
    pub redis: RedisCache,
    pub cache: Arc<MultiLayerCache>,
    pub idgen: Arc<IdGenerator>,
    pub limiter: RateLimiter,
    pub shortener: Arc<ShortenerService>,
    pub redirect: Arc<RedirectService>,
    pub pipeline: Arc<ClickPipeline>,
    pub fanout: Arc<Fanout>,
    pub metrics: &'static AppMetrics,
    pub registry: Registry,
}
