//! Click analytics ingestion.
//!
//! One pipeline object serves both delivery paths. A click is enriched
//! from its user agent, emitted to WebSocket subscribers exactly once,
//! then buffered. The buffer flushes to the message bus (normal path) or
//! straight to the store as a multi-row insert (fallback path, chosen at
//! boot when the bus probe fails). Whichever path runs, an event either
//! reaches durable storage or bumps the dropped counter.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use rdkafka::producer::{FutureProducer, FutureRecord};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::cache::{summary_key, RedisCache};
use crate::error::ServiceError;
use crate::metrics::AppMetrics;
use crate::models::ClickEvent;
use crate::store::UrlStore;
use crate::ws::Fanout;

// ── User-agent classification ─────────────────────────────────────────────────

pub fn classify_device(ua: &str) -> &'static str {
    if ua.contains("iphone") || ua.contains("android") || ua.contains("mobile") {
        "Mobile"
    } else if ua.contains("ipad") || ua.contains("tablet") {
        "Tablet"
    } else {
        "Desktop"
    }
}

pub fn classify_browser(ua: &str) -> &'static str {
    if ua.contains("edg") {
        "Edge"
    } else if ua.contains("opera") || ua.contains("opr") {
        "Opera"
    } else if ua.contains("chrome") {
        "Chrome"
    } else if ua.contains("firefox") {
        "Firefox"
    } else if ua.contains("safari") {
        "Safari"
    } else if ua.contains("msie") {
        "IE"
    } else {
        "Other"
    }
}

pub fn classify_os(ua: &str) -> &'static str {
    if ua.contains("windows") {
        "Windows"
    } else if ua.contains("android") {
        "Android"
    } else if ua.contains("iphone") || ua.contains("ipad") || ua.contains("ios") {
        "iOS"
    } else if ua.contains("mac") {
        "macOS"
    } else if ua.contains("linux") {
        "Linux"
    } else {
        "Other"
    }
}

/// Fill device/browser/os from the user agent where the caller left them
/// empty; pre-resolved fields are kept.
pub fn enrich_event(event: &mut ClickEvent) {
    let Some(ref ua) = event.user_agent else {
        return;
    };
    let ua = ua.to_lowercase();
    if event.device_type.is_none() {
        event.device_type = Some(classify_device(&ua).to_string());
    }
    if event.browser.is_none() {
        event.browser = Some(classify_browser(&ua).to_string());
    }
    if event.os.is_none() {
        event.os = Some(classify_os(&ua).to_string());
    }
}

// ── Pipeline ──────────────────────────────────────────────────────────────────

pub enum FlushTarget {
    /// Normal path: publish each event to the click topic.
    Bus {
        producer: FutureProducer,
        topic: String,
        publish_timeout: Duration,
    },
    /// Fallback path: batched multi-row insert straight into the store.
    Direct {
        store: Arc<UrlStore>,
        redis: RedisCache,
    },
}

pub struct ClickPipeline {
    fanout: Arc<Fanout>,
    buffer: Mutex<VecDeque<ClickEvent>>,
    capacity: usize,
    target: FlushTarget,
    metrics: &'static AppMetrics,
}

impl ClickPipeline {
    pub fn new(
        fanout: Arc<Fanout>,
        target: FlushTarget,
        capacity: usize,
        metrics: &'static AppMetrics,
    ) -> Self {
        Self {
            fanout,
            buffer: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            target,
            metrics,
        }
    }

    pub fn mode(&self) -> &'static str {
        match self.target {
            FlushTarget::Bus { .. } => "bus",
            FlushTarget::Direct { .. } => "direct",
        }
    }

    /// Capture one click: enrich, emit the single WebSocket event, enqueue.
    /// The WebSocket emission happens here and only here, so subscribers
    /// see exactly one event per click on either delivery path.
    pub async fn publish_click_event(self: Arc<Self>, mut event: ClickEvent) {
        enrich_event(&mut event);

        match serde_json::to_value(&event) {
            Ok(payload) => {
                let delivered = self.fanout.emit(&event.short_code, &payload);
                self.metrics.ws_events_total.inc_by(delivered as u64);
            }
            Err(e) => tracing::warn!(error = %e, "click event not serializable for fanout"),
        }

        let full = {
            let mut buf = self.buffer.lock().await;
            buf.push_back(event);
            buf.len() >= self.capacity
        };
        if full {
            let pipeline = Arc::clone(&self);
            tokio::spawn(async move { pipeline.flush().await });
        }
    }

    /// Drain the buffer to the flush target. Failed events are re-queued
    /// within capacity; overflow is dropped and counted.
    pub async fn flush(&self) {
        let batch: Vec<ClickEvent> = {
            let mut buf = self.buffer.lock().await;
            buf.drain(..).collect()
        };
        if batch.is_empty() {
            return;
        }

        match &self.target {
            FlushTarget::Bus {
                producer,
                topic,
                publish_timeout,
            } => {
                let mut failed = Vec::new();
                for event in batch {
                    match publish_one(producer, topic, &event, *publish_timeout).await {
                        Ok(()) => self.metrics.bus_publish_total.inc(),
                        Err(e) => {
                            self.metrics.bus_publish_failed_total.inc();
                            tracing::warn!(short_code = %event.short_code, error = %e, "bus publish failed");
                            failed.push(event);
                        }
                    }
                }
                self.requeue(failed).await;
            }
            FlushTarget::Direct { store, redis } => {
                let count = batch.len();
                match store.insert_events(&batch).await {
                    Ok(written) => {
                        self.metrics.direct_writes_total.inc_by(written);
                        tracing::debug!(count, written, "direct analytics batch written");
                        invalidate_summaries(redis, &batch).await;
                    }
                    Err(e) => {
                        tracing::warn!(count, error = %e, "direct analytics write failed");
                        self.requeue(batch).await;
                    }
                }
            }
        }
    }

    async fn requeue(&self, events: Vec<ClickEvent>) {
        if events.is_empty() {
            return;
        }
        let mut dropped: u64 = 0;
        {
            let mut buf = self.buffer.lock().await;
            for event in events {
                if buf.len() < self.capacity {
                    buf.push_back(event);
                } else {
                    dropped += 1;
                }
            }
        }
        if dropped > 0 {
            self.metrics.analytics_dropped_total.inc_by(dropped);
            tracing::warn!(dropped, "analytics buffer overflow, events dropped");
        }
    }

    pub async fn pending(&self) -> usize {
        self.buffer.lock().await.len()
    }

    /// Periodic flush regardless of buffer fill, plus a final drain when the
    /// shutdown token fires.
    pub fn spawn_flush_timer(
        self: Arc<Self>,
        period: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let pipeline = self;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => pipeline.flush().await,
                }
            }
            pipeline.flush().await;
            tracing::info!(mode = pipeline.mode(), "analytics flush timer stopped");
        })
    }
}

async fn publish_one(
    producer: &FutureProducer,
    topic: &str,
    event: &ClickEvent,
    timeout: Duration,
) -> Result<(), ServiceError> {
    let payload = serde_json::to_string(event)
        .map_err(|e| ServiceError::Validation(format!("unencodable click event: {e}")))?;
    let record = FutureRecord::to(topic)
        .payload(&payload)
        .key(&event.short_code);
    producer
        .send(record, timeout)
        .await
        .map_err(|(e, _)| ServiceError::BusUnavailable(e.to_string()))?;
    Ok(())
}

/// Drop cached daily summaries for every (code, day) the batch touched.
async fn invalidate_summaries(redis: &RedisCache, events: &[ClickEvent]) {
    let keys: HashSet<String> = events
        .iter()
        .map(|e| summary_key(&e.short_code, e.clicked_at.date_naive()))
        .collect();
    let keys: Vec<String> = keys.into_iter().collect();
    if let Err(e) = redis.del_many(&keys).await {
        tracing::warn!(error = %e, "summary invalidation failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const IPHONE: &str =
        "mozilla/5.0 (iphone; cpu iphone os 17_0 like mac os x) applewebkit/605.1.15 \
         (khtml, like gecko) version/17.0 mobile/15e148 safari/604.1";
    const DESKTOP_CHROME: &str =
        "mozilla/5.0 (windows nt 10.0; win64; x64) applewebkit/537.36 \
         (khtml, like gecko) chrome/120.0 safari/537.36";
    const EDGE: &str =
        "mozilla/5.0 (windows nt 10.0) applewebkit/537.36 chrome/120.0 safari/537.36 edg/120.0";

    #[test]
    fn devices_follow_substring_rules() {
        assert_eq!(classify_device(IPHONE), "Mobile");
        assert_eq!(classify_device("something with tablet inside"), "Tablet");
        assert_eq!(classify_device(DESKTOP_CHROME), "Desktop");
    }

    #[test]
    fn browser_precedence_edge_before_chrome() {
        assert_eq!(classify_browser(EDGE), "Edge");
        assert_eq!(classify_browser(DESKTOP_CHROME), "Chrome");
        assert_eq!(classify_browser(IPHONE), "Safari");
        assert_eq!(classify_browser("opr/100.0 chrome/x"), "Opera");
        assert_eq!(classify_browser("mozilla/4.0 (msie 8.0)"), "IE");
    }

    #[test]
    fn os_checks_android_before_linux() {
        assert_eq!(classify_os("linux; android 14; pixel"), "Android");
        assert_eq!(classify_os("x11; linux x86_64"), "Linux");
        assert_eq!(classify_os(IPHONE), "iOS");
        assert_eq!(classify_os(DESKTOP_CHROME), "Windows");
        assert_eq!(classify_os("macintosh; intel mac os x"), "macOS");
    }

    #[test]
    fn enrichment_fills_only_missing_fields() {
        let mut event = ClickEvent::new("abc1234");
        event.user_agent = Some(DESKTOP_CHROME.to_string());
        event.browser = Some("PreResolved".to_string());
        enrich_event(&mut event);
        assert_eq!(event.browser.as_deref(), Some("PreResolved"));
        assert_eq!(event.device_type.as_deref(), Some("Desktop"));
        assert_eq!(event.os.as_deref(), Some("Windows"));
    }

    #[test]
    fn enrichment_without_ua_is_a_no_op() {
        let mut event = ClickEvent::new("abc1234");
        enrich_event(&mut event);
        assert!(event.device_type.is_none());
        assert!(event.browser.is_none());
        assert!(event.os.is_none());
    }
}
