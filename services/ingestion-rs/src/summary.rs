//! Nightly roll-up of raw click events into daily and global summaries.
//!
//! The fold is in-memory and pure; only the fetch and the upserts touch
//! the store. Re-running a day simply overwrites the same summary rows.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Timelike, Utc};
use serde_json::json;
use sqlx::{FromRow, PgPool};

use crate::WorkerMetrics;

const TOP_N: usize = 5;

#[derive(Debug, Clone, FromRow)]
pub struct EventRow {
    pub short_code: String,
    pub clicked_at: DateTime<Utc>,
    pub country_code: Option<String>,
    pub referrer: Option<String>,
    pub device_type: Option<String>,
    pub browser: Option<String>,
}

#[derive(Debug, Default, Clone)]
pub struct Rollup {
    pub total: i64,
    pub countries: HashMap<String, i64>,
    pub referrers: HashMap<String, i64>,
    pub devices: HashMap<String, i64>,
    pub browsers: HashMap<String, i64>,
    pub hourly: [i64; 24],
}

impl Rollup {
    pub fn add(&mut self, event: &EventRow) {
        self.total += 1;
        bump(&mut self.countries, event.country_code.as_deref());
        bump(&mut self.referrers, event.referrer.as_deref());
        bump(&mut self.devices, event.device_type.as_deref());
        bump(&mut self.browsers, event.browser.as_deref());
        self.hourly[event.clicked_at.hour() as usize] += 1;
    }

    /// Busiest hour of the day; ties resolve to the earliest hour.
    pub fn peak_hour(&self) -> i32 {
        let mut best = 0usize;
        for (hour, &count) in self.hourly.iter().enumerate() {
            if count > self.hourly[best] {
                best = hour;
            }
        }
        best as i32
    }
}

fn bump(map: &mut HashMap<String, i64>, key: Option<&str>) {
    if let Some(key) = key {
        if !key.is_empty() {
            *map.entry(key.to_string()).or_insert(0) += 1;
        }
    }
}

/// Top-N entries by count, name-ordered within equal counts so the output
/// is deterministic.
pub fn top_n(map: &HashMap<String, i64>, n: usize) -> serde_json::Value {
    let mut entries: Vec<(&String, &i64)> = map.iter().collect();
    entries.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
    json!(entries
        .into_iter()
        .take(n)
        .map(|(name, count)| json!({ "name": name, "count": count }))
        .collect::<Vec<_>>())
}

/// Fold a day's events into per-code roll-ups plus the global one.
pub fn fold_events(rows: &[EventRow]) -> (BTreeMap<String, Rollup>, Rollup) {
    let mut per_code: BTreeMap<String, Rollup> = BTreeMap::new();
    let mut global = Rollup::default();
    for row in rows {
        per_code.entry(row.short_code.clone()).or_default().add(row);
        global.add(row);
    }
    (per_code, global)
}

/// Summarize one UTC day. Returns (summary rows written, events read).
pub async fn summarize_date(pool: &PgPool, date: NaiveDate) -> anyhow::Result<(u64, usize)> {
    let start = Utc
        .from_utc_datetime(&date.and_hms_opt(0, 0, 0).expect("midnight exists"));
    let end = start + chrono::Duration::days(1);

    let rows: Vec<EventRow> = sqlx::query_as(
        "SELECT short_code, clicked_at, country_code, referrer, device_type, browser \
         FROM analytics_events WHERE clicked_at >= $1 AND clicked_at < $2",
    )
    .bind(start)
    .bind(end)
    .fetch_all(pool)
    .await?;

    if rows.is_empty() {
        tracing::info!(%date, "no events to summarize");
        return Ok((0, 0));
    }

    let (per_code, global) = fold_events(&rows);
    let code_count = per_code.len() as i64;
    let mut written = 0u64;

    for (code, rollup) in &per_code {
        sqlx::query(
            "INSERT INTO analytics_daily_summaries \
                 (short_code, date, total_clicks, top_countries, top_referrers, \
                  top_devices, top_browsers, hourly, peak_hour) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
             ON CONFLICT (short_code, date) DO UPDATE SET \
                 total_clicks = EXCLUDED.total_clicks, \
                 top_countries = EXCLUDED.top_countries, \
                 top_referrers = EXCLUDED.top_referrers, \
                 top_devices = EXCLUDED.top_devices, \
                 top_browsers = EXCLUDED.top_browsers, \
                 hourly = EXCLUDED.hourly, \
                 peak_hour = EXCLUDED.peak_hour",
        )
        .bind(code)
        .bind(date)
        .bind(rollup.total)
        .bind(top_n(&rollup.countries, TOP_N))
        .bind(top_n(&rollup.referrers, TOP_N))
        .bind(top_n(&rollup.devices, TOP_N))
        .bind(top_n(&rollup.browsers, TOP_N))
        .bind(json!(rollup.hourly.to_vec()))
        .bind(rollup.peak_hour())
        .execute(pool)
        .await?;
        written += 1;
    }

    sqlx::query(
        "INSERT INTO analytics_global_summaries \
             (date, total_clicks, total_codes, top_countries, top_referrers, \
              top_devices, top_browsers, hourly, peak_hour) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
         ON CONFLICT (date) DO UPDATE SET \
             total_clicks = EXCLUDED.total_clicks, \
             total_codes = EXCLUDED.total_codes, \
             top_countries = EXCLUDED.top_countries, \
             top_referrers = EXCLUDED.top_referrers, \
             top_devices = EXCLUDED.top_devices, \
             top_browsers = EXCLUDED.top_browsers, \
             hourly = EXCLUDED.hourly, \
             peak_hour = EXCLUDED.peak_hour",
    )
    .bind(date)
    .bind(global.total)
    .bind(code_count)
    .bind(top_n(&global.countries, TOP_N))
    .bind(top_n(&global.referrers, TOP_N))
    .bind(top_n(&global.devices, TOP_N))
    .bind(top_n(&global.browsers, TOP_N))
    .bind(json!(global.hourly.to_vec()))
    .bind(global.peak_hour())
    .execute(pool)
    .await?;
    written += 1;

    tracing::info!(%date, events = rows.len(), rows = written, "day summarized");
    Ok((written, rows.len()))
}

/// Sleep-until-due scheduler: runs the previous day's roll-up shortly after
/// `hour_utc` every day.
pub async fn run_nightly(pool: PgPool, metrics: Arc<WorkerMetrics>, hour_utc: u32) {
    loop {
        let wait = until_next_run(Utc::now(), hour_utc);
        tokio::time::sleep(wait).await;

        let yesterday = (Utc::now() - chrono::Duration::days(1)).date_naive();
        match summarize_date(&pool, yesterday).await {
            Ok((written, events)) => {
                metrics.summaries_total.inc_by(written);
                tracing::info!(date = %yesterday, written, events, "nightly roll-up done");
            }
            Err(e) => tracing::warn!(date = %yesterday, error = %e, "nightly roll-up failed"),
        }
    }
}

/// Duration until the next HH:05:00 UTC after `now`.
pub fn until_next_run(now: DateTime<Utc>, hour_utc: u32) -> Duration {
    let today_run = Utc
        .with_ymd_and_hms(now.year(), now.month(), now.day(), hour_utc, 5, 0)
        .single()
        .unwrap_or(now);
    let next = if today_run > now {
        today_run
    } else {
        today_run + chrono::Duration::days(1)
    };
    (next - now).to_std().unwrap_or(Duration::from_secs(60))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(code: &str, hour: u32, country: Option<&str>, browser: Option<&str>) -> EventRow {
        EventRow {
            short_code: code.to_string(),
            clicked_at: Utc
                .with_ymd_and_hms(2026, 7, 31, hour, 30, 0)
                .single()
                .unwrap(),
            country_code: country.map(|s| s.to_string()),
            referrer: None,
            device_type: Some("Desktop".to_string()),
            browser: browser.map(|s| s.to_string()),
        }
    }

    #[test]
    fn fold_splits_per_code_and_global() {
        let rows = vec![
            event("aaa1111", 9, Some("DE"), Some("Chrome")),
            event("aaa1111", 9, Some("DE"), Some("Firefox")),
            event("bbb2222", 14, Some("US"), Some("Chrome")),
        ];
        let (per_code, global) = fold_events(&rows);
        assert_eq!(per_code.len(), 2);
        assert_eq!(per_code["aaa1111"].total, 2);
        assert_eq!(per_code["bbb2222"].total, 1);
        assert_eq!(global.total, 3);
        assert_eq!(global.hourly[9], 2);
        assert_eq!(global.hourly[14], 1);
        assert_eq!(global.countries["DE"], 2);
    }

    #[test]
    fn peak_hour_prefers_earliest_on_ties() {
        let rows = vec![
            event("aaa1111", 3, None, None),
            event("aaa1111", 21, None, None),
        ];
        let (per_code, _) = fold_events(&rows);
        assert_eq!(per_code["aaa1111"].peak_hour(), 3);
    }

    #[test]
    fn top_n_is_count_then_name_ordered() {
        let mut map = HashMap::new();
        map.insert("DE".to_string(), 5i64);
        map.insert("US".to_string(), 9);
        map.insert("AT".to_string(), 5);
        let value = top_n(&map, 2);
        let arr = value.as_array().unwrap();
        assert_eq!(arr.len(), 2);
        assert_eq!(arr[0]["name"], "US");
        assert_eq!(arr[1]["name"], "AT");
    }

    #[test]
    fn missing_fields_do_not_pollute_counts() {
        let rows = vec![event("aaa1111", 1, None, None)];
        let (_, global) = fold_events(&rows);
        assert!(global.countries.is_empty());
        assert!(global.browsers.is_empty());
        assert_eq!(global.devices["Desktop"], 1);
    }

    #[test]
    fn next_run_rolls_to_tomorrow_after_the_window() {
        let now = Utc.with_ymd_and_hms(2026, 7, 31, 0, 10, 0).single().unwrap();
        let wait = until_next_run(now, 0);
        // 23h55m until tomorrow 00:05.
        assert_eq!(wait.as_secs(), 23 * 3600 + 55 * 60);

        let before = Utc.with_ymd_and_hms(2026, 7, 31, 0, 1, 0).single().unwrap();
        assert_eq!(until_next_run(before, 0).as_secs(), 240);
    }
}
