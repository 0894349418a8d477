//! In-memory metering aggregation.
//!
//! Six accumulators: total, today, hourly[24], per-channel, per-model,
//! per-api-key. Each cache and its dirty set live under the same lock, and
//! the only store call ever made under a stats lock is the flush of that
//! same lock's data (the daily/hourly rollover). When more than one lock is
//! needed they are taken in the fixed order total → daily → hourly →
//! channel → model → api_key.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use chrono::{Datelike, Local, Timelike};
use tracing::error;

use crate::Result;
use crate::store::{StatsFlush, StatsMetrics, Store};

fn today_yyyymmdd() -> u32 {
    let now = Local::now();
    now.year() as u32 * 10000 + now.month() * 100 + now.day()
}

fn current_hour() -> usize {
    Local::now().hour() as usize
}

#[derive(Default)]
struct TotalSlot {
    metrics: StatsMetrics,
    dirty: bool,
}

#[derive(Default)]
struct DatedSlot {
    date: u32,
    metrics: StatsMetrics,
    dirty: bool,
}

struct KeyedSlots<K> {
    entries: HashMap<K, StatsMetrics>,
    dirty: HashSet<K>,
}

impl<K: std::hash::Hash + Eq + Clone> Default for KeyedSlots<K> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
            dirty: HashSet::new(),
        }
    }
}

impl<K: std::hash::Hash + Eq + Clone> KeyedSlots<K> {
    fn add(&mut self, key: K, metrics: &StatsMetrics) {
        self.entries.entry(key.clone()).or_default().add(metrics);
        self.dirty.insert(key);
    }

    fn drain_dirty(&mut self) -> Vec<(K, StatsMetrics)> {
        let mut out = Vec::with_capacity(self.dirty.len());
        for key in std::mem::take(&mut self.dirty) {
            if let Some(metrics) = self.entries.get(&key) {
                out.push((key, *metrics));
            }
        }
        out
    }
}

pub struct StatsAggregator {
    store: Store,
    total: Mutex<TotalSlot>,
    // The dated windows use async locks so a rollover can flush the stale
    // window to the store before the slot is reset, while holding the lock.
    daily: tokio::sync::Mutex<DatedSlot>,
    hourly: tokio::sync::Mutex<[DatedSlot; 24]>,
    channel: Mutex<KeyedSlots<i64>>,
    model: Mutex<KeyedSlots<String>>,
    api_key: Mutex<KeyedSlots<i64>>,
}

impl StatsAggregator {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            total: Mutex::new(TotalSlot::default()),
            daily: tokio::sync::Mutex::new(DatedSlot {
                date: today_yyyymmdd(),
                ..DatedSlot::default()
            }),
            hourly: tokio::sync::Mutex::new(std::array::from_fn(|_| DatedSlot::default())),
            channel: Mutex::new(KeyedSlots::default()),
            model: Mutex::new(KeyedSlots::default()),
            api_key: Mutex::new(KeyedSlots::default()),
        }
    }

    /// Boot-time warm-up from the durable store.
    pub async fn load(&self) -> Result<()> {
        if let Some(metrics) = self.store.load_stats_total().await? {
            self.total.lock().expect("total lock poisoned").metrics = metrics;
        }
        let today = today_yyyymmdd();
        if let Some(metrics) = self.store.load_stats_daily(today).await? {
            let mut daily = self.daily.lock().await;
            daily.date = today;
            daily.metrics = metrics;
        }
        for (channel_id, metrics) in self.store.load_stats_channels().await? {
            self.channel
                .lock()
                .expect("channel lock poisoned")
                .entries
                .insert(channel_id, metrics);
        }
        Ok(())
    }

    /// Applies one request's metrics to every window. Daily and hourly
    /// windows roll over first when the local date has changed: the stale
    /// window is flushed to the store synchronously, and only then is the
    /// slot reset for the new window, so a crash mid-rollover can never
    /// have discarded unflushed data.
    pub async fn record(
        &self,
        channel_id: i64,
        model: &str,
        api_key_id: i64,
        metrics: &StatsMetrics,
    ) {
        let today = today_yyyymmdd();

        {
            let mut total = self.total.lock().expect("total lock poisoned");
            total.metrics.add(metrics);
            total.dirty = true;
        }

        {
            let mut daily = self.daily.lock().await;
            if daily.date != today {
                if daily.dirty {
                    let stale = StatsFlush {
                        daily: Some((daily.date, daily.metrics)),
                        ..StatsFlush::default()
                    };
                    if let Err(err) = self.store.flush_stats(stale).await {
                        error!(%err, "failed to flush rolled-over daily window");
                    }
                }
                *daily = DatedSlot {
                    date: today,
                    ..DatedSlot::default()
                };
            }
            daily.metrics.add(metrics);
            daily.dirty = true;
        }
        {
            let hour = current_hour();
            let mut hourly = self.hourly.lock().await;
            let slot = &mut hourly[hour];
            if slot.date != today {
                if slot.dirty {
                    let stale = StatsFlush {
                        hourly: vec![(hour as u8, slot.date, slot.metrics)],
                        ..StatsFlush::default()
                    };
                    if let Err(err) = self.store.flush_stats(stale).await {
                        error!(%err, "failed to flush rolled-over hourly window");
                    }
                }
                hourly[hour] = DatedSlot {
                    date: today,
                    ..DatedSlot::default()
                };
            }
            let slot = &mut hourly[hour];
            slot.metrics.add(metrics);
            slot.dirty = true;
        }

        if channel_id != 0 {
            self.channel
                .lock()
                .expect("channel lock poisoned")
                .add(channel_id, metrics);
        }
        if !model.is_empty() {
            self.model
                .lock()
                .expect("model lock poisoned")
                .add(model.to_string(), metrics);
        }
        if api_key_id != 0 {
            self.api_key
                .lock()
                .expect("api key lock poisoned")
                .add(api_key_id, metrics);
        }
    }

    /// Collects every dirty entry and clears the flags. Lock order: total →
    /// daily → hourly → channel → model → api_key.
    async fn snapshot(&self) -> StatsFlush {
        let mut flush = StatsFlush::default();
        {
            let mut total = self.total.lock().expect("total lock poisoned");
            if total.dirty {
                flush.total = Some(total.metrics);
                total.dirty = false;
            }
        }
        {
            let mut daily = self.daily.lock().await;
            if daily.dirty {
                flush.daily = Some((daily.date, daily.metrics));
                daily.dirty = false;
            }
        }
        {
            let mut hourly = self.hourly.lock().await;
            for (hour, slot) in hourly.iter_mut().enumerate() {
                if slot.dirty {
                    flush.hourly.push((hour as u8, slot.date, slot.metrics));
                    slot.dirty = false;
                }
            }
        }
        flush.channels = self
            .channel
            .lock()
            .expect("channel lock poisoned")
            .drain_dirty();
        flush.models = self.model.lock().expect("model lock poisoned").drain_dirty();
        flush.api_keys = self
            .api_key
            .lock()
            .expect("api key lock poisoned")
            .drain_dirty();
        flush
    }

    /// One flush pass: upserts every dirty entry to the store.
    pub async fn flush(&self) -> Result<()> {
        let flush = self.snapshot().await;
        if flush.is_empty() {
            return Ok(());
        }
        self.store.flush_stats(flush).await?;
        Ok(())
    }

    pub fn total(&self) -> StatsMetrics {
        self.total.lock().expect("total lock poisoned").metrics
    }

    pub async fn today(&self) -> StatsMetrics {
        self.daily.lock().await.metrics
    }

    pub fn channel(&self, id: i64) -> StatsMetrics {
        self.channel
            .lock()
            .expect("channel lock poisoned")
            .entries
            .get(&id)
            .copied()
            .unwrap_or_default()
    }

    pub fn model(&self, name: &str) -> StatsMetrics {
        self.model
            .lock()
            .expect("model lock poisoned")
            .entries
            .get(name)
            .copied()
            .unwrap_or_default()
    }

    pub fn api_key(&self, id: i64) -> StatsMetrics {
        self.api_key
            .lock()
            .expect("api key lock poisoned")
            .entries
            .get(&id)
            .copied()
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(input: i64, output: i64, success: bool) -> StatsMetrics {
        StatsMetrics {
            input_tokens: input,
            output_tokens: output,
            input_cost: input as f64 * 1e-6,
            output_cost: output as f64 * 2e-6,
            wait_time_ms: 100,
            request_success: i64::from(success),
            request_failed: i64::from(!success),
        }
    }

    async fn aggregator() -> (tempfile::TempDir, StatsAggregator) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Store::new(dir.path().join("stats.db"));
        store.init().await.expect("init");
        (dir, StatsAggregator::new(store))
    }

    #[tokio::test]
    async fn total_is_sum_of_per_request_metrics() {
        let (_dir, stats) = aggregator().await;
        for i in 0..5 {
            stats.record(1, "gpt-4o", 9, &sample(100 + i, 10, true)).await;
        }
        let total = stats.total();
        assert_eq!(total.input_tokens, 510);
        assert_eq!(total.output_tokens, 50);
        assert_eq!(total.request_success, 5);
        assert_eq!(stats.channel(1).input_tokens, 510);
        assert_eq!(stats.model("gpt-4o").input_tokens, 510);
        assert_eq!(stats.api_key(9).input_tokens, 510);
    }

    #[tokio::test]
    async fn failures_count_separately_from_successes() {
        let (_dir, stats) = aggregator().await;
        stats.record(1, "gpt-4o", 0, &sample(10, 0, true)).await;
        stats.record(1, "gpt-4o", 0, &sample(0, 0, false)).await;
        let channel = stats.channel(1);
        assert_eq!(channel.request_success, 1);
        assert_eq!(channel.request_failed, 1);
    }

    #[tokio::test]
    async fn flush_persists_and_clears_dirty_flags() {
        let (_dir, stats) = aggregator().await;
        stats.record(3, "claude-3-5-sonnet", 0, &sample(50, 5, true)).await;
        stats.flush().await.expect("flush");

        let persisted = stats
            .store
            .load_stats_total()
            .await
            .expect("load")
            .expect("row");
        assert_eq!(persisted.input_tokens, 50);

        // No dirty entries remain, so the next flush writes nothing.
        let flush = stats.snapshot().await;
        assert!(flush.is_empty());
    }

    #[tokio::test]
    async fn daily_rollover_flushes_stale_window_before_reset() {
        let (_dir, stats) = aggregator().await;

        // Seed yesterday's window directly, as if the process had crossed
        // midnight with unflushed data.
        let yesterday = 20260801;
        {
            let mut daily = stats.daily.lock().await;
            daily.date = yesterday;
            daily.metrics = sample(40, 4, true);
            daily.dirty = true;
        }

        stats.record(1, "gpt-4o", 0, &sample(10, 1, true)).await;

        // The stale window reached the store during the rollover itself.
        let persisted = stats
            .store
            .load_stats_daily(yesterday)
            .await
            .expect("load")
            .expect("stale row");
        assert_eq!(persisted.input_tokens, 40);

        // The fresh window holds only the new request.
        let today = stats.today().await;
        assert_eq!(today.input_tokens, 10);
    }

    #[tokio::test]
    async fn boot_load_restores_persisted_totals() {
        let (_dir, stats) = aggregator().await;
        stats.record(1, "m", 0, &sample(10, 1, true)).await;
        stats.flush().await.expect("flush");

        let fresh = StatsAggregator::new(stats.store.clone());
        fresh.load().await.expect("load");
        assert_eq!(fresh.total().input_tokens, 10);
        assert_eq!(fresh.today().await.input_tokens, 10);
        assert_eq!(fresh.channel(1).input_tokens, 10);
    }
}
