use std::collections::HashMap;
use std::sync::RwLock;

use chrono::Utc;

use crate::models::metric::SamplePoint;
use crate::store::MetricStore;

/// Hydration page size, matching the store's chunked load.
const CHUNK_ROWS: usize = 500_000;

/// In-memory history per metric id, bounded by the analysis window. Hydrated
/// once at startup and kept current by the per-cycle delta sync, so detection
/// never reads the durable store.
pub struct HistoryCache {
    entries: RwLock<HashMap<i64, Vec<SamplePoint>>>,
    window_hours: i64,
}

impl HistoryCache {
    pub fn new(window_hours: i64) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            window_hours,
        }
    }

    /// Pre-load everything inside the analysis window from the durable store,
    /// in bounded pages, then sort each series by timestamp.
    pub fn initialize(&self, store: &MetricStore) -> anyhow::Result<()> {
        let cutoff = Utc::now().timestamp() - self.window_hours * 3600;
        tracing::info!(
            "history cache: loading {}h of samples into memory",
            self.window_hours
        );

        let mut total = 0usize;
        let mut offset = 0usize;
        loop {
            let page = store.samples_since(cutoff, CHUNK_ROWS, offset)?;
            if page.is_empty() {
                break;
            }
            let page_len = page.len();
            let mut entries = self.entries.write().unwrap();
            for (metric_id, point) in page {
                entries.entry(metric_id).or_default().push(point);
            }
            drop(entries);
            total += page_len;
            offset += page_len;
            tracing::info!("history cache: loaded {total} rows...");
            if page_len < CHUNK_ROWS {
                break;
            }
        }

        let mut entries = self.entries.write().unwrap();
        for points in entries.values_mut() {
            points.sort_by_key(|p| p.ds);
        }
        tracing::info!(
            "history cache: {total} points across {} series",
            entries.len()
        );
        Ok(())
    }

    /// Ordered history for one metric; empty when the series is unknown.
    pub fn get(&self, metric_id: i64) -> Vec<SamplePoint> {
        self.entries
            .read()
            .unwrap()
            .get(&metric_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Append the delta, skipping points at or before the current tail so the
    /// boundary overlap of a replayed sync is a no-op, then drop the prefix
    /// that fell outside the window.
    pub fn update(&self, metric_id: i64, delta: &[SamplePoint], now_ts: i64) {
        if delta.is_empty() {
            return;
        }
        let mut entries = self.entries.write().unwrap();
        let points = entries.entry(metric_id).or_default();

        let last = points.last().map(|p| p.ds);
        points.extend(
            delta
                .iter()
                .filter(|p| last.is_none_or(|l| p.ds > l))
                .copied(),
        );

        let cutoff = now_ts - self.window_hours * 3600;
        if points.first().is_some_and(|p| p.ds < cutoff) {
            points.retain(|p| p.ds >= cutoff);
        }
    }
}
