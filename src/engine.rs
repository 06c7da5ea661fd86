use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures_util::StreamExt;
use futures_util::stream;
use regex::Regex;

use crate::alert_state::{AlertStore, StateMachine, write_atomic};
use crate::config::Settings;
use crate::detector::Detector;
use crate::history::HistoryCache;
use crate::models::alert::{AlertMeta, AlertState, AlertStatus, MetricStatus, StatusDoc};
use crate::models::detection::Detection;
use crate::models::metric::{LabelSet, fingerprint, instance_of};
use crate::prom::PrometheusClient;
use crate::receivers::AlertFanout;
use crate::store::{MetricStore, SampleRow};

/// Resolution of the range fetch; one point per cycle at the default cadence.
const RANGE_STEP: &str = "5m";
/// Series below this many retained points are not analyzed.
const MIN_HISTORY: usize = 5;
/// Retained points at which a series graduates from LEARNING to MONITORING.
const MONITORING_THRESHOLD: i64 = 20;
/// Back-off after a failed cycle.
const CYCLE_RETRY: Duration = Duration::from_secs(60);

/// Top-level detection pipeline: discovery → parallel per-query delta sync and
/// detection → single-threaded state commit → status snapshot → prune → sleep.
pub struct DetectionEngine {
    settings: Settings,
    prom: Arc<PrometheusClient>,
    store: Arc<MetricStore>,
    cache: Arc<HistoryCache>,
    detector: Detector,
    machine: StateMachine,
    alerts: AlertStore,
    fanout: Arc<AlertFanout>,
    status_path: PathBuf,
    discovery_pattern: Option<Regex>,
}

impl DetectionEngine {
    pub fn new(
        settings: Settings,
        prom: Arc<PrometheusClient>,
        store: Arc<MetricStore>,
        cache: Arc<HistoryCache>,
        fanout: Arc<AlertFanout>,
        alerts: AlertStore,
        status_path: PathBuf,
    ) -> anyhow::Result<Self> {
        let discovery_pattern = if settings.metric_discovery_enabled {
            Some(Regex::new(&settings.metric_discovery_pattern)?)
        } else {
            None
        };
        let detector = Detector::new(settings.contamination);
        let machine = StateMachine::with_repeat_interval(settings.alert_repeat_interval_minutes);
        Ok(Self {
            settings,
            prom,
            store,
            cache,
            detector,
            machine,
            alerts,
            fanout,
            status_path,
            discovery_pattern,
        })
    }

    /// Hydrate the cache, then run detection cycles forever. A failed cycle is
    /// logged and retried after a short back-off; there is no bail-out path.
    pub async fn run(&self) {
        if let Err(e) = self.cache.initialize(&self.store) {
            tracing::error!("history cache hydration failed: {e}");
        }

        loop {
            tracing::info!("starting anomaly detection cycle");
            let started = Instant::now();
            match self.run_cycle().await {
                Ok(()) => {
                    tracing::info!(
                        "cycle complete in {:.1}s, sleeping {}m",
                        started.elapsed().as_secs_f64(),
                        self.settings.check_interval_minutes
                    );
                    tokio::time::sleep(Duration::from_secs(
                        self.settings.check_interval_minutes * 60,
                    ))
                    .await;
                }
                Err(e) => {
                    tracing::error!("cycle error: {e}");
                    tokio::time::sleep(CYCLE_RETRY).await;
                }
            }
        }
    }

    /// One full detection cycle. Public so the integration tests can drive the
    /// pipeline without the scheduler.
    pub async fn run_cycle(&self) -> anyhow::Result<()> {
        let queries = self.discover_queries().await?;
        tracing::info!("processing {} metric quer(ies)", queries.len());

        let updates: Vec<HashMap<String, Detection>> = stream::iter(queries)
            .map(|query| async move {
                match self.process_query(&query).await {
                    Ok(detections) => detections,
                    Err(e) => {
                        tracing::warn!("metric {query} skipped this cycle: {e}");
                        HashMap::new()
                    }
                }
            })
            .buffer_unordered(self.settings.max_workers.max(1))
            .collect()
            .await;

        // State transitions are applied here, on the orchestrator task only,
        // so per-fingerprint ordering is preserved.
        let mut state = self.alerts.load();
        let now = Utc::now();
        let mut transitions = 0usize;
        for update in updates {
            for (fp, detection) in update {
                if detection.is_anomaly {
                    let window_sum: u8 = state.windows.get(&fp).map(|w| w.iter().sum()).unwrap_or(0);
                    tracing::info!(
                        "[detected] {fp} ({:?}, window {}/{})",
                        detection.reason,
                        window_sum,
                        self.machine.min_anomalies
                    );
                }
                if let Some(status) = self.machine.apply(&mut state, &fp, &detection, now) {
                    transitions += 1;
                    self.dispatch(&fp, status, &detection);
                }
            }
        }
        self.alerts.save(&state)?;
        self.write_status(&state)?;

        let cutoff = now.timestamp() - self.settings.lookback_hours * 3600;
        let pruned = self.store.prune_samples_before(cutoff)?;
        if pruned > 0 {
            tracing::info!("pruned {pruned} samples past the retention window");
        }
        if transitions > 0 {
            tracing::info!("{transitions} alert transition(s) this cycle");
        }
        Ok(())
    }

    /// Metric names for this cycle: the discovery set, or the configured query
    /// when discovery is disabled or came back empty.
    async fn discover_queries(&self) -> anyhow::Result<Vec<String>> {
        if let Some(pattern) = &self.discovery_pattern {
            let names = self.prom.discover_metrics(pattern).await?;
            if !names.is_empty() {
                return Ok(names);
            }
            tracing::warn!("discovery returned no names, falling back to configured query");
        }
        Ok(vec![self.settings.prom_query.clone()])
    }

    /// Process one metric name: enumerate active series, delta-sync their
    /// samples into store and cache, and run detection per series.
    async fn process_query(&self, query: &str) -> anyhow::Result<HashMap<String, Detection>> {
        let now_ts = Utc::now().timestamp();
        let active = self.prom.fetch_instant(query).await?;
        if active.is_empty() {
            return Ok(HashMap::new());
        }

        // One entry per distinct label set; the instant query may return the
        // same series only once, but dedupe anyway.
        let label_sets: HashSet<LabelSet> = active.into_iter().map(|s| s.labels).collect();
        let mut series: Vec<(LabelSet, String, i64)> = Vec::with_capacity(label_sets.len());
        for labels in label_sets {
            let fp = fingerprint(&labels);
            let id = self.store.upsert_metric(
                &fp,
                labels.get("job").map(String::as_str),
                labels.get("instance").map(String::as_str),
            )?;
            series.push((labels, fp, id));
        }

        // Batched delta sync: one range call for the whole name, starting one
        // second past the newest stored sample, then demultiplexed per series.
        let fetch_start = match self.store.max_sample_ts_for_name(query)? {
            Some(ts) => ts + 1,
            None => now_ts - self.settings.lookback_hours * 3600,
        };
        let deltas = self
            .prom
            .fetch_range(query, fetch_start, now_ts, RANGE_STEP)
            .await?;
        let mut delta_map: HashMap<LabelSet, Vec<_>> = deltas
            .into_iter()
            .map(|s| (s.labels, s.samples))
            .collect();

        let mut batch: Vec<SampleRow> = Vec::new();
        let mut new_points: Vec<(i64, Vec<_>)> = Vec::new();
        for (labels, _, id) in &series {
            if let Some(points) = delta_map.remove(labels) {
                if !points.is_empty() {
                    batch.extend(points.iter().map(|p| SampleRow {
                        metric_id: *id,
                        ds: p.ds,
                        y: p.y,
                    }));
                    new_points.push((*id, points));
                }
            }
        }

        // Durability first: if the store rejects the batch the cache is left
        // untouched and the next cycle replays the same delta.
        if !batch.is_empty() {
            let saved = self.store.insert_samples(&batch)?;
            tracing::info!("saved {saved} points for {query}");
        }
        for (id, points) in new_points {
            self.cache.update(id, &points, now_ts);
        }

        let mut detections = HashMap::new();
        for (_, fp, id) in series {
            let history = self.cache.get(id);
            if history.len() >= MIN_HISTORY {
                let detection = self.detector.detect(&history, Some(&fp));
                detections.insert(fp, detection);
            }
        }
        Ok(detections)
    }

    fn dispatch(&self, fp: &str, status: AlertStatus, detection: &Detection) {
        let (subject, description, severity) = match status {
            AlertStatus::Firing => (
                "Anomaly Detected",
                crate::receivers::format::render_alert(fp, detection),
                "critical",
            ),
            AlertStatus::Repeating => (
                "Anomaly Persisting",
                crate::receivers::format::render_alert(fp, detection),
                "critical",
            ),
            AlertStatus::Resolved => (
                "Anomaly Resolved",
                format!("Metric {fp} returned to normal."),
                "info",
            ),
        };
        let meta = AlertMeta {
            instance: instance_of(fp).to_string(),
            severity,
            status,
            summary: detection.explanation.clone(),
        };
        tracing::info!("alert {}: {fp}", status.as_str());
        self.fanout.broadcast(subject, &description, &meta);
    }

    /// Atomically rewrite `status.json` with one row per known metric.
    fn write_status(&self, state: &AlertState) -> anyhow::Result<()> {
        let metrics = self.store.list_metrics()?;
        let counts = self.store.sample_counts()?;
        let rows: Vec<MetricStatus> = metrics
            .into_iter()
            .map(|m| {
                let points = counts.get(&m.id).copied().unwrap_or(0);
                let window = state.windows.get(&m.fingerprint);
                MetricStatus {
                    is_unstable: window.is_some_and(|w| w.iter().any(|&b| b > 0)),
                    is_firing: state.firing.contains_key(&m.fingerprint),
                    points_count: points,
                    stage: if points >= MONITORING_THRESHOLD {
                        "MONITORING"
                    } else {
                        "LEARNING"
                    },
                    fingerprint: m.fingerprint,
                    job: m.job,
                    instance: m.instance,
                }
            })
            .collect();

        let doc = StatusDoc {
            last_run: Utc::now().to_rfc3339(),
            total_series: rows.len(),
            metrics: rows,
        };
        write_atomic(&self.status_path, &serde_json::to_vec_pretty(&doc)?)
    }
}
