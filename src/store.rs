use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use rusqlite::{Connection, TransactionBehavior, params};

use crate::models::metric::{Metric, SamplePoint};

/// One sample row queued for insertion.
#[derive(Debug, Clone, Copy)]
pub struct SampleRow {
    pub metric_id: i64,
    pub ds: i64,
    pub y: f64,
}

/// Durable store for metrics and their samples: SQLite in WAL mode behind a
/// fixed-size pool of connections handed out round-robin, so concurrent
/// worker tasks read in parallel and writers queue on the busy timeout rather
/// than on one process-wide lock.
pub struct MetricStore {
    pool: Vec<Mutex<Connection>>,
    next: AtomicUsize,
}

impl MetricStore {
    /// Open the store with `pool_size` connections (floored at 1). Callers
    /// size this at `MAX_WORKERS` plus headroom.
    pub fn open(path: &str, pool_size: usize) -> anyhow::Result<Self> {
        let mut pool = Vec::with_capacity(pool_size.max(1));
        for _ in 0..pool_size.max(1) {
            let conn = Connection::open(path)?;
            conn.execute_batch(
                "PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON; PRAGMA busy_timeout=5000;",
            )?;
            pool.push(Mutex::new(conn));
        }
        let store = Self {
            pool,
            next: AtomicUsize::new(0),
        };
        store.run_migrations()?;
        Ok(store)
    }

    /// Next pooled connection, round-robin.
    fn conn(&self) -> MutexGuard<'_, Connection> {
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.pool.len();
        self.pool[idx].lock().unwrap()
    }

    fn run_migrations(&self) -> anyhow::Result<()> {
        let conn = self.conn();
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS metrics (
                id           INTEGER PRIMARY KEY AUTOINCREMENT,
                fingerprint  TEXT NOT NULL UNIQUE,
                job          TEXT,
                instance     TEXT,
                last_updated TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ','now'))
            );

            CREATE TABLE IF NOT EXISTS metric_samples (
                id        INTEGER PRIMARY KEY AUTOINCREMENT,
                metric_id INTEGER NOT NULL REFERENCES metrics(id) ON DELETE CASCADE,
                timestamp INTEGER NOT NULL,
                value     REAL
            );
            CREATE INDEX IF NOT EXISTS idx_samples_metric_ts ON metric_samples(metric_id, timestamp);
            ",
        )?;
        Ok(())
    }

    /// Cheap readiness probe for the startup wait.
    pub fn ping(&self) -> anyhow::Result<()> {
        let conn = self.conn();
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
        Ok(())
    }

    /// Insert the metric on first observation, refresh `last_updated` after
    /// that. Returns the row id either way.
    pub fn upsert_metric(
        &self,
        fingerprint: &str,
        job: Option<&str>,
        instance: Option<&str>,
    ) -> anyhow::Result<i64> {
        let conn = self.conn();
        let id = conn.query_row(
            "INSERT INTO metrics (fingerprint, job, instance) VALUES (?1, ?2, ?3) \
             ON CONFLICT(fingerprint) DO UPDATE SET \
             job = excluded.job, instance = excluded.instance, \
             last_updated = strftime('%Y-%m-%dT%H:%M:%SZ','now') \
             RETURNING id",
            params![fingerprint, job, instance],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    pub fn list_metrics(&self) -> anyhow::Result<Vec<Metric>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, fingerprint, job, instance, last_updated FROM metrics ORDER BY id ASC",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(Metric {
                    id: row.get(0)?,
                    fingerprint: row.get(1)?,
                    job: row.get(2)?,
                    instance: row.get(3)?,
                    last_updated: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Newest sample timestamp across every stored series of one metric name.
    /// Matches `__name__=<name>` exactly or as a `|`-separated prefix, so `up`
    /// does not swallow `upload_...`.
    pub fn max_sample_ts_for_name(&self, name: &str) -> anyhow::Result<Option<i64>> {
        let conn = self.conn();
        let max: Option<i64> = conn.query_row(
            "SELECT MAX(s.timestamp) FROM metric_samples s \
             JOIN metrics m ON m.id = s.metric_id \
             WHERE m.fingerprint = '__name__=' || ?1 \
                OR m.fingerprint LIKE '__name__=' || ?1 || '|%'",
            params![name],
            |row| row.get(0),
        )?;
        Ok(max)
    }

    /// Append a batch of samples in one transaction. NaN values are stored as
    /// NULL so gap points survive the round-trip. The transaction takes the
    /// write lock up front so concurrent batches queue on the busy timeout
    /// instead of failing a deferred upgrade.
    pub fn insert_samples(&self, rows: &[SampleRow]) -> anyhow::Result<usize> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO metric_samples (metric_id, timestamp, value) VALUES (?1, ?2, ?3)",
            )?;
            for row in rows {
                let value = if row.y.is_nan() { None } else { Some(row.y) };
                stmt.execute(params![row.metric_id, row.ds, value])?;
            }
        }
        tx.commit()?;
        Ok(rows.len())
    }

    /// One page of samples newer than `cutoff`, ordered by insertion, for
    /// chunked cache hydration.
    pub fn samples_since(
        &self,
        cutoff: i64,
        limit: usize,
        offset: usize,
    ) -> anyhow::Result<Vec<(i64, SamplePoint)>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT metric_id, timestamp, value FROM metric_samples \
             WHERE timestamp >= ?1 ORDER BY id ASC LIMIT ?2 OFFSET ?3",
        )?;
        let rows = stmt
            .query_map(params![cutoff, limit as i64, offset as i64], |row| {
                let value: Option<f64> = row.get(2)?;
                Ok((
                    row.get::<_, i64>(0)?,
                    SamplePoint {
                        ds: row.get(1)?,
                        y: value.unwrap_or(f64::NAN),
                    },
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Retention prune: drop every sample older than `cutoff`, all metrics at
    /// once, in a single implicit transaction.
    pub fn prune_samples_before(&self, cutoff: i64) -> anyhow::Result<usize> {
        let conn = self.conn();
        let deleted = conn.execute(
            "DELETE FROM metric_samples WHERE timestamp < ?1",
            params![cutoff],
        )?;
        Ok(deleted)
    }

    /// Sample count per metric id, one query for the status snapshot.
    pub fn sample_counts(&self) -> anyhow::Result<HashMap<i64, i64>> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare("SELECT metric_id, COUNT(*) FROM metric_samples GROUP BY metric_id")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)))?
            .collect::<Result<HashMap<_, _>, _>>()?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_temp() -> (tempfile::TempDir, MetricStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = MetricStore::open(dir.path().join("test.db").to_str().unwrap(), 4).unwrap();
        (dir, store)
    }

    #[test]
    fn upsert_is_idempotent_on_fingerprint() {
        let (_dir, store) = open_temp();
        let a = store
            .upsert_metric("__name__=up|instance=h1", Some("node"), Some("h1"))
            .unwrap();
        let b = store
            .upsert_metric("__name__=up|instance=h1", Some("node"), Some("h1"))
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(store.list_metrics().unwrap().len(), 1);
    }

    #[test]
    fn max_ts_respects_name_boundary() {
        let (_dir, store) = open_temp();
        let up = store.upsert_metric("__name__=up|instance=h1", None, None).unwrap();
        let upload = store
            .upsert_metric("__name__=upload_bytes_total|instance=h1", None, None)
            .unwrap();
        store
            .insert_samples(&[
                SampleRow { metric_id: up, ds: 100, y: 1.0 },
                SampleRow { metric_id: upload, ds: 900, y: 5.0 },
            ])
            .unwrap();
        assert_eq!(store.max_sample_ts_for_name("up").unwrap(), Some(100));
        assert_eq!(
            store.max_sample_ts_for_name("upload_bytes_total").unwrap(),
            Some(900)
        );
        assert_eq!(store.max_sample_ts_for_name("absent").unwrap(), None);
    }

    #[test]
    fn nan_round_trips_as_gap() {
        let (_dir, store) = open_temp();
        let id = store.upsert_metric("__name__=up", None, None).unwrap();
        store
            .insert_samples(&[
                SampleRow { metric_id: id, ds: 1, y: 1.0 },
                SampleRow { metric_id: id, ds: 2, y: f64::NAN },
            ])
            .unwrap();
        let rows = store.samples_since(0, 100, 0).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].1.y, 1.0);
        assert!(rows[1].1.y.is_nan());
    }

    #[test]
    fn prune_deletes_only_older_samples() {
        let (_dir, store) = open_temp();
        let id = store.upsert_metric("__name__=up", None, None).unwrap();
        let rows: Vec<SampleRow> = (0..10)
            .map(|i| SampleRow { metric_id: id, ds: i * 100, y: 1.0 })
            .collect();
        store.insert_samples(&rows).unwrap();
        let deleted = store.prune_samples_before(500).unwrap();
        assert_eq!(deleted, 5);
        let remaining = store.samples_since(0, 100, 0).unwrap();
        assert!(remaining.iter().all(|(_, p)| p.ds >= 500));
    }

    #[test]
    fn pooled_connections_serve_concurrent_writers() {
        let dir = tempfile::tempdir().unwrap();
        let store = std::sync::Arc::new(
            MetricStore::open(dir.path().join("test.db").to_str().unwrap(), 4).unwrap(),
        );
        let mut handles = Vec::new();
        for t in 0..8 {
            let store = store.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..20i64 {
                    let fp = format!("__name__=up|instance=w{t}-{i}");
                    let id = store.upsert_metric(&fp, None, None).unwrap();
                    store
                        .insert_samples(&[SampleRow { metric_id: id, ds: i, y: 1.0 }])
                        .unwrap();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(store.list_metrics().unwrap().len(), 160);
        let counts = store.sample_counts().unwrap();
        assert_eq!(counts.len(), 160);
        assert!(counts.values().all(|&c| c == 1), "one sample per series, no duplicates");
    }

    #[test]
    fn sample_counts_group_by_metric() {
        let (_dir, store) = open_temp();
        let a = store.upsert_metric("__name__=up|instance=a", None, None).unwrap();
        let b = store.upsert_metric("__name__=up|instance=b", None, None).unwrap();
        store
            .insert_samples(&[
                SampleRow { metric_id: a, ds: 1, y: 1.0 },
                SampleRow { metric_id: a, ds: 2, y: 1.0 },
                SampleRow { metric_id: b, ds: 1, y: 1.0 },
            ])
            .unwrap();
        let counts = store.sample_counts().unwrap();
        assert_eq!(counts.get(&a), Some(&2));
        assert_eq!(counts.get(&b), Some(&1));
    }
}
