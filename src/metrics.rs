//! Process-local task metrics in Prometheus text exposition format.

use anyhow::Result;
use std::collections::BTreeMap;
use std::fmt::Write;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use crate::db::Database;
use crate::index::SharedIndex;
use crate::tasks::{TaskKind, TaskState};

/// Upper bounds, in seconds, of the duration histogram buckets.
const DURATION_BUCKETS: [f64; 10] = [0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 5.0, 30.0, 120.0, 600.0];

#[derive(Debug, Default, Clone)]
struct Histogram {
    buckets: [u64; DURATION_BUCKETS.len()],
    sum: f64,
    count: u64,
}

impl Histogram {
    fn observe(&mut self, seconds: f64) {
        for (bucket, bound) in self.buckets.iter_mut().zip(DURATION_BUCKETS) {
            if seconds <= bound {
                *bucket += 1;
            }
        }
        self.sum += seconds;
        self.count += 1;
    }
}

#[derive(Debug, Default)]
struct Inner {
    processed: BTreeMap<(TaskKind, TaskState), u64>,
    retries: BTreeMap<TaskKind, u64>,
    durations: BTreeMap<TaskKind, Histogram>,
}

#[derive(Debug, Default)]
pub struct Metrics {
    inner: Mutex<Inner>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        // Counters stay usable after a panic elsewhere.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record a finished handler run and the state it left the task in.
    pub fn record_outcome(&self, kind: TaskKind, state: TaskState, elapsed: Duration) {
        let mut inner = self.inner();
        *inner.processed.entry((kind, state)).or_default() += 1;
        inner
            .durations
            .entry(kind)
            .or_default()
            .observe(elapsed.as_secs_f64());
    }

    pub fn record_retry(&self, kind: TaskKind) {
        *self.inner().retries.entry(kind).or_default() += 1;
    }

    pub fn processed(&self, kind: TaskKind, state: TaskState) -> u64 {
        self.inner().processed.get(&(kind, state)).copied().unwrap_or(0)
    }

    pub fn retries(&self, kind: TaskKind) -> u64 {
        self.inner().retries.get(&kind).copied().unwrap_or(0)
    }

    /// Counters and histograms plus store and index gauges.
    pub fn render(&self, db: &Database, index: &SharedIndex) -> Result<String> {
        let counts = db.count_by_state()?;
        let index_size = index.len()?;
        let inner = self.inner();
        let mut out = String::new();

        out.push_str("# TYPE darkroom_tasks_processed_total counter\n");
        for ((kind, state), value) in &inner.processed {
            let _ = writeln!(
                out,
                "darkroom_tasks_processed_total{{kind=\"{}\",state=\"{}\"}} {}",
                kind, state, value
            );
        }

        out.push_str("# TYPE darkroom_task_retries_total counter\n");
        for (kind, value) in &inner.retries {
            let _ = writeln!(out, "darkroom_task_retries_total{{kind=\"{}\"}} {}", kind, value);
        }

        out.push_str("# TYPE darkroom_task_duration_seconds histogram\n");
        for (kind, histogram) in &inner.durations {
            for (bound, count) in DURATION_BUCKETS.iter().zip(histogram.buckets) {
                let _ = writeln!(
                    out,
                    "darkroom_task_duration_seconds_bucket{{kind=\"{}\",le=\"{}\"}} {}",
                    kind, bound, count
                );
            }
            let _ = writeln!(
                out,
                "darkroom_task_duration_seconds_bucket{{kind=\"{}\",le=\"+Inf\"}} {}",
                kind, histogram.count
            );
            let _ = writeln!(
                out,
                "darkroom_task_duration_seconds_sum{{kind=\"{}\"}} {}",
                kind, histogram.sum
            );
            let _ = writeln!(
                out,
                "darkroom_task_duration_seconds_count{{kind=\"{}\"}} {}",
                kind, histogram.count
            );
        }

        let _ = write!(
            out,
            concat!(
                "# TYPE darkroom_tasks_pending gauge\n",
                "darkroom_tasks_pending {}\n",
                "# TYPE darkroom_tasks_running gauge\n",
                "darkroom_tasks_running {}\n",
                "# TYPE darkroom_tasks_dead gauge\n",
                "darkroom_tasks_dead {}\n",
                "# TYPE darkroom_vector_index_size gauge\n",
                "darkroom_vector_index_size {}\n"
            ),
            counts.pending, counts.running, counts.dead, index_size
        );

        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::BruteForceIndex;
    use serde_json::json;

    #[test]
    fn test_render_exposition() {
        let db = Database::open_in_memory().unwrap();
        db.initialize().unwrap();
        db.enqueue(TaskKind::Thumb, &json!({"asset_id": 1}), None).unwrap();
        let index = SharedIndex::new(Box::new(BruteForceIndex::new()));
        index.add(&[1, 2], &[vec![1.0, 0.0], vec![0.0, 1.0]]).unwrap();

        let metrics = Metrics::new();
        metrics.record_outcome(TaskKind::Embed, TaskState::Done, Duration::from_millis(30));
        metrics.record_outcome(TaskKind::Embed, TaskState::Done, Duration::from_secs(2));
        metrics.record_retry(TaskKind::Caption);

        let text = metrics.render(&db, &index).unwrap();
        assert!(text.contains("darkroom_tasks_processed_total{kind=\"embed\",state=\"done\"} 2\n"));
        assert!(text.contains("darkroom_task_retries_total{kind=\"caption\"} 1\n"));
        assert!(text.contains("darkroom_task_duration_seconds_bucket{kind=\"embed\",le=\"0.05\"} 1\n"));
        assert!(text.contains("darkroom_task_duration_seconds_bucket{kind=\"embed\",le=\"5\"} 2\n"));
        assert!(text.contains("darkroom_task_duration_seconds_count{kind=\"embed\"} 2\n"));
        assert!(text.contains("darkroom_tasks_pending 1\n"));
        assert!(text.contains("darkroom_vector_index_size 2\n"));
        assert_eq!(metrics.processed(TaskKind::Embed, TaskState::Done), 2);
    }
}
