use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;

#[derive(Clone, Default)]
pub struct MetricsRegistry {
    inner: Arc<MetricsInner>,
}

#[derive(Default)]
struct MetricsInner {
    records_applied: AtomicU64,
    windows_processed: AtomicU64,
    entries_pruned: AtomicU64,
    balance_entries_peak: AtomicU64,
    checkpoints_written: AtomicU64,
}

impl MetricsRegistry {
    pub fn inc_records_applied(&self, delta: u64) {
        self.inner.records_applied.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn inc_windows_processed(&self, delta: u64) {
        self.inner.windows_processed.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn inc_entries_pruned(&self, delta: u64) {
        self.inner.entries_pruned.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn inc_checkpoints_written(&self, delta: u64) {
        self.inner.checkpoints_written.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn record_entries_peak(&self, entries: u64) {
        self.inner
            .balance_entries_peak
            .fetch_max(entries, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            records_applied: self.inner.records_applied.load(Ordering::Relaxed),
            windows_processed: self.inner.windows_processed.load(Ordering::Relaxed),
            entries_pruned: self.inner.entries_pruned.load(Ordering::Relaxed),
            balance_entries_peak: self.inner.balance_entries_peak.load(Ordering::Relaxed),
            checkpoints_written: self.inner.checkpoints_written.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub records_applied: u64,
    pub windows_processed: u64,
    pub entries_pruned: u64,
    pub balance_entries_peak: u64,
    pub checkpoints_written: u64,
}

impl MetricsSnapshot {
    pub fn to_json_line(&self, label: &str, elapsed: Option<Duration>) -> String {
        #[derive(Serialize)]
        struct Snapshot<'a> {
            label: &'a str,
            #[serde(flatten)]
            counters: &'a MetricsSnapshot,
            elapsed_ms: Option<u128>,
        }

        let payload = Snapshot {
            label,
            counters: self,
            elapsed_ms: elapsed.map(|d| d.as_millis()),
        };
        serde_json::to_string(&payload).unwrap_or_else(|_| String::from("{}"))
    }
}

pub struct RunTimer {
    start: Instant,
}

impl RunTimer {
    pub fn start() -> Self {
        Self { start: Instant::now() }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reports_counters_and_peak() {
        let metrics = MetricsRegistry::default();
        metrics.inc_records_applied(5);
        metrics.inc_records_applied(2);
        metrics.record_entries_peak(10);
        metrics.record_entries_peak(4);
        let snap = metrics.snapshot();
        assert_eq!(snap.records_applied, 7);
        assert_eq!(snap.balance_entries_peak, 10);

        let line = snap.to_json_line("run", Some(Duration::from_millis(12)));
        assert!(line.starts_with(r#"{"label":"run","records_applied":7,"#));
        assert!(line.ends_with(r#""elapsed_ms":12}"#));
    }
}
