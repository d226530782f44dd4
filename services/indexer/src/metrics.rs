//! Observability counters for the indexer
//!
//! Tracks ingestion cycles, persistence, delivery outcomes, and sweeps.
//! Exposed through the status endpoint; the stored `delivery_status`
//! column remains the source of truth for per-event audits.

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Core metrics for the indexer service.
pub struct IndexerMetrics {
    // Ingestion cycles
    pub cycles_run: AtomicU64,
    pub cycles_skipped: AtomicU64,
    pub cycle_duration_ms: Mutex<LatencyTracker>,

    // Upstream / storage
    pub upstream_failures: AtomicU64,
    pub events_persisted: AtomicU64,
    pub persist_failures: AtomicU64,

    // Delivery
    pub events_delivered: AtomicU64,
    pub delivery_unreachable: AtomicU64,
    pub malformed_responses: AtomicU64,
    pub status_write_failures: AtomicU64,

    // Reconciliation
    pub sweeps_run: AtomicU64,
    pub sweeps_skipped: AtomicU64,
    pub events_reswept: AtomicU64,
}

impl IndexerMetrics {
    pub fn new() -> Self {
        Self {
            cycles_run: AtomicU64::new(0),
            cycles_skipped: AtomicU64::new(0),
            cycle_duration_ms: Mutex::new(LatencyTracker::new(1000)),
            upstream_failures: AtomicU64::new(0),
            events_persisted: AtomicU64::new(0),
            persist_failures: AtomicU64::new(0),
            events_delivered: AtomicU64::new(0),
            delivery_unreachable: AtomicU64::new(0),
            malformed_responses: AtomicU64::new(0),
            status_write_failures: AtomicU64::new(0),
            sweeps_run: AtomicU64::new(0),
            sweeps_skipped: AtomicU64::new(0),
            events_reswept: AtomicU64::new(0),
        }
    }

    /// Record a completed ingestion cycle.
    pub fn record_cycle(&self, duration_ms: u64) {
        self.cycles_run.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut tracker) = self.cycle_duration_ms.lock() {
            tracker.record(duration_ms);
        }
    }

    pub fn record_cycle_skipped(&self) {
        self.cycles_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_upstream_failure(&self) {
        self.upstream_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_persisted(&self, count: u64) {
        self.events_persisted.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_persist_failure(&self) {
        self.persist_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record events whose status the orderbook reported back.
    pub fn record_delivered(&self, count: u64) {
        self.events_delivered.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_unreachable(&self) {
        self.delivery_unreachable.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_malformed_response(&self) {
        self.malformed_responses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_status_write_failure(&self) {
        self.status_write_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sweep(&self, reswept: u64) {
        self.sweeps_run.fetch_add(1, Ordering::Relaxed);
        self.events_reswept.fetch_add(reswept, Ordering::Relaxed);
    }

    pub fn record_sweep_skipped(&self) {
        self.sweeps_skipped.fetch_add(1, Ordering::Relaxed);
    }

    /// Export counters as a BTreeMap for exposition.
    pub fn export(&self) -> BTreeMap<String, u64> {
        let mut m = BTreeMap::new();
        m.insert("cycles_run".to_string(), self.cycles_run.load(Ordering::Relaxed));
        m.insert("cycles_skipped".to_string(), self.cycles_skipped.load(Ordering::Relaxed));
        m.insert("upstream_failures".to_string(), self.upstream_failures.load(Ordering::Relaxed));
        m.insert("events_persisted".to_string(), self.events_persisted.load(Ordering::Relaxed));
        m.insert("persist_failures".to_string(), self.persist_failures.load(Ordering::Relaxed));
        m.insert("events_delivered".to_string(), self.events_delivered.load(Ordering::Relaxed));
        m.insert(
            "delivery_unreachable".to_string(),
            self.delivery_unreachable.load(Ordering::Relaxed),
        );
        m.insert(
            "malformed_responses".to_string(),
            self.malformed_responses.load(Ordering::Relaxed),
        );
        m.insert(
            "status_write_failures".to_string(),
            self.status_write_failures.load(Ordering::Relaxed),
        );
        m.insert("sweeps_run".to_string(), self.sweeps_run.load(Ordering::Relaxed));
        m.insert("sweeps_skipped".to_string(), self.sweeps_skipped.load(Ordering::Relaxed));
        m.insert("events_reswept".to_string(), self.events_reswept.load(Ordering::Relaxed));
        m
    }

    /// Point-in-time view including cycle latency percentiles.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let (cycle_p50_ms, cycle_p99_ms) = match self.cycle_duration_ms.lock() {
            Ok(tracker) => (tracker.percentile(50), tracker.percentile(99)),
            Err(_) => (None, None),
        };

        MetricsSnapshot {
            counters: self.export(),
            cycle_p50_ms,
            cycle_p99_ms,
        }
    }
}

impl Default for IndexerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Serializable metrics view.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub counters: BTreeMap<String, u64>,
    pub cycle_p50_ms: Option<u64>,
    pub cycle_p99_ms: Option<u64>,
}

/// Tracks latency samples for percentile calculation.
pub struct LatencyTracker {
    samples: Vec<u64>,
    max_samples: usize,
}

impl LatencyTracker {
    pub fn new(max_samples: usize) -> Self {
        Self {
            samples: Vec::with_capacity(max_samples),
            max_samples,
        }
    }

    /// Record a latency sample.
    pub fn record(&mut self, value: u64) {
        if self.samples.len() >= self.max_samples {
            self.samples.remove(0);
        }
        self.samples.push(value);
    }

    /// Get a percentile value (0-100).
    pub fn percentile(&self, p: usize) -> Option<u64> {
        if self.samples.is_empty() {
            return None;
        }

        let mut sorted = self.samples.clone();
        sorted.sort_unstable();

        let idx = (p as f64 / 100.0 * (sorted.len() - 1) as f64) as usize;
        Some(sorted[idx.min(sorted.len() - 1)])
    }

    pub fn count(&self) -> usize {
        self.samples.len()
    }
}
