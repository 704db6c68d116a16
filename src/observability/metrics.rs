//! Service metrics: request outcomes, admission pressure, sandbox counts and latency.
//!
//! One registry per `ExecutionService`; exported in Prometheus text format by `GET /metrics`.

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Monotonically increasing count
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Value that moves both ways; never goes below zero
#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicU64,
}

impl Gauge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, value: u64) {
        self.value.store(value, Ordering::Relaxed);
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        let _ = self
            .value
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| Some(v.saturating_sub(1)));
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

#[derive(Debug)]
struct Bucket {
    le: f64,
    count: AtomicU64,
}

/// Cumulative-bucket latency histogram (seconds)
#[derive(Debug)]
pub struct Histogram {
    buckets: Vec<Bucket>,
    sum_micros: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    pub fn with_bounds(bounds: &[f64]) -> Self {
        Self {
            buckets: bounds
                .iter()
                .map(|&le| Bucket {
                    le,
                    count: AtomicU64::new(0),
                })
                .collect(),
            sum_micros: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    /// Buckets sized for executions bounded by wall-clock limits of a few seconds
    pub fn execution_latency() -> Self {
        Self::with_bounds(&[0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0])
    }

    pub fn observe(&self, value: Duration) {
        let seconds = value.as_secs_f64();
        self.sum_micros
            .fetch_add(value.as_micros().min(u64::MAX as u128) as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        for bucket in &self.buckets {
            if seconds <= bucket.le {
                bucket.count.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn bucket_count(&self, le: f64) -> u64 {
        self.buckets
            .iter()
            .find(|b| (b.le - le).abs() < f64::EPSILON)
            .map(|b| b.count.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    fn export(&self, out: &mut String, name: &str, help: &str) {
        let _ = writeln!(out, "# HELP {} {}", name, help);
        let _ = writeln!(out, "# TYPE {} histogram", name);
        for bucket in &self.buckets {
            let _ = writeln!(
                out,
                "{}_bucket{{le=\"{}\"}} {}",
                name,
                bucket.le,
                bucket.count.load(Ordering::Relaxed)
            );
        }
        let _ = writeln!(out, "{}_bucket{{le=\"+Inf\"}} {}", name, self.count());
        let _ = writeln!(
            out,
            "{}_sum {}",
            name,
            self.sum_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0
        );
        let _ = writeln!(out, "{}_count {}", name, self.count());
    }
}

/// Outcome labels, in export order
pub const OUTCOME_CLASSES: [&str; 9] = [
    "ok",
    "compile_error",
    "runtime_error",
    "timeout",
    "resource",
    "sandbox_fault",
    "unsupported_language",
    "input_too_large",
    "overloaded",
];

#[derive(Debug)]
pub struct MetricsRegistry {
    pub requests_total: Counter,
    outcomes: [Counter; OUTCOME_CLASSES.len()],
    pub admission_rejections: Counter,
    pub sandbox_faults: Counter,

    pub in_flight: Gauge,
    pub live_sandboxes: Gauge,
    pub queued_waiters: Gauge,

    pub execution_duration: Histogram,
    pub admission_wait: Histogram,
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            requests_total: Counter::new(),
            outcomes: Default::default(),
            admission_rejections: Counter::new(),
            sandbox_faults: Counter::new(),
            in_flight: Gauge::new(),
            live_sandboxes: Gauge::new(),
            queued_waiters: Gauge::new(),
            execution_duration: Histogram::execution_latency(),
            admission_wait: Histogram::with_bounds(&[0.001, 0.01, 0.1, 0.5, 1.0, 2.5, 5.0]),
        }
    }

    /// Count one finished request under its outcome class. Unknown classes are ignored.
    pub fn record_outcome(&self, class: &str) {
        if let Some(idx) = OUTCOME_CLASSES.iter().position(|c| *c == class) {
            self.outcomes[idx].inc();
        }
        if class == "overloaded" {
            self.admission_rejections.inc();
        }
        if class == "sandbox_fault" {
            self.sandbox_faults.inc();
        }
    }

    pub fn outcome_count(&self, class: &str) -> u64 {
        OUTCOME_CLASSES
            .iter()
            .position(|c| *c == class)
            .map(|idx| self.outcomes[idx].get())
            .unwrap_or(0)
    }

    pub fn export_prometheus(&self) -> String {
        let mut out = String::new();

        let _ = writeln!(out, "# HELP execbox_requests_total Execution requests received");
        let _ = writeln!(out, "# TYPE execbox_requests_total counter");
        let _ = writeln!(out, "execbox_requests_total {}", self.requests_total.get());

        let _ = writeln!(out, "# HELP execbox_outcomes_total Finished requests by outcome class");
        let _ = writeln!(out, "# TYPE execbox_outcomes_total counter");
        for (class, counter) in OUTCOME_CLASSES.iter().zip(&self.outcomes) {
            let _ = writeln!(out, "execbox_outcomes_total{{outcome=\"{}\"}} {}", class, counter.get());
        }

        let _ = writeln!(out, "# HELP execbox_admission_rejections_total Requests turned away by admission");
        let _ = writeln!(out, "# TYPE execbox_admission_rejections_total counter");
        let _ = writeln!(out, "execbox_admission_rejections_total {}", self.admission_rejections.get());

        let _ = writeln!(out, "# HELP execbox_sandbox_faults_total Isolation boundary failures");
        let _ = writeln!(out, "# TYPE execbox_sandbox_faults_total counter");
        let _ = writeln!(out, "execbox_sandbox_faults_total {}", self.sandbox_faults.get());

        for (name, help, gauge) in [
            ("execbox_in_flight", "Executions currently holding an admission ticket", &self.in_flight),
            ("execbox_live_sandboxes", "Sandboxes acquired and not yet destroyed", &self.live_sandboxes),
            ("execbox_queued_waiters", "Requests waiting for admission", &self.queued_waiters),
        ] {
            let _ = writeln!(out, "# HELP {} {}", name, help);
            let _ = writeln!(out, "# TYPE {} gauge", name);
            let _ = writeln!(out, "{} {}", name, gauge.get());
        }

        self.execution_duration.export(
            &mut out,
            "execbox_execution_duration_seconds",
            "End-to-end execution latency",
        );
        self.admission_wait
            .export(&mut out, "execbox_admission_wait_seconds", "Time spent waiting for admission");
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gauge_does_not_underflow() {
        let g = Gauge::new();
        g.dec();
        assert_eq!(g.get(), 0);
        g.inc();
        g.inc();
        g.dec();
        assert_eq!(g.get(), 1);
    }

    #[test]
    fn histogram_buckets_are_cumulative() {
        let h = Histogram::execution_latency();
        h.observe(Duration::from_millis(30));
        h.observe(Duration::from_millis(700));
        assert_eq!(h.bucket_count(0.05), 1);
        assert_eq!(h.bucket_count(1.0), 2);
        assert_eq!(h.count(), 2);
    }

    #[test]
    fn outcomes_feed_derived_counters() {
        let m = MetricsRegistry::new();
        m.record_outcome("ok");
        m.record_outcome("overloaded");
        m.record_outcome("sandbox_fault");
        m.record_outcome("nonsense");
        assert_eq!(m.outcome_count("ok"), 1);
        assert_eq!(m.admission_rejections.get(), 1);
        assert_eq!(m.sandbox_faults.get(), 1);
        assert_eq!(m.outcome_count("nonsense"), 0);
    }

    #[test]
    fn prometheus_export_contains_families() {
        let m = MetricsRegistry::new();
        m.requests_total.inc();
        m.record_outcome("timeout");
        m.execution_duration.observe(Duration::from_secs(1));
        let text = m.export_prometheus();
        assert!(text.contains("execbox_requests_total 1"));
        assert!(text.contains("execbox_outcomes_total{outcome=\"timeout\"} 1"));
        assert!(text.contains("# TYPE execbox_live_sandboxes gauge"));
        assert!(text.contains("execbox_execution_duration_seconds_bucket{le=\"+Inf\"} 1"));
    }
}
