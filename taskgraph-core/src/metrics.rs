//! Prometheus metrics for monitoring
//!
//! Process-wide counters, gauges and histograms rendered in the Prometheus
//! text format on the data-plane port.

use std::fmt::Write;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

/// Anything that can append itself to a Prometheus exposition
pub trait Metric: Send + Sync {
    fn render(&self, out: &mut String);
}

fn header(out: &mut String, name: &str, help: &str, kind: &str) {
    let _ = writeln!(out, "# HELP {} {}", name, help);
    let _ = writeln!(out, "# TYPE {} {}", name, kind);
}

/// Counter metric (monotonically increasing)
pub struct Counter {
    value: AtomicU64,
    name: &'static str,
    help: &'static str,
}

impl Counter {
    pub const fn new(name: &'static str, help: &'static str) -> Self {
        Self {
            value: AtomicU64::new(0),
            name,
            help,
        }
    }

    pub fn inc(&self) {
        self.inc_by(1);
    }

    pub fn inc_by(&self, delta: u64) {
        self.value.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

impl Metric for Counter {
    fn render(&self, out: &mut String) {
        header(out, self.name, self.help, "counter");
        let _ = writeln!(out, "{} {}", self.name, self.get());
    }
}

/// Gauge metric (can go up or down)
pub struct Gauge {
    value: AtomicI64,
    name: &'static str,
    help: &'static str,
}

impl Gauge {
    pub const fn new(name: &'static str, help: &'static str) -> Self {
        Self {
            value: AtomicI64::new(0),
            name,
            help,
        }
    }

    pub fn set(&self, val: i64) {
        self.value.store(val, Ordering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }
}

impl Metric for Gauge {
    fn render(&self, out: &mut String) {
        header(out, self.name, self.help, "gauge");
        let _ = writeln!(out, "{} {}", self.name, self.get());
    }
}

/// Upper bounds (seconds) shared by every latency histogram
const LATENCY_BOUNDS: [f64; 10] = [0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0, 120.0];

/// Latency histogram with fixed buckets
pub struct Histogram {
    buckets: [AtomicU64; LATENCY_BOUNDS.len()],
    /// Sum of observations in microseconds
    sum_micros: AtomicU64,
    count: AtomicU64,
    name: &'static str,
    help: &'static str,
}

impl Histogram {
    pub const fn new(name: &'static str, help: &'static str) -> Self {
        Self {
            buckets: [const { AtomicU64::new(0) }; LATENCY_BOUNDS.len()],
            sum_micros: AtomicU64::new(0),
            count: AtomicU64::new(0),
            name,
            help,
        }
    }

    pub fn observe(&self, elapsed: Duration) {
        let secs = elapsed.as_secs_f64();
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_micros
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
        for (bound, bucket) in LATENCY_BOUNDS.iter().zip(&self.buckets) {
            if secs <= *bound {
                bucket.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

impl Metric for Histogram {
    fn render(&self, out: &mut String) {
        header(out, self.name, self.help, "histogram");
        for (bound, bucket) in LATENCY_BOUNDS.iter().zip(&self.buckets) {
            let _ = writeln!(
                out,
                "{}_bucket{{le=\"{}\"}} {}",
                self.name,
                bound,
                bucket.load(Ordering::Relaxed)
            );
        }
        let _ = writeln!(out, "{}_bucket{{le=\"+Inf\"}} {}", self.name, self.count());
        let sum = self.sum_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0;
        let _ = writeln!(out, "{}_sum {}", self.name, sum);
        let _ = writeln!(out, "{}_count {}", self.name, self.count());
    }
}

/// Node-wide metrics
pub mod standard {
    use super::*;

    pub static SLOT_CLAIMS: Counter =
        Counter::new("taskgraph_slot_claims_total", "Task slots claimed by this process");

    pub static HEARTBEATS_SENT: Counter =
        Counter::new("taskgraph_heartbeats_total", "Liveness marker refreshes written");

    pub static PEER_FAILURES: Counter =
        Counter::new("taskgraph_peer_failures_total", "Peer liveness markers seen expiring");

    pub static META_DELIVERED: Counter =
        Counter::new("taskgraph_meta_delivered_total", "Neighbor meta values handed to the task");

    pub static EPOCHS_DELIVERED: Counter =
        Counter::new("taskgraph_epochs_delivered_total", "Epoch values handed to the task");

    pub static CURRENT_EPOCH: Gauge = Gauge::new("taskgraph_current_epoch", "Last epoch delivered");

    pub static DATA_REQUESTS_SERVED: Counter =
        Counter::new("taskgraph_data_requests_served_total", "Data requests served to neighbors");

    pub static DATA_REQUEST_DURATION: Histogram = Histogram::new(
        "taskgraph_data_request_duration_seconds",
        "Time to stream a data response",
    );

    pub(super) fn all() -> [&'static dyn Metric; 8] {
        [
            &SLOT_CLAIMS,
            &HEARTBEATS_SENT,
            &PEER_FAILURES,
            &META_DELIVERED,
            &EPOCHS_DELIVERED,
            &CURRENT_EPOCH,
            &DATA_REQUESTS_SERVED,
            &DATA_REQUEST_DURATION,
        ]
    }
}

/// Render every standard metric
pub fn gather_system_metrics() -> String {
    let mut output = String::new();
    for metric in standard::all() {
        metric.render(&mut output);
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter() {
        let counter = Counter::new("test_counter", "Test counter");
        counter.inc();
        counter.inc_by(5);
        assert_eq!(counter.get(), 6);

        let mut out = String::new();
        counter.render(&mut out);
        assert!(out.contains("# TYPE test_counter counter"));
        assert!(out.ends_with("test_counter 6\n"));
    }

    #[test]
    fn test_histogram_buckets() {
        let histogram = Histogram::new("test_histogram", "Test histogram");
        histogram.observe(Duration::from_micros(500));
        histogram.observe(Duration::from_millis(20));
        histogram.observe(Duration::from_secs(200));

        let mut out = String::new();
        histogram.render(&mut out);
        assert!(out.contains("test_histogram_bucket{le=\"0.001\"} 1"));
        assert!(out.contains("test_histogram_bucket{le=\"0.05\"} 2"));
        assert!(out.contains("test_histogram_bucket{le=\"+Inf\"} 3"));
        assert!(out.contains("test_histogram_count 3"));
    }

    #[test]
    fn test_gather_lists_everything() {
        let text = gather_system_metrics();
        assert!(text.contains("taskgraph_slot_claims_total"));
        assert!(text.contains("taskgraph_data_request_duration_seconds_count"));
    }
}
