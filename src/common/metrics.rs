//! Placement driver metrics
//!
//! Counters and a latency histogram for substrate calls, rendered in the
//! Prometheus text format by `GET /metrics`.

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Histogram bucket boundaries for substrate call latency (in milliseconds)
const LATENCY_BUCKETS: [f64; 10] = [
    1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 3000.0,
];

#[derive(Debug)]
pub struct Histogram {
    buckets: Vec<AtomicU64>,
    boundaries: &'static [f64],
    sum_micros: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    pub fn new() -> Self {
        Self {
            buckets: (0..=LATENCY_BUCKETS.len())
                .map(|_| AtomicU64::new(0))
                .collect(),
            boundaries: &LATENCY_BUCKETS,
            sum_micros: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    /// Record a value in milliseconds
    pub fn observe(&self, millis: f64) {
        let idx = self
            .boundaries
            .iter()
            .position(|&b| millis <= b)
            .unwrap_or(self.boundaries.len());
        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
        self.sum_micros
            .fetch_add((millis * 1000.0) as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    /// Cumulative `(upper bound, count)` pairs, ending with `+Inf`
    pub fn cumulative(&self) -> Vec<(f64, u64)> {
        let mut total = 0;
        let mut out = Vec::with_capacity(self.buckets.len());
        for (i, bucket) in self.buckets.iter().enumerate() {
            total += bucket.load(Ordering::Relaxed);
            let bound = self.boundaries.get(i).copied().unwrap_or(f64::INFINITY);
            out.push((bound, total));
        }
        out
    }

    pub fn sum_millis(&self) -> f64 {
        self.sum_micros.load(Ordering::Relaxed) as f64 / 1000.0
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

impl Default for Histogram {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Metrics owned by one placement driver instance
#[derive(Debug)]
pub struct PdMetrics {
    pub proposals_total: Counter,
    pub proposal_errors: Counter,
    pub reads_total: Counter,
    pub read_errors: Counter,
    pub membership_changes_total: Counter,
    pub membership_change_errors: Counter,
    pub regions_created: Counter,
    pub region_create_failures: Counter,
    pub announce_failures: Counter,
    pub cleanup_retries: Counter,
    pub cleanup_give_ups: Counter,
    pub substrate_latency: Histogram,
    start_time: Instant,
}

impl PdMetrics {
    pub fn new() -> Self {
        Self {
            proposals_total: Counter::default(),
            proposal_errors: Counter::default(),
            reads_total: Counter::default(),
            read_errors: Counter::default(),
            membership_changes_total: Counter::default(),
            membership_change_errors: Counter::default(),
            regions_created: Counter::default(),
            region_create_failures: Counter::default(),
            announce_failures: Counter::default(),
            cleanup_retries: Counter::default(),
            cleanup_give_ups: Counter::default(),
            substrate_latency: Histogram::new(),
            start_time: Instant::now(),
        }
    }

    pub fn observe_substrate_call(&self, elapsed: Duration) {
        self.substrate_latency
            .observe(elapsed.as_secs_f64() * 1000.0);
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Generate Prometheus-compatible metrics output
    pub fn to_prometheus(&self) -> String {
        let mut out = String::new();
        let counters = [
            ("pdkv_proposals_total", "PD group proposals", &self.proposals_total),
            ("pdkv_proposal_errors_total", "Failed PD group proposals", &self.proposal_errors),
            ("pdkv_reads_total", "PD group reads", &self.reads_total),
            ("pdkv_read_errors_total", "Failed PD group reads", &self.read_errors),
            (
                "pdkv_membership_changes_total",
                "Replica add/remove requests",
                &self.membership_changes_total,
            ),
            (
                "pdkv_membership_change_errors_total",
                "Failed replica add/remove requests",
                &self.membership_change_errors,
            ),
            ("pdkv_regions_created_total", "Regions created", &self.regions_created),
            (
                "pdkv_region_create_failures_total",
                "Region creations that failed",
                &self.region_create_failures,
            ),
            ("pdkv_announce_failures_total", "Failed self-announces", &self.announce_failures),
            (
                "pdkv_cleanup_retries_total",
                "Retries removing a temporary bootstrap replica",
                &self.cleanup_retries,
            ),
            (
                "pdkv_cleanup_give_ups_total",
                "Temporary bootstrap replicas that could not be removed",
                &self.cleanup_give_ups,
            ),
        ];
        for (name, help, counter) in counters {
            let _ = writeln!(out, "# HELP {} {}", name, help);
            let _ = writeln!(out, "# TYPE {} counter", name);
            let _ = writeln!(out, "{} {}", name, counter.get());
        }

        out.push_str("# HELP pdkv_uptime_seconds Server uptime in seconds\n");
        out.push_str("# TYPE pdkv_uptime_seconds gauge\n");
        let _ = writeln!(out, "pdkv_uptime_seconds {}", self.uptime_seconds());

        out.push_str("# HELP pdkv_substrate_call_ms Substrate call duration in milliseconds\n");
        out.push_str("# TYPE pdkv_substrate_call_ms histogram\n");
        for (le, count) in self.substrate_latency.cumulative() {
            if le.is_infinite() {
                let _ = writeln!(out, "pdkv_substrate_call_ms_bucket{{le=\"+Inf\"}} {}", count);
            } else {
                let _ = writeln!(out, "pdkv_substrate_call_ms_bucket{{le=\"{}\"}} {}", le, count);
            }
        }
        let _ = writeln!(
            out,
            "pdkv_substrate_call_ms_sum {}",
            self.substrate_latency.sum_millis()
        );
        let _ = writeln!(
            out,
            "pdkv_substrate_call_ms_count {}",
            self.substrate_latency.count()
        );

        out
    }
}

impl Default for PdMetrics {
    fn default() -> Self {
        Self::new()
    }
}
