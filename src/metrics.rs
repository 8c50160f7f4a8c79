//! Invocation analytics.
//!
//! [`MetricsAggregator`] owns the dashboard snapshot served by `GET /metrics`.
//! It only sees requests that reached the model; admission-level counters
//! live in [`ServiceCounters`] and are exposed in Prometheus text format.

use std::collections::VecDeque;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

use serde::Serialize;

use crate::telemetry::TelemetrySink;

pub const DEFAULT_HISTORY_CAPACITY: usize = 50;

/// Terminal outcome of one invocation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Outcome {
    Success(Duration),
    Failure,
}

/// Timing of a single model invocation. Produced once per request that
/// reached the invoker and dropped after it has been recorded.
#[derive(Debug, Clone)]
pub struct InvocationRecord {
    pub started_at: Instant,
    pub finished_at: Instant,
    pub succeeded: bool,
}

impl InvocationRecord {
    pub fn duration(&self) -> Duration {
        self.finished_at.saturating_duration_since(self.started_at)
    }

    pub fn outcome(&self) -> Outcome {
        if self.succeeded {
            Outcome::Success(self.duration())
        } else {
            Outcome::Failure
        }
    }

    /// Same timing, marked failed. Used when the output gate rejects a
    /// caption the model produced successfully.
    pub fn into_failure(self) -> Self {
        Self {
            succeeded: false,
            ..self
        }
    }
}

/// Read-only copy of the aggregate state. Serialises to the dashboard shape.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct MetricsSnapshot {
    pub model_invocations: u64,
    pub successful_invocations: u64,
    pub failed_invocations: u64,
    /// Seconds, mean of `processing_times`.
    pub avg_processing_time: f64,
    /// Seconds, oldest first.
    pub processing_times: Vec<f64>,
    /// Percentage in [0, 100].
    pub success_rate: f64,
    pub total_images: u64,
}

#[derive(Debug)]
struct AggregateState {
    successful: u64,
    failed: u64,
    durations: VecDeque<Duration>,
}

pub struct MetricsAggregator {
    state: Mutex<AggregateState>,
    capacity: usize,
}

impl MetricsAggregator {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(AggregateState {
                successful: 0,
                failed: 0,
                durations: VecDeque::with_capacity(capacity),
            }),
            capacity,
        }
    }

    pub fn record(&self, outcome: Outcome) {
        let mut state = self.lock();
        match outcome {
            Outcome::Success(duration) => {
                state.successful += 1;
                if state.durations.len() == self.capacity {
                    state.durations.pop_front();
                }
                state.durations.push_back(duration);
            }
            Outcome::Failure => state.failed += 1,
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let state = self.lock();
        let total = state.successful + state.failed;
        let processing_times: Vec<f64> =
            state.durations.iter().map(Duration::as_secs_f64).collect();
        let avg_processing_time = if processing_times.is_empty() {
            0.0
        } else {
            processing_times.iter().sum::<f64>() / processing_times.len() as f64
        };
        MetricsSnapshot {
            model_invocations: total,
            successful_invocations: state.successful,
            failed_invocations: state.failed,
            avg_processing_time,
            processing_times,
            success_rate: success_rate(state.successful, total),
            total_images: state.successful,
        }
    }

    // A panic while holding the lock cannot leave the counters half-updated,
    // so a poisoned mutex is still safe to read.
    fn lock(&self) -> std::sync::MutexGuard<'_, AggregateState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for MetricsAggregator {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}

/// Records exactly one outcome for an invocation. Dropping the guard
/// without completing it (a panic in the invocation task) records a failure.
pub struct RecordGuard {
    metrics: Option<Arc<MetricsAggregator>>,
}

impl RecordGuard {
    pub fn new(metrics: Arc<MetricsAggregator>) -> Self {
        Self {
            metrics: Some(metrics),
        }
    }

    pub fn complete(mut self, outcome: Outcome) {
        if let Some(metrics) = self.metrics.take() {
            metrics.record(outcome);
        }
    }
}

impl Drop for RecordGuard {
    fn drop(&mut self) {
        if let Some(metrics) = self.metrics.take() {
            tracing::warn!("invocation ended without an outcome, recording failure");
            metrics.record(Outcome::Failure);
        }
    }
}

pub fn success_rate(successful: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        successful as f64 / total as f64 * 100.0
    }
}

/// Inference latency histogram bucket upper bounds (ms).
const LATENCY_BUCKETS_MS: [u64; 10] = [100, 250, 500, 1000, 2000, 5000, 10000, 20000, 30000, 60000];

/// Service level counters kept beside the dashboard aggregate.
pub struct ServiceCounters {
    pub requests_total: AtomicU64,
    pub rate_limited_total: AtomicU64,
    pub invalid_uploads_total: AtomicU64,
    pub input_rejected_total: AtomicU64,
    pub output_rejected_total: AtomicU64,
    pub upstream_unavailable_total: AtomicU64,
    pub upstream_rejected_total: AtomicU64,
    pub timeouts_total: AtomicU64,
    pub storage_failures_total: AtomicU64,
    latency_counts: [AtomicU64; LATENCY_BUCKETS_MS.len()],
    latency_sum_ms: AtomicU64,
    latency_count: AtomicU64,
    process_start_epoch: f64,
    process_start_instant: Instant,
}

impl ServiceCounters {
    pub fn new() -> Self {
        let start = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default();
        Self {
            requests_total: AtomicU64::new(0),
            rate_limited_total: AtomicU64::new(0),
            invalid_uploads_total: AtomicU64::new(0),
            input_rejected_total: AtomicU64::new(0),
            output_rejected_total: AtomicU64::new(0),
            upstream_unavailable_total: AtomicU64::new(0),
            upstream_rejected_total: AtomicU64::new(0),
            timeouts_total: AtomicU64::new(0),
            storage_failures_total: AtomicU64::new(0),
            latency_counts: std::array::from_fn(|_| AtomicU64::new(0)),
            latency_sum_ms: AtomicU64::new(0),
            latency_count: AtomicU64::new(0),
            process_start_epoch: start.as_secs_f64(),
            process_start_instant: Instant::now(),
        }
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Observe the latency of an invocation, whatever its outcome.
    pub fn observe_latency(&self, latency: Duration) {
        let ms = latency.as_millis() as u64;
        self.latency_sum_ms.fetch_add(ms, Ordering::Relaxed);
        self.latency_count.fetch_add(1, Ordering::Relaxed);
        if let Some(idx) = LATENCY_BUCKETS_MS.iter().position(|ub| ms <= *ub) {
            self.latency_counts[idx].fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Prometheus text exposition of the counters, the given snapshot and
    /// the event log sink.
    pub fn render_prometheus(&self, snapshot: &MetricsSnapshot, telemetry: &TelemetrySink) -> String {
        let mut buf = String::new();
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);

        let counters: [(&str, &str, u64); 12] = [
            ("titler_requests_total", "Upload requests received", load(&self.requests_total)),
            ("titler_rate_limited_total", "Requests rejected by the rate limiter", load(&self.rate_limited_total)),
            ("titler_invalid_uploads_total", "Uploads rejected for format or framing", load(&self.invalid_uploads_total)),
            ("titler_input_rejected_total", "Uploads rejected by the input safety gate", load(&self.input_rejected_total)),
            ("titler_output_rejected_total", "Generated titles rejected by the output safety gate", load(&self.output_rejected_total)),
            ("titler_model_invocations_total", "Model invocations", snapshot.model_invocations),
            ("titler_model_successes_total", "Successful model invocations", snapshot.successful_invocations),
            ("titler_model_failures_total", "Failed model invocations", snapshot.failed_invocations),
            ("titler_upstream_unavailable_total", "Invocations failed on transport or server error", load(&self.upstream_unavailable_total)),
            ("titler_upstream_rejected_total", "Invocations declined by the model", load(&self.upstream_rejected_total)),
            ("titler_timeouts_total", "Invocations that exceeded the deadline", load(&self.timeouts_total)),
            ("titler_storage_failures_total", "Artifact writes that failed", load(&self.storage_failures_total)),
        ];
        for (name, help, value) in counters {
            writeln!(&mut buf, "# HELP {name} {help}").ok();
            writeln!(&mut buf, "# TYPE {name} counter").ok();
            writeln!(&mut buf, "{name} {value}").ok();
        }

        writeln!(
            &mut buf,
            "# HELP titler_invocation_latency_ms Model invocation latency histogram milliseconds"
        )
        .ok();
        writeln!(&mut buf, "# TYPE titler_invocation_latency_ms histogram").ok();
        let mut cumulative = 0u64;
        for (i, ub) in LATENCY_BUCKETS_MS.iter().enumerate() {
            cumulative += load(&self.latency_counts[i]);
            writeln!(
                &mut buf,
                "titler_invocation_latency_ms_bucket{{le=\"{}\"}} {}",
                ub, cumulative
            )
            .ok();
        }
        let count = load(&self.latency_count);
        writeln!(
            &mut buf,
            "titler_invocation_latency_ms_bucket{{le=\"+Inf\"}} {}",
            count
        )
        .ok();
        writeln!(
            &mut buf,
            "titler_invocation_latency_ms_sum {}",
            load(&self.latency_sum_ms)
        )
        .ok();
        writeln!(&mut buf, "titler_invocation_latency_ms_count {}", count).ok();

        writeln!(
            &mut buf,
            "# HELP titler_success_rate_percent Successful share of model invocations\n# TYPE titler_success_rate_percent gauge"
        )
        .ok();
        writeln!(&mut buf, "titler_success_rate_percent {}", snapshot.success_rate).ok();
        writeln!(
            &mut buf,
            "# HELP titler_build_info Build information\n# TYPE titler_build_info gauge"
        )
        .ok();
        writeln!(
            &mut buf,
            "titler_build_info{{version=\"{}\"}} 1",
            env!("CARGO_PKG_VERSION")
        )
        .ok();
        writeln!(
            &mut buf,
            "# HELP titler_process_start_time_seconds Process start time (Unix epoch seconds)\n# TYPE titler_process_start_time_seconds gauge"
        )
        .ok();
        writeln!(
            &mut buf,
            "titler_process_start_time_seconds {}",
            self.process_start_epoch
        )
        .ok();
        writeln!(
            &mut buf,
            "# HELP titler_process_uptime_seconds Process uptime seconds\n# TYPE titler_process_uptime_seconds gauge"
        )
        .ok();
        writeln!(
            &mut buf,
            "titler_process_uptime_seconds {}",
            self.process_start_instant.elapsed().as_secs_f64()
        )
        .ok();
        writeln!(
            &mut buf,
            "# HELP titler_telemetry_lines_total Event log lines written\n# TYPE titler_telemetry_lines_total counter\ntitler_telemetry_lines_total {}",
            telemetry.lines_total()
        )
        .ok();
        writeln!(
            &mut buf,
            "# HELP titler_telemetry_write_errors_total Event log write failures\n# TYPE titler_telemetry_write_errors_total counter\ntitler_telemetry_write_errors_total {}",
            telemetry.write_errors_total()
        )
        .ok();
        buf
    }
}

impl Default for ServiceCounters {
    fn default() -> Self {
        Self::new()
    }
}
