use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::broker::ErrorCategory;

use super::percentile::{PercentileSummary, percentiles};

/// Cadence at which throughput/error-rate history points are appended and a
/// stats update is considered due.
pub const FLUSH_INTERVAL: Duration = Duration::from_secs(1);

/// Most-recent-N window kept for trend series.
pub const MAX_HISTORY_POINTS: usize = 300;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThroughputPoint {
    /// Wall-clock unix millis.
    pub timestamp: u64,
    pub records_per_sec: f64,
    pub mb_per_sec: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorRatePoint {
    pub timestamp: u64,
    pub error_rate: f64,
    pub timeout_errors: u64,
    pub network_errors: u64,
    pub broker_errors: u64,
    pub other_errors: u64,
}

/// Immutable stats snapshot: what observers, the durable store, and the push
/// channel all see.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStats {
    pub running: bool,
    /// Wall-clock unix millis.
    pub start_time: u64,
    pub end_time: Option<u64>,
    pub total_records: u64,
    pub success_records: u64,
    pub failed_records: u64,
    pub records_per_sec: f64,
    pub mb_per_sec: f64,
    /// failed / total * 100; 0 when nothing has been attempted.
    pub error_rate: f64,
    pub timeout_errors: u64,
    pub network_errors: u64,
    pub broker_errors: u64,
    pub other_errors: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub percentiles: Option<PercentileSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ack_percentiles: Option<PercentileSummary>,
    pub throughput_history: Vec<ThroughputPoint>,
    pub error_rate_history: Vec<ErrorRatePoint>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unique_sequences: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lag: Option<u64>,
}

/// Per-job mutable counters. Single-writer: only the owning work loop mutates
/// an accumulator; everyone else sees `JobStats` snapshots.
#[derive(Debug)]
pub struct StatsAccumulator {
    started: Instant,
    start_time: u64,
    record_size: u64,
    track_latency: bool,

    total: u64,
    success: u64,
    failed: u64,
    timeout_errors: u64,
    network_errors: u64,
    broker_errors: u64,
    other_errors: u64,

    latencies_ms: Vec<u64>,
    ack_latencies_ms: Vec<u64>,

    throughput_history: Vec<ThroughputPoint>,
    error_rate_history: Vec<ErrorRatePoint>,
    last_flush: Instant,
    records_since_flush: u64,

    records_per_sec: f64,
    mb_per_sec: f64,

    unique_sequences: Option<u64>,

    finalized: Option<JobStats>,
}

impl StatsAccumulator {
    /// `record_size` is the nominal bytes per record used for MB/s math.
    /// `track_latency` is false for consumer jobs, which measure no
    /// per-operation latency and therefore report no percentiles.
    pub fn new(record_size: u64, track_latency: bool) -> Self {
        let now = Instant::now();
        Self {
            started: now,
            start_time: super::now_millis(),
            record_size,
            track_latency,
            total: 0,
            success: 0,
            failed: 0,
            timeout_errors: 0,
            network_errors: 0,
            broker_errors: 0,
            other_errors: 0,
            latencies_ms: Vec::new(),
            ack_latencies_ms: Vec::new(),
            throughput_history: Vec::new(),
            error_rate_history: Vec::new(),
            last_flush: now,
            records_since_flush: 0,
            records_per_sec: 0.0,
            mb_per_sec: 0.0,
            unique_sequences: None,
            finalized: None,
        }
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn success(&self) -> u64 {
        self.success
    }

    /// Record one acknowledged send of `records` records. Returns true when a
    /// flush window (~1s) rolled over, i.e. a stats update is due.
    pub fn record_success(&mut self, latency_ms: u64, ack_latency_ms: u64, records: u64) -> bool {
        if self.finalized.is_some() {
            return false;
        }

        self.total = self.total.saturating_add(records);
        self.success = self.success.saturating_add(records);
        if self.track_latency {
            self.latencies_ms.push(latency_ms);
            self.ack_latencies_ms.push(ack_latency_ms);
        }
        self.records_since_flush = self.records_since_flush.saturating_add(records);

        self.maybe_flush()
    }

    /// Record `records` received records (consumer side).
    pub fn record_received(&mut self, records: u64) -> bool {
        if self.finalized.is_some() {
            return false;
        }

        self.total = self.total.saturating_add(records);
        self.success = self.success.saturating_add(records);
        self.records_since_flush = self.records_since_flush.saturating_add(records);

        self.maybe_flush()
    }

    /// Record a failed unit of work. Never aborts anything: the loop keeps
    /// going and the failure is only visible through the counters.
    pub fn record_failure(&mut self, category: ErrorCategory, records: u64) {
        if self.finalized.is_some() {
            return;
        }

        self.total = self.total.saturating_add(records);
        self.failed = self.failed.saturating_add(records);
        match category {
            ErrorCategory::Timeout => {
                self.timeout_errors = self.timeout_errors.saturating_add(records);
            }
            ErrorCategory::Network => {
                self.network_errors = self.network_errors.saturating_add(records);
            }
            ErrorCategory::Broker => {
                self.broker_errors = self.broker_errors.saturating_add(records);
            }
            ErrorCategory::Other => {
                self.other_errors = self.other_errors.saturating_add(records);
            }
        }
    }

    pub fn set_unique_sequences(&mut self, count: u64) {
        self.unique_sequences = Some(count);
    }

    pub fn error_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            (self.failed as f64) / (self.total as f64) * 100.0
        }
    }

    /// Throughput is amortized over the wall time elapsed since the previous
    /// flush, not an instantaneous rate.
    fn maybe_flush(&mut self) -> bool {
        let now = Instant::now();
        let since_flush = now.duration_since(self.last_flush);
        if since_flush < FLUSH_INTERVAL {
            return false;
        }

        let elapsed = since_flush.as_secs_f64();
        let window_rps = (self.records_since_flush as f64) / elapsed;
        let timestamp = super::now_millis();

        self.throughput_history.push(ThroughputPoint {
            timestamp,
            records_per_sec: window_rps,
            mb_per_sec: window_rps * (self.record_size as f64) / BYTES_PER_MB,
        });
        trim_history(&mut self.throughput_history);

        if self.track_latency {
            self.error_rate_history.push(ErrorRatePoint {
                timestamp,
                error_rate: self.error_rate(),
                timeout_errors: self.timeout_errors,
                network_errors: self.network_errors,
                broker_errors: self.broker_errors,
                other_errors: self.other_errors,
            });
            trim_history(&mut self.error_rate_history);
        }

        self.records_since_flush = 0;
        self.last_flush = now;

        let run_secs = now.duration_since(self.started).as_secs_f64().max(1e-9);
        self.records_per_sec = (self.success as f64) / run_secs;
        self.mb_per_sec =
            (self.success as f64) * (self.record_size as f64) / (run_secs * BYTES_PER_MB);

        true
    }

    /// Current counters plus percentiles computed on demand.
    pub fn snapshot(&self) -> JobStats {
        if let Some(finished) = &self.finalized {
            return finished.clone();
        }

        let (pcts, ack_pcts) = if self.track_latency {
            (
                Some(percentiles(&self.latencies_ms)),
                Some(percentiles(&self.ack_latencies_ms)),
            )
        } else {
            (None, None)
        };

        JobStats {
            running: true,
            start_time: self.start_time,
            end_time: None,
            total_records: self.total,
            success_records: self.success,
            failed_records: self.failed,
            records_per_sec: self.records_per_sec,
            mb_per_sec: self.mb_per_sec,
            error_rate: self.error_rate(),
            timeout_errors: self.timeout_errors,
            network_errors: self.network_errors,
            broker_errors: self.broker_errors,
            other_errors: self.other_errors,
            percentiles: pcts,
            ack_percentiles: ack_pcts,
            throughput_history: self.throughput_history.clone(),
            error_rate_history: self.error_rate_history.clone(),
            unique_sequences: self.unique_sequences,
            // Lag is only known to external brokers that report consumer
            // group offsets; the engine itself never measures it.
            lag: None,
        }
    }

    /// Freeze the accumulator and compute final rates.
    ///
    /// Runs shorter than one second are treated as one second so the final
    /// records/sec cannot blow up on a division by a near-zero duration.
    pub fn finalize(&mut self) -> JobStats {
        if let Some(finished) = &self.finalized {
            return finished.clone();
        }

        let elapsed = self.started.elapsed().as_secs_f64();
        let elapsed = if elapsed < 1.0 { 1.0 } else { elapsed };

        let mut stats = self.snapshot();
        stats.running = false;
        stats.end_time = Some(super::now_millis());
        stats.records_per_sec = (self.success as f64) / elapsed;
        stats.mb_per_sec =
            (self.success as f64) * (self.record_size as f64) / (elapsed * BYTES_PER_MB);
        stats.error_rate = self.error_rate();

        self.finalized = Some(stats.clone());
        stats
    }
}

fn trim_history<T>(series: &mut Vec<T>) {
    if series.len() <= MAX_HISTORY_POINTS {
        return;
    }
    let over = series.len() - MAX_HISTORY_POINTS;
    series.drain(0..over);
}
