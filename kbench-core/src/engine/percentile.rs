use serde::{Deserialize, Serialize};

/// Latency percentile summary in milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PercentileSummary {
    pub p50: u64,
    pub p95: u64,
    pub p99: u64,
    pub p999: u64,
    pub min: u64,
    pub max: u64,
    pub avg: f64,
}

/// Nearest-rank percentiles over a latency sample set.
///
/// For percentile `p` the rank is `ceil(p/100 * n) - 1`, clamped to
/// `[0, n-1]`. Not interpolated: the numbers must line up with what existing
/// dashboards already chart. An empty input yields an all-zero summary so
/// callers always have a displayable default.
pub fn percentiles(samples: &[u64]) -> PercentileSummary {
    if samples.is_empty() {
        return PercentileSummary::default();
    }

    let mut sorted = samples.to_vec();
    sorted.sort_unstable();
    let n = sorted.len();

    let rank = |p: f64| -> u64 {
        let idx = (p / 100.0 * n as f64).ceil() as usize;
        sorted[idx.saturating_sub(1).min(n - 1)]
    };

    let sum: u64 = sorted.iter().sum();

    PercentileSummary {
        p50: rank(50.0),
        p95: rank(95.0),
        p99: rank(99.0),
        p999: rank(99.9),
        min: sorted[0],
        max: sorted[n - 1],
        avg: sum as f64 / n as f64,
    }
}
