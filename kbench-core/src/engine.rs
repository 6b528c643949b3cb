mod error;
mod gate;
mod jobs;
mod percentile;
mod registry;
mod sequence;
mod stats;

pub use error::{EngineError, Result};
pub use gate::{RunGate, StopToken};
pub use jobs::{
    AccumulationConfig, ConsumeConfig, JobEngine, LoadtestConsumerConfig, LoadtestProducerConfig,
    ProduceConfig, RunningJob, SendConfig,
};
pub use percentile::{PercentileSummary, percentiles};
pub use registry::{JobLogs, JobOutcome, JobRegistry, LiveJob, LogEntry, LogLevel, LogPage};
pub use sequence::{MissingReport, SequenceSet};
pub use stats::{
    ErrorRatePoint, FLUSH_INTERVAL, JobStats, MAX_HISTORY_POINTS, StatsAccumulator,
    ThroughputPoint,
};

/// Wall-clock unix millis. Timestamps in stats, records and events all come
/// from here; the monotonic clock is only used for rate math.
pub(crate) fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}
