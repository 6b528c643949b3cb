use crate::broker::BrokerError;
use crate::store::StoreError;

pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors surfaced by job start/control operations. Runtime send/receive
/// failures inside a running loop never appear here; those land in the job's
/// error counters instead.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("topic must not be empty")]
    MissingTopic,

    #[error("consumer group id must not be empty")]
    MissingGroupId,

    #[error("record count must be at least 1")]
    InvalidCount,

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error("config serialization failed: {0}")]
    Config(#[from] serde_json::Error),

    #[error(transparent)]
    Store(#[from] StoreError),
}
