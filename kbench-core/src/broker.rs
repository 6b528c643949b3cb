use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

pub type Result<T> = std::result::Result<T, BrokerError>;

/// Error surfaced by a broker client implementation.
///
/// Broker clients report failures as free-form messages plus an optional
/// transport/protocol code; both are kept so the heuristic classifier can
/// inspect either.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct BrokerError {
    pub message: String,
    pub code: Option<String>,
}

impl BrokerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
        }
    }

    pub fn with_code(message: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: Some(code.into()),
        }
    }
}

/// Best-effort error buckets for reporting.
///
/// Classification is advisory only: it feeds the categorized counters in job
/// stats and never changes control flow.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ErrorCategory {
    Timeout,
    Network,
    Broker,
    Other,
}

impl ErrorCategory {
    /// Classify by error signature, mirroring the signatures the dashboard
    /// has historically matched against. Unrecognized errors land in `Other`.
    pub fn classify(err: &BrokerError) -> Self {
        let msg = err.message.as_str();
        let code = err.code.as_deref().unwrap_or("");

        if msg.contains("timeout") || msg.contains("TIMEOUT") || code == "ETIMEDOUT" {
            Self::Timeout
        } else if msg.contains("network")
            || msg.contains("ECONNREFUSED")
            || msg.contains("ENOTFOUND")
            || code.starts_with('E')
        {
            Self::Network
        } else if msg.contains("broker")
            || msg.contains("NOT_LEADER")
            || msg.contains("LEADER_NOT_AVAILABLE")
            || code.contains("KAFKA")
        {
            Self::Broker
        } else {
            Self::Other
        }
    }
}

/// One record handed to the broker on a produce call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProducerRecord {
    pub key: String,
    pub value: String,
}

/// One record delivered by a subscription.
#[derive(Debug, Clone)]
pub struct ConsumedRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
    pub value: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PartitionMetadata {
    pub id: i32,
    pub leader: i32,
    pub replicas: Vec<i32>,
    pub isr: Vec<i32>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TopicMetadata {
    pub name: String,
    pub partitions: Vec<PartitionMetadata>,
    pub replication_factor: i32,
    pub config_entries: Vec<(String, String)>,
}

/// Capability interface the engine drives a broker through.
///
/// `producer`/`consumer` return connected, job-scoped handles; a connect
/// failure there is a setup error and the job never goes live. The engine
/// owns exactly one handle per job and disconnects it on stop.
pub trait BrokerClient: Send + Sync + 'static {
    type Producer: BrokerProducer;
    type Consumer: BrokerConsumer;

    fn producer(&self, client_id: &str) -> impl Future<Output = Result<Self::Producer>> + Send;

    fn consumer(
        &self,
        client_id: &str,
        group_id: &str,
    ) -> impl Future<Output = Result<Self::Consumer>> + Send;

    fn list_topics(&self) -> impl Future<Output = Result<Vec<String>>> + Send;

    fn describe_topic(&self, name: &str) -> impl Future<Output = Result<TopicMetadata>> + Send;
}

pub trait BrokerProducer: Send + Sync + 'static {
    /// Send one batch and wait for the broker acknowledgment.
    fn send(
        &self,
        topic: &str,
        records: &[ProducerRecord],
    ) -> impl Future<Output = Result<()>> + Send;

    fn disconnect(&self) -> impl Future<Output = Result<()>> + Send;
}

pub trait BrokerConsumer: Send + Sync + 'static {
    /// Subscribe and receive records through a channel. The subscription ends
    /// when the consumer is disconnected or the receiver is dropped.
    fn subscribe(
        &self,
        topic: &str,
        from_beginning: bool,
    ) -> impl Future<Output = Result<mpsc::Receiver<ConsumedRecord>>> + Send;

    fn disconnect(&self) -> impl Future<Output = Result<()>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_matches_known_signatures() {
        let cases = [
            (BrokerError::new("request timeout"), ErrorCategory::Timeout),
            (
                BrokerError::with_code("request failed", "ETIMEDOUT"),
                ErrorCategory::Timeout,
            ),
            (
                BrokerError::new("connect ECONNREFUSED 127.0.0.1:9092"),
                ErrorCategory::Network,
            ),
            (
                BrokerError::with_code("dns failure", "ENOTFOUND"),
                ErrorCategory::Network,
            ),
            (
                BrokerError::new("LEADER_NOT_AVAILABLE for partition 2"),
                ErrorCategory::Broker,
            ),
            (
                BrokerError::with_code("produce rejected", "KAFKA_STORAGE_ERROR"),
                ErrorCategory::Broker,
            ),
            (
                BrokerError::new("something unexpected"),
                ErrorCategory::Other,
            ),
        ];

        for (err, want) in cases {
            assert_eq!(ErrorCategory::classify(&err), want, "error: {err}");
        }
    }

    #[test]
    fn classify_prefers_timeout_over_network() {
        // A timed-out network call counts as a timeout, matching the order
        // the signatures are checked in.
        let err = BrokerError::with_code("network timeout", "ECONNRESET");
        assert_eq!(ErrorCategory::classify(&err), ErrorCategory::Timeout);
    }
}
