//! Loopback broker used by tests and local demos: records produced to a
//! topic are kept in memory and fanned out to subscribers immediately, with
//! hooks to inject latency and failures.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::debug;

use kbench_core::{
    BrokerClient, BrokerConsumer, BrokerError, BrokerProducer, BrokerResult, ConsumedRecord,
    PartitionMetadata, ProducerRecord, TopicMetadata,
};

const SUBSCRIBER_BUFFER: usize = 4096;

#[derive(Debug, Default)]
struct TopicState {
    records: Vec<ProducerRecord>,
    subscribers: HashMap<u64, mpsc::Sender<ConsumedRecord>>,
}

#[derive(Debug, Default)]
struct Shared {
    topics: Mutex<HashMap<String, TopicState>>,
    send_latency: Mutex<Option<Duration>>,
    fail_sends: AtomicBool,
    fail_connects: AtomicBool,
    next_subscriber: AtomicU64,
}

impl Shared {
    fn topics(&self) -> MutexGuard<'_, HashMap<String, TopicState>> {
        self.topics
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// In-memory broker. Cloning shares the same topics and injection switches.
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_topics<I, T>(topics: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        let broker = Self::new();
        {
            let mut map = broker.shared.topics();
            for topic in topics {
                map.entry(topic.into()).or_default();
            }
        }
        broker
    }

    pub fn create_topic(&self, name: impl Into<String>) {
        self.shared.topics().entry(name.into()).or_default();
    }

    /// Delay applied inside every producer send.
    pub fn set_send_latency(&self, latency: Option<Duration>) {
        let mut slot = self
            .shared
            .send_latency
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *slot = latency;
    }

    /// When set, every producer send fails with a broker error.
    pub fn set_fail_sends(&self, fail: bool) {
        self.shared.fail_sends.store(fail, Ordering::Relaxed);
    }

    /// When set, producer/consumer connect attempts fail.
    pub fn set_fail_connects(&self, fail: bool) {
        self.shared.fail_connects.store(fail, Ordering::Relaxed);
    }

    /// All records stored for a topic, in produce order.
    pub fn records(&self, topic: &str) -> Vec<ProducerRecord> {
        self.shared
            .topics()
            .get(topic)
            .map(|state| state.records.clone())
            .unwrap_or_default()
    }

    pub fn record_count(&self, topic: &str) -> usize {
        self.shared
            .topics()
            .get(topic)
            .map(|state| state.records.len())
            .unwrap_or(0)
    }

    fn check_connect(&self) -> BrokerResult<()> {
        if self.shared.fail_connects.load(Ordering::Relaxed) {
            return Err(BrokerError::with_code(
                "connect ECONNREFUSED 127.0.0.1:9092",
                "ECONNREFUSED",
            ));
        }
        Ok(())
    }
}

impl BrokerClient for MemoryBroker {
    type Producer = MemoryProducer;
    type Consumer = MemoryConsumer;

    async fn producer(&self, client_id: &str) -> BrokerResult<MemoryProducer> {
        self.check_connect()?;
        debug!(client_id, "producer connected");
        Ok(MemoryProducer {
            shared: self.shared.clone(),
        })
    }

    async fn consumer(&self, client_id: &str, group_id: &str) -> BrokerResult<MemoryConsumer> {
        self.check_connect()?;
        debug!(client_id, group_id, "consumer connected");
        Ok(MemoryConsumer {
            shared: self.shared.clone(),
            tokens: Mutex::new(Vec::new()),
        })
    }

    async fn list_topics(&self) -> BrokerResult<Vec<String>> {
        let mut names: Vec<String> = self.shared.topics().keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn describe_topic(&self, name: &str) -> BrokerResult<TopicMetadata> {
        let topics = self.shared.topics();
        if !topics.contains_key(name) {
            return Err(BrokerError::with_code(
                format!("unknown topic {name}"),
                "UNKNOWN_TOPIC_OR_PARTITION",
            ));
        }
        Ok(TopicMetadata {
            name: name.to_string(),
            partitions: vec![PartitionMetadata {
                id: 0,
                leader: 0,
                replicas: vec![0],
                isr: vec![0],
            }],
            replication_factor: 1,
            config_entries: Vec::new(),
        })
    }
}

#[derive(Debug)]
pub struct MemoryProducer {
    shared: Arc<Shared>,
}

impl BrokerProducer for MemoryProducer {
    async fn send(&self, topic: &str, records: &[ProducerRecord]) -> BrokerResult<()> {
        let latency = {
            let slot = self
                .shared
                .send_latency
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            *slot
        };
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        if self.shared.fail_sends.load(Ordering::Relaxed) {
            return Err(BrokerError::with_code(
                "injected broker failure",
                "KAFKA_STORAGE_ERROR",
            ));
        }

        // Deliver to subscribers outside the lock.
        let deliveries = {
            let mut topics = self.shared.topics();
            let state = topics.entry(topic.to_string()).or_default();
            let base = state.records.len() as i64;

            let mut deliveries = Vec::new();
            for (i, record) in records.iter().enumerate() {
                state.records.push(record.clone());
                let consumed = ConsumedRecord {
                    topic: topic.to_string(),
                    partition: 0,
                    offset: base + i as i64,
                    key: Some(record.key.clone()),
                    value: record.value.clone(),
                };
                for tx in state.subscribers.values() {
                    deliveries.push((tx.clone(), consumed.clone()));
                }
            }
            deliveries
        };

        for (tx, consumed) in deliveries {
            // A full or closed subscriber drops records, like a slow real
            // consumer falling behind.
            let _ = tx.try_send(consumed);
        }

        Ok(())
    }

    async fn disconnect(&self) -> BrokerResult<()> {
        Ok(())
    }
}

#[derive(Debug)]
pub struct MemoryConsumer {
    shared: Arc<Shared>,
    tokens: Mutex<Vec<(String, u64)>>,
}

impl BrokerConsumer for MemoryConsumer {
    async fn subscribe(
        &self,
        topic: &str,
        from_beginning: bool,
    ) -> BrokerResult<mpsc::Receiver<ConsumedRecord>> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let token = self.shared.next_subscriber.fetch_add(1, Ordering::Relaxed);

        {
            let mut topics = self.shared.topics();
            let state = topics.entry(topic.to_string()).or_default();

            if from_beginning {
                for (offset, record) in state.records.iter().enumerate() {
                    let consumed = ConsumedRecord {
                        topic: topic.to_string(),
                        partition: 0,
                        offset: offset as i64,
                        key: Some(record.key.clone()),
                        value: record.value.clone(),
                    };
                    let _ = tx.try_send(consumed);
                }
            }

            state.subscribers.insert(token, tx);
        }

        self.tokens
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push((topic.to_string(), token));

        Ok(rx)
    }

    async fn disconnect(&self) -> BrokerResult<()> {
        let tokens: Vec<(String, u64)> = {
            let mut guard = self
                .tokens
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            std::mem::take(&mut *guard)
        };

        let mut topics = self.shared.topics();
        for (topic, token) in tokens {
            if let Some(state) = topics.get_mut(&topic) {
                state.subscribers.remove(&token);
            }
        }
        Ok(())
    }
}
