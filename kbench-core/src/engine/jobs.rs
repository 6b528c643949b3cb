use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{info, warn};

use crate::broker::{
    BrokerClient, BrokerConsumer, BrokerProducer, ErrorCategory, ProducerRecord, TopicMetadata,
};
use crate::events::{ConsumePoint, EventSink, JobEvent, JobSnapshot, ProducePoint, Progress};
use crate::store::{
    JobFilter, JobRecord, JobStatus, JobStore, JobSummary, JobType, generate_job_name, summarize,
};

use super::error::{EngineError, Result};
use super::gate::RunGate;
use super::registry::{JobOutcome, JobRegistry, LiveJob, LogLevel, LogPage};
use super::sequence::MissingReport;
use super::stats::{JobStats, StatsAccumulator};

fn default_prefix() -> String {
    "TEST".to_string()
}

fn default_pad() -> usize {
    2
}

fn default_start() -> u64 {
    1
}

fn default_interval_ms() -> u64 {
    1000
}

fn default_count() -> u64 {
    1
}

fn default_duration_secs() -> u64 {
    60
}

fn default_record_size() -> u64 {
    1024
}

fn default_batch_size() -> u64 {
    1
}

fn default_true() -> bool {
    true
}

/// Inter-record gap for the count-bounded send loop.
const SEND_GAP: Duration = Duration::from_millis(5);

/// Message formatting for the continuous produce loop: values are the prefix
/// followed by a zero-padded counter, one message per interval.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccumulationConfig {
    #[serde(default = "default_prefix")]
    pub prefix: String,
    #[serde(default = "default_pad")]
    pub pad: usize,
    #[serde(default = "default_start")]
    pub start: u64,
    /// Inclusive last sequence; absent means run until stopped.
    #[serde(default)]
    pub end: Option<u64>,
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
}

impl Default for AccumulationConfig {
    fn default() -> Self {
        Self {
            prefix: default_prefix(),
            pad: default_pad(),
            start: default_start(),
            end: None,
            interval_ms: default_interval_ms(),
        }
    }
}

/// Continuous interval-paced producer job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProduceConfig {
    pub topic: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub accumulation: AccumulationConfig,
}

/// One-shot batch send of `count` records.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendConfig {
    pub topic: String,
    #[serde(default = "default_count")]
    pub count: u64,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumeConfig {
    pub topic: String,
    pub group_id: String,
    #[serde(default)]
    pub from_beginning: bool,
    #[serde(default)]
    pub name: Option<String>,
    /// Optional run bounds; absent means run until stopped.
    #[serde(default)]
    pub duration_secs: Option<u64>,
    #[serde(default)]
    pub max_records: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadtestProducerConfig {
    pub topic: String,
    /// Records per second. Absent or zero means send as fast as possible.
    #[serde(default)]
    pub target_throughput: Option<u64>,
    #[serde(default = "default_duration_secs")]
    pub duration_secs: u64,
    #[serde(default = "default_record_size")]
    pub record_size: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: u64,
    #[serde(default)]
    pub compression: Option<String>,
    #[serde(default)]
    pub acks: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadtestConsumerConfig {
    pub topic: String,
    #[serde(default)]
    pub group_id: Option<String>,
    #[serde(default = "default_true")]
    pub from_beginning: bool,
    #[serde(default = "default_duration_secs")]
    pub duration_secs: u64,
    #[serde(default)]
    pub name: Option<String>,
}

/// Live-job view returned by `list_running`: the durable record shape plus a
/// fresh stats snapshot.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunningJob {
    pub id: String,
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub name: String,
    pub config: serde_json::Value,
    pub stats: JobStats,
}

/// Orchestrates benchmark jobs against a broker: starts work loops, tracks
/// them in the registry, persists their history and fans out push updates.
pub struct JobEngine<B: BrokerClient, S: JobStore> {
    broker: Arc<B>,
    store: Arc<S>,
    events: Arc<dyn EventSink>,
    registry: Arc<JobRegistry>,
    client_id: String,
}

impl<B: BrokerClient, S: JobStore> JobEngine<B, S> {
    pub fn new(
        broker: Arc<B>,
        store: Arc<S>,
        events: Arc<dyn EventSink>,
        client_id: impl Into<String>,
    ) -> Self {
        Self {
            broker,
            store,
            events,
            registry: Arc::new(JobRegistry::new()),
            client_id: client_id.into(),
        }
    }

    fn ctx(&self, job: Arc<LiveJob>) -> LoopCtx<S> {
        LoopCtx {
            store: self.store.clone(),
            events: self.events.clone(),
            registry: self.registry.clone(),
            job,
        }
    }

    fn producer_client_id(&self, job_id: &str) -> String {
        format!("{}-producer-{job_id}", self.client_id)
    }

    fn consumer_client_id(&self, job_id: &str) -> String {
        format!("{}-consumer-{job_id}", self.client_id)
    }

    /// Mark a job that failed during setup, before its loop ever ran.
    async fn mark_setup_failed(&self, record_id: &str, mut acc: StatsAccumulator) {
        let stats = acc.finalize();
        if let Err(err) = self.store.update(record_id, &stats, JobStatus::Failed).await {
            warn!(job_id = %record_id, error = %err, "failed to persist setup failure");
        }
    }

    /// Start a continuous producer that emits one accumulation-formatted
    /// message per interval until stopped.
    pub async fn start_produce(&self, config: ProduceConfig) -> Result<JobRecord> {
        if config.topic.is_empty() {
            return Err(EngineError::MissingTopic);
        }

        let name = config
            .name
            .clone()
            .unwrap_or_else(|| generate_job_name(JobType::Produce));
        let record_size = (config.accumulation.prefix.len() + config.accumulation.pad) as u64;
        let acc = StatsAccumulator::new(record_size.max(1), true);
        let config_value = serde_json::to_value(&config)?;

        let record = self
            .store
            .create(JobType::Produce, &name, config_value.clone(), acc.snapshot())
            .await?;

        let producer = match self.broker.producer(&self.producer_client_id(&record.id)).await {
            Ok(p) => p,
            Err(err) => {
                self.mark_setup_failed(&record.id, acc).await;
                return Err(err.into());
            }
        };

        let job = LiveJob::new(record.id.clone(), JobType::Produce, name, config_value, acc);
        job.log(
            LogLevel::Info,
            format!("producer connected, topic {}", config.topic),
        );
        self.registry.register(job.clone());
        info!(job_id = %record.id, topic = %config.topic, "produce job started");

        let ctx = self.ctx(job);
        tokio::spawn(produce_loop(ctx, producer, config));

        Ok(record)
    }

    /// Send `count` records. A single record is sent within this call and the
    /// completed record is returned; larger counts run as a background job.
    pub async fn send_records(&self, config: SendConfig) -> Result<JobRecord> {
        if config.topic.is_empty() {
            return Err(EngineError::MissingTopic);
        }
        if config.count == 0 {
            return Err(EngineError::InvalidCount);
        }

        let name = config
            .name
            .clone()
            .unwrap_or_else(|| generate_job_name(JobType::Produce));
        let message = config
            .message
            .clone()
            .unwrap_or_else(|| "test message".to_string());
        let record_size = send_record(1, &message).value.len() as u64;
        let acc = StatsAccumulator::new(record_size, true);
        let config_value = serde_json::to_value(&config)?;

        let record = self
            .store
            .create(JobType::Produce, &name, config_value.clone(), acc.snapshot())
            .await?;

        let producer = match self.broker.producer(&self.producer_client_id(&record.id)).await {
            Ok(p) => p,
            Err(err) => {
                self.mark_setup_failed(&record.id, acc).await;
                return Err(err.into());
            }
        };

        if config.count == 1 {
            let mut acc = acc;
            let payload = send_record(1, &message);
            let begin = Instant::now();
            let status = match producer.send(&config.topic, std::slice::from_ref(&payload)).await {
                Ok(()) => {
                    let latency = begin.elapsed().as_millis() as u64;
                    acc.record_success(latency, latency, 1);
                    JobStatus::Completed
                }
                Err(err) => {
                    warn!(job_id = %record.id, error = %err, "single send failed");
                    acc.record_failure(ErrorCategory::classify(&err), 1);
                    JobStatus::Failed
                }
            };
            if let Err(err) = producer.disconnect().await {
                warn!(job_id = %record.id, error = %err, "producer disconnect failed");
            }

            let stats = acc.finalize();
            let updated = self.store.update(&record.id, &stats, status).await?;
            self.events.publish(&JobEvent::ProduceComplete(JobSnapshot {
                job_id: record.id.clone(),
                job_type: JobType::Produce,
                stats,
            }));
            return Ok(updated.unwrap_or(record));
        }

        let job = LiveJob::new(record.id.clone(), JobType::Produce, name, config_value, acc);
        self.registry.register(job.clone());
        info!(job_id = %record.id, count = config.count, "batch send started");

        let ctx = self.ctx(job);
        tokio::spawn(send_loop(ctx, producer, config, message));

        Ok(record)
    }

    pub async fn start_consume(&self, config: ConsumeConfig) -> Result<JobRecord> {
        if config.topic.is_empty() {
            return Err(EngineError::MissingTopic);
        }
        if config.group_id.is_empty() {
            return Err(EngineError::MissingGroupId);
        }

        let name = config
            .name
            .clone()
            .unwrap_or_else(|| generate_job_name(JobType::Consume));
        let acc = StatsAccumulator::new(1, false);
        let config_value = serde_json::to_value(&config)?;

        let record = self
            .store
            .create(JobType::Consume, &name, config_value.clone(), acc.snapshot())
            .await?;

        let rx = match self
            .connect_subscription(&record.id, &config.group_id, &config.topic, config.from_beginning)
            .await
        {
            Ok(rx) => rx,
            Err(err) => {
                self.mark_setup_failed(&record.id, acc).await;
                return Err(err);
            }
        };

        let gate = RunGate::new(
            config.max_records,
            config.duration_secs.map(Duration::from_secs),
        );

        let job = LiveJob::new(record.id.clone(), JobType::Consume, name, config_value, acc);
        job.log(
            LogLevel::Info,
            format!("subscribed to {} as {}", config.topic, config.group_id),
        );
        self.registry.register(job.clone());
        info!(job_id = %record.id, topic = %config.topic, group = %config.group_id, "consume job started");

        let ctx = self.ctx(job);
        tokio::spawn(consume_loop(ctx, rx.consumer, rx.receiver, gate));

        Ok(record)
    }

    pub async fn start_loadtest_producer(
        &self,
        config: LoadtestProducerConfig,
    ) -> Result<JobRecord> {
        if config.topic.is_empty() {
            return Err(EngineError::MissingTopic);
        }

        let name = config
            .name
            .clone()
            .unwrap_or_else(|| generate_job_name(JobType::LoadtestProducer));
        let acc = StatsAccumulator::new(config.record_size.max(1), true);
        let config_value = serde_json::to_value(&config)?;

        let record = self
            .store
            .create(
                JobType::LoadtestProducer,
                &name,
                config_value.clone(),
                acc.snapshot(),
            )
            .await?;

        let producer = match self.broker.producer(&self.producer_client_id(&record.id)).await {
            Ok(p) => p,
            Err(err) => {
                self.mark_setup_failed(&record.id, acc).await;
                return Err(err.into());
            }
        };

        let job = LiveJob::new(
            record.id.clone(),
            JobType::LoadtestProducer,
            name,
            config_value,
            acc,
        );
        self.registry.register(job.clone());
        info!(
            job_id = %record.id,
            topic = %config.topic,
            target = config.target_throughput,
            duration_secs = config.duration_secs,
            "loadtest producer started"
        );

        let ctx = self.ctx(job);
        tokio::spawn(loadtest_produce_loop(ctx, producer, config));

        Ok(record)
    }

    pub async fn start_loadtest_consumer(
        &self,
        config: LoadtestConsumerConfig,
    ) -> Result<JobRecord> {
        if config.topic.is_empty() {
            return Err(EngineError::MissingTopic);
        }

        let name = config
            .name
            .clone()
            .unwrap_or_else(|| generate_job_name(JobType::LoadtestConsumer));
        let acc = StatsAccumulator::new(1, false);
        let config_value = serde_json::to_value(&config)?;

        let record = self
            .store
            .create(
                JobType::LoadtestConsumer,
                &name,
                config_value.clone(),
                acc.snapshot(),
            )
            .await?;

        let group_id = config
            .group_id
            .clone()
            .unwrap_or_else(|| format!("{}-loadtest-{}", self.client_id, record.id));

        let rx = match self
            .connect_subscription(&record.id, &group_id, &config.topic, config.from_beginning)
            .await
        {
            Ok(rx) => rx,
            Err(err) => {
                self.mark_setup_failed(&record.id, acc).await;
                return Err(err);
            }
        };

        let gate = RunGate::new(None, Some(Duration::from_secs(config.duration_secs)));

        let job = LiveJob::new(
            record.id.clone(),
            JobType::LoadtestConsumer,
            name,
            config_value,
            acc,
        );
        self.registry.register(job.clone());
        info!(job_id = %record.id, topic = %config.topic, group = %group_id, "loadtest consumer started");

        let ctx = self.ctx(job);
        tokio::spawn(consume_loop(ctx, rx.consumer, rx.receiver, gate));

        Ok(record)
    }

    async fn connect_subscription(
        &self,
        job_id: &str,
        group_id: &str,
        topic: &str,
        from_beginning: bool,
    ) -> Result<Subscription<B::Consumer>> {
        let consumer = self
            .broker
            .consumer(&self.consumer_client_id(job_id), group_id)
            .await?;
        let receiver = match consumer.subscribe(topic, from_beginning).await {
            Ok(rx) => rx,
            Err(err) => {
                if let Err(disc_err) = consumer.disconnect().await {
                    warn!(job_id = %job_id, error = %disc_err, "consumer disconnect failed");
                }
                return Err(err.into());
            }
        };
        Ok(Subscription { consumer, receiver })
    }

    /// Request a stop and wait for teardown. `None` when the job is not live;
    /// already-finished jobs are visible through history instead.
    pub async fn stop(&self, job_id: &str) -> Option<JobOutcome> {
        self.registry.stop_and_wait(job_id).await
    }

    pub fn list_running(&self) -> Vec<RunningJob> {
        let mut jobs: Vec<RunningJob> = self
            .registry
            .list()
            .into_iter()
            .map(|job| RunningJob {
                id: job.id.clone(),
                job_type: job.job_type,
                name: job.name.clone(),
                config: job.config.clone(),
                stats: job.snapshot(),
            })
            .collect();
        jobs.sort_by(|a, b| a.id.cmp(&b.id));
        jobs
    }

    /// Live snapshot when the job is running, otherwise the stored stats.
    pub async fn job_stats(&self, job_id: &str) -> Result<Option<JobStats>> {
        if let Some(job) = self.registry.get(job_id) {
            return Ok(Some(job.snapshot()));
        }
        Ok(self.store.get(job_id).await?.map(|record| record.stats))
    }

    pub fn job_logs(&self, job_id: &str, offset: usize, limit: usize) -> Option<LogPage> {
        let job = self.registry.get(job_id)?;
        let page = job.logs().page(offset, limit);
        Some(page)
    }

    pub fn clear_logs(&self, job_id: &str) -> bool {
        match self.registry.get(job_id) {
            Some(job) => {
                job.logs().clear();
                true
            }
            None => false,
        }
    }

    /// Sequence-gap report for a live consumer job.
    pub fn missing_sequences(
        &self,
        job_id: &str,
        bounds: Option<(u64, u64)>,
    ) -> Option<MissingReport> {
        let job = self.registry.get(job_id)?;
        let report = job.sequences().missing(bounds);
        Some(report)
    }

    pub async fn list_topics(&self) -> Result<Vec<String>> {
        Ok(self.broker.list_topics().await?)
    }

    pub async fn describe_topic(&self, name: &str) -> Result<TopicMetadata> {
        Ok(self.broker.describe_topic(name).await?)
    }

    pub async fn history(&self, filter: &JobFilter) -> Result<Vec<JobRecord>> {
        Ok(self.store.list(filter).await?)
    }

    pub async fn history_record(&self, job_id: &str) -> Result<Option<JobRecord>> {
        Ok(self.store.get(job_id).await?)
    }

    pub async fn delete_history(&self, job_id: &str) -> Result<bool> {
        Ok(self.store.delete(job_id).await?)
    }

    pub async fn history_summary(&self) -> Result<JobSummary> {
        let records = self.store.list(&JobFilter::default()).await?;
        Ok(summarize(&records))
    }
}

struct Subscription<C> {
    consumer: C,
    receiver: tokio::sync::mpsc::Receiver<crate::broker::ConsumedRecord>,
}

/// Everything a spawned work loop needs to report progress and tear down.
struct LoopCtx<S: JobStore> {
    store: Arc<S>,
    events: Arc<dyn EventSink>,
    registry: Arc<JobRegistry>,
    job: Arc<LiveJob>,
}

impl<S: JobStore> LoopCtx<S> {
    fn snapshot_event(&self) -> JobSnapshot {
        JobSnapshot {
            job_id: self.job.id.clone(),
            job_type: self.job.job_type,
            stats: self.job.snapshot(),
        }
    }

    /// Persist the current snapshot and optionally publish an event. Store
    /// failures for intermediate updates are logged and swallowed.
    async fn push_update(&self, event: Option<JobEvent>) {
        let stats = self.job.snapshot();
        if let Err(err) = self
            .store
            .update(&self.job.id, &stats, JobStatus::Running)
            .await
        {
            warn!(job_id = %self.job.id, error = %err, "failed to persist stats update");
        }
        if let Some(event) = event {
            self.events.publish(&event);
        }
    }

    /// Final teardown: freeze stats, write the terminal record, publish the
    /// terminal event, drop out of the registry and release stop waiters.
    /// A failed terminal write still completes teardown; the error rides
    /// along in the outcome.
    async fn finish(self, status: JobStatus, terminal: fn(JobSnapshot) -> JobEvent) {
        let stats = self.job.stats().finalize();

        let persist_error = match self.store.update(&self.job.id, &stats, status).await {
            Ok(_) => None,
            Err(err) => {
                warn!(job_id = %self.job.id, error = %err, "failed to persist final stats");
                Some(err.to_string())
            }
        };

        self.events.publish(&terminal(JobSnapshot {
            job_id: self.job.id.clone(),
            job_type: self.job.job_type,
            stats: stats.clone(),
        }));

        self.registry.remove(&self.job.id);
        info!(job_id = %self.job.id, status = %status, "job finished");
        self.job.finish(JobOutcome {
            stats,
            persist_error,
        });
    }
}

fn send_record(seq: u64, message: &str) -> ProducerRecord {
    let value = serde_json::json!({
        "message": message,
        "timestamp": super::now_millis(),
        "sequence": seq,
    })
    .to_string();
    ProducerRecord {
        key: format!("key-{seq}"),
        value,
    }
}

/// Padding that brings a serialized record value to roughly `record_size`
/// bytes. The envelope itself is small; undersized targets get no padding.
fn filler_for(record_size: u64) -> String {
    let base = serde_json::json!({
        "message": "",
        "timestamp": 0u64,
        "sequence": 0u64,
    })
    .to_string()
    .len() as u64;
    "x".repeat(record_size.saturating_sub(base) as usize)
}

fn extract_sequence(value: &str) -> Option<u64> {
    let parsed: serde_json::Value = serde_json::from_str(value).ok()?;
    parsed.get("sequence")?.as_u64()
}

async fn wait_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Continuous produce loop: one accumulation message per interval tick.
async fn produce_loop<P: BrokerProducer, S: JobStore>(
    ctx: LoopCtx<S>,
    producer: P,
    config: ProduceConfig,
) {
    let acc = &config.accumulation;
    let mut counter = acc.start;
    let mut sent: u64 = 0;

    let mut interval = tokio::time::interval(Duration::from_millis(acc.interval_ms.max(1)));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ctx.job.stop.stopped() => break,
            _ = interval.tick() => {}
        }
        if ctx.job.stop.is_stopped() {
            break;
        }
        if acc.end.is_some_and(|end| counter > end) {
            break;
        }

        let value = format!("{}{:0width$}", acc.prefix, counter, width = acc.pad);
        let record = ProducerRecord {
            key: format!("key-{counter}"),
            value,
        };

        let begin = Instant::now();
        match producer.send(&config.topic, std::slice::from_ref(&record)).await {
            Ok(()) => {
                let latency = begin.elapsed().as_millis() as u64;
                sent += 1;
                let due = ctx.job.stats().record_success(latency, latency, 1);
                ctx.events.publish(&JobEvent::Produce(ProducePoint {
                    job_id: ctx.job.id.clone(),
                    progress: Progress {
                        current: sent,
                        total: 0,
                    },
                    stats: ctx.job.snapshot(),
                }));
                if due {
                    ctx.push_update(None).await;
                }
            }
            Err(err) => {
                ctx.job
                    .log(LogLevel::Error, format!("send failed: {err}"));
                ctx.job
                    .stats()
                    .record_failure(ErrorCategory::classify(&err), 1);
            }
        }
        counter += 1;
    }

    if let Err(err) = producer.disconnect().await {
        warn!(job_id = %ctx.job.id, error = %err, "producer disconnect failed");
    }
    ctx.finish(JobStatus::Completed, JobEvent::ProduceComplete).await;
}

/// Count-bounded send loop for `count > 1`: every record emits a progress
/// event, a failed send never aborts the run.
async fn send_loop<P: BrokerProducer, S: JobStore>(
    ctx: LoopCtx<S>,
    producer: P,
    config: SendConfig,
    message: String,
) {
    for seq in 1..=config.count {
        if ctx.job.stop.is_stopped() {
            break;
        }

        let record = send_record(seq, &message);
        let begin = Instant::now();
        match producer.send(&config.topic, std::slice::from_ref(&record)).await {
            Ok(()) => {
                let latency = begin.elapsed().as_millis() as u64;
                let due = ctx.job.stats().record_success(latency, latency, 1);
                if due {
                    ctx.push_update(None).await;
                }
            }
            Err(err) => {
                ctx.job
                    .log(LogLevel::Error, format!("send {seq} failed: {err}"));
                ctx.job
                    .stats()
                    .record_failure(ErrorCategory::classify(&err), 1);
            }
        }

        ctx.events.publish(&JobEvent::Produce(ProducePoint {
            job_id: ctx.job.id.clone(),
            progress: Progress {
                current: seq,
                total: config.count,
            },
            stats: ctx.job.snapshot(),
        }));

        // Small gap between records so a large count cannot starve the
        // runtime of everything else.
        if seq < config.count {
            tokio::select! {
                _ = ctx.job.stop.stopped() => break,
                _ = tokio::time::sleep(SEND_GAP) => {}
            }
        }
    }

    if let Err(err) = producer.disconnect().await {
        warn!(job_id = %ctx.job.id, error = %err, "producer disconnect failed");
    }
    ctx.finish(JobStatus::Completed, JobEvent::ProduceComplete).await;
}

/// Rate-controlled loadtest produce loop. With a target throughput each batch
/// is scheduled on a fixed cadence; without one the loop only yields between
/// batches.
async fn loadtest_produce_loop<P: BrokerProducer, S: JobStore>(
    ctx: LoopCtx<S>,
    producer: P,
    config: LoadtestProducerConfig,
) {
    let gate = RunGate::new(None, Some(Duration::from_secs(config.duration_secs.max(1))));
    let batch = config.batch_size.max(1);
    let pace = config
        .target_throughput
        .filter(|&tps| tps > 0)
        .map(|tps| Duration::from_secs_f64(batch as f64 / tps as f64));
    let filler = filler_for(config.record_size);

    let mut seq: u64 = 0;
    let mut next_send = Instant::now();

    while gate.next() {
        if ctx.job.stop.is_stopped() {
            break;
        }

        let records: Vec<ProducerRecord> = (0..batch)
            .map(|_| {
                seq += 1;
                ProducerRecord {
                    key: format!("key-{seq}"),
                    value: serde_json::json!({
                        "message": filler,
                        "timestamp": super::now_millis(),
                        "sequence": seq,
                    })
                    .to_string(),
                }
            })
            .collect();

        let begin = Instant::now();
        match producer.send(&config.topic, &records).await {
            Ok(()) => {
                let latency = begin.elapsed().as_millis() as u64;
                let due = ctx.job.stats().record_success(latency, latency, batch);
                if due {
                    let event = JobEvent::LoadtestStats(ctx.snapshot_event());
                    ctx.push_update(Some(event)).await;
                }
            }
            Err(err) => {
                ctx.job
                    .log(LogLevel::Error, format!("batch send failed: {err}"));
                ctx.job
                    .stats()
                    .record_failure(ErrorCategory::classify(&err), batch);
            }
        }

        match pace {
            Some(pace) => {
                next_send += pace;
                tokio::select! {
                    _ = ctx.job.stop.stopped() => break,
                    _ = tokio::time::sleep_until(next_send) => {}
                }
            }
            None => tokio::task::yield_now().await,
        }
    }

    if let Err(err) = producer.disconnect().await {
        warn!(job_id = %ctx.job.id, error = %err, "producer disconnect failed");
    }
    ctx.finish(JobStatus::Completed, JobEvent::LoadtestComplete)
        .await;
}

/// Shared consume loop for plain consumers and loadtest consumers. Bounds
/// are checked after each record is counted, so the record that arrives at
/// the deadline or at the count bound still lands in the totals before the
/// loop exits.
async fn consume_loop<C: BrokerConsumer, S: JobStore>(
    ctx: LoopCtx<S>,
    consumer: C,
    mut receiver: tokio::sync::mpsc::Receiver<crate::broker::ConsumedRecord>,
    gate: RunGate,
) {
    let deadline = gate.deadline();
    let is_loadtest = ctx.job.job_type == JobType::LoadtestConsumer;

    loop {
        // Biased: deliveries already queued drain ahead of an elapsed
        // deadline, so none of them go uncounted.
        let record = tokio::select! {
            biased;
            _ = ctx.job.stop.stopped() => break,
            record = receiver.recv() => match record {
                Some(record) => record,
                None => break,
            },
            _ = wait_deadline(deadline) => break,
        };

        if let Some(seq) = extract_sequence(&record.value) {
            let unique = {
                let mut seqs = ctx.job.sequences();
                seqs.insert(seq);
                seqs.len() as u64
            };
            ctx.job.stats().set_unique_sequences(unique);
        }

        let due = ctx.job.stats().record_received(1);
        if due {
            let event = if is_loadtest {
                JobEvent::LoadtestStats(ctx.snapshot_event())
            } else {
                JobEvent::Consume(ConsumePoint {
                    job_id: ctx.job.id.clone(),
                    topic: record.topic.clone(),
                    partition: record.partition,
                    offset: record.offset,
                    stats: ctx.job.snapshot(),
                })
            };
            ctx.push_update(Some(event)).await;
        }

        if gate.complete_one() {
            break;
        }
        if gate.expired() {
            break;
        }
    }

    if let Err(err) = consumer.disconnect().await {
        warn!(job_id = %ctx.job.id, error = %err, "consumer disconnect failed");
    }
    let terminal = if is_loadtest {
        JobEvent::LoadtestComplete
    } else {
        JobEvent::ConsumeComplete
    };
    ctx.finish(JobStatus::Completed, terminal).await;
}
