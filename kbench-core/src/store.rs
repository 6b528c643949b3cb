use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::engine::{JobStats, now_millis};

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("job store backend error: {0}")]
    Backend(String),
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum JobType {
    Produce,
    Consume,
    LoadtestProducer,
    LoadtestConsumer,
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Durable job record. Once a job leaves the live registry this is the only
/// source of truth for it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub id: String,
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub name: String,
    pub config: serde_json::Value,
    pub stats: JobStats,
    /// Wall-clock unix millis.
    pub start_time: u64,
    pub end_time: Option<u64>,
    pub status: JobStatus,
    pub created_at: u64,
    pub updated_at: u64,
}

#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub job_type: Option<JobType>,
    pub status: Option<JobStatus>,
    /// Inclusive unix-millis bounds on `created_at`.
    pub created_after: Option<u64>,
    pub created_before: Option<u64>,
    pub limit: Option<usize>,
}

/// Aggregate view over the whole history.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSummary {
    pub total: usize,
    pub by_type: HashMap<String, usize>,
    pub by_status: HashMap<String, usize>,
    pub recent: Vec<JobRecord>,
}

/// Durable job store capability. Storage mechanics (schema, indexing) live
/// behind this interface; the engine only creates, updates and reads records.
pub trait JobStore: Send + Sync + 'static {
    fn create(
        &self,
        job_type: JobType,
        name: &str,
        config: serde_json::Value,
        stats: JobStats,
    ) -> impl Future<Output = Result<JobRecord>> + Send;

    /// Merge a stats snapshot and status into the record. Returns `None` for
    /// an unknown job id.
    fn update(
        &self,
        job_id: &str,
        stats: &JobStats,
        status: JobStatus,
    ) -> impl Future<Output = Result<Option<JobRecord>>> + Send;

    fn get(&self, job_id: &str) -> impl Future<Output = Result<Option<JobRecord>>> + Send;

    /// Records matching `filter`, ordered by creation time descending.
    fn list(&self, filter: &JobFilter) -> impl Future<Output = Result<Vec<JobRecord>>> + Send;

    fn delete(&self, job_id: &str) -> impl Future<Output = Result<bool>> + Send;
}

/// `<type>-<yyyymmdd>-<hhmmss>` fallback used when a start request carries no
/// explicit name.
pub fn generate_job_name(job_type: JobType) -> String {
    let now = chrono::Utc::now();
    format!("{}-{}", job_type, now.format("%Y%m%d-%H%M%S"))
}

static JOB_SEQ: AtomicU64 = AtomicU64::new(1);

/// Unique, time-ordered job id.
pub fn generate_job_id() -> String {
    let seq = JOB_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("{}-{seq:04}", now_millis())
}

/// In-memory store: reference implementation and test double. Production
/// deployments put a database behind [`JobStore`] instead.
#[derive(Debug, Default)]
pub struct MemoryJobStore {
    records: Mutex<HashMap<String, JobRecord>>,
}

/// Aggregate counts by type and status plus the ten most recent records.
pub fn summarize(records: &[JobRecord]) -> JobSummary {
    let mut all: Vec<&JobRecord> = records.iter().collect();
    all.sort_by(|a, b| b.created_at.cmp(&a.created_at));

    let mut by_type: HashMap<String, usize> = HashMap::new();
    let mut by_status: HashMap<String, usize> = HashMap::new();
    for record in &all {
        *by_type.entry(record.job_type.to_string()).or_insert(0) += 1;
        *by_status.entry(record.status.to_string()).or_insert(0) += 1;
    }

    JobSummary {
        total: all.len(),
        by_type,
        by_status,
        recent: all.into_iter().take(10).cloned().collect(),
    }
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, JobRecord>> {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl JobStore for MemoryJobStore {
    async fn create(
        &self,
        job_type: JobType,
        name: &str,
        config: serde_json::Value,
        stats: JobStats,
    ) -> Result<JobRecord> {
        let now = now_millis();
        let record = JobRecord {
            id: generate_job_id(),
            job_type,
            name: name.to_string(),
            config,
            stats,
            start_time: now,
            end_time: None,
            status: JobStatus::Running,
            created_at: now,
            updated_at: now,
        };

        self.lock().insert(record.id.clone(), record.clone());
        Ok(record)
    }

    async fn update(
        &self,
        job_id: &str,
        stats: &JobStats,
        status: JobStatus,
    ) -> Result<Option<JobRecord>> {
        let mut records = self.lock();
        let Some(record) = records.get_mut(job_id) else {
            return Ok(None);
        };

        let now = now_millis();
        record.stats = stats.clone();
        record.status = status;
        record.updated_at = now;
        if status.is_terminal() {
            record.end_time = Some(stats.end_time.unwrap_or(now));
        }

        Ok(Some(record.clone()))
    }

    async fn get(&self, job_id: &str) -> Result<Option<JobRecord>> {
        Ok(self.lock().get(job_id).cloned())
    }

    async fn list(&self, filter: &JobFilter) -> Result<Vec<JobRecord>> {
        let records = self.lock();
        let mut out: Vec<JobRecord> = records
            .values()
            .filter(|r| filter.job_type.is_none_or(|t| r.job_type == t))
            .filter(|r| filter.status.is_none_or(|s| r.status == s))
            .filter(|r| filter.created_after.is_none_or(|t| r.created_at >= t))
            .filter(|r| filter.created_before.is_none_or(|t| r.created_at <= t))
            .cloned()
            .collect();

        out.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));

        if let Some(limit) = filter.limit {
            out.truncate(limit);
        }

        Ok(out)
    }

    async fn delete(&self, job_id: &str) -> Result<bool> {
        Ok(self.lock().remove(job_id).is_some())
    }
}
