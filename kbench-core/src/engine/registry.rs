use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::watch;

use crate::store::JobType;

use super::gate::StopToken;
use super::sequence::SequenceSet;
use super::stats::{JobStats, StatsAccumulator};

/// Cap on retained per-job log lines. Oldest lines are evicted first; the
/// `total` counter keeps counting so clients can tell lines were dropped.
const MAX_JOB_LOGS: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub id: u64,
    /// Wall-clock unix millis.
    pub timestamp: u64,
    pub level: LogLevel,
    pub message: String,
}

/// Bounded in-memory log ring for one job.
#[derive(Debug, Default)]
pub struct JobLogs {
    entries: VecDeque<LogEntry>,
    next_id: u64,
    total: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogPage {
    pub entries: Vec<LogEntry>,
    pub total: u64,
}

impl JobLogs {
    pub fn push(&mut self, level: LogLevel, message: impl Into<String>) {
        let entry = LogEntry {
            id: self.next_id,
            timestamp: super::now_millis(),
            level,
            message: message.into(),
        };
        self.next_id += 1;
        self.total += 1;

        self.entries.push_back(entry);
        while self.entries.len() > MAX_JOB_LOGS {
            self.entries.pop_front();
        }
    }

    /// Page of retained entries, oldest first. `offset` indexes into the
    /// retained window, not the all-time stream.
    pub fn page(&self, offset: usize, limit: usize) -> LogPage {
        let entries = self
            .entries
            .iter()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect();
        LogPage {
            entries,
            total: self.total,
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Final result of a stopped job: the frozen stats, plus the persistence
/// error when the terminal store write failed. The job is still fully torn
/// down in that case; only the history record is stale.
#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub stats: JobStats,
    pub persist_error: Option<String>,
}

/// One live job: everything its work loop and outside observers share.
/// Dropped from the registry the moment the loop finishes tearing down.
#[derive(Debug)]
pub struct LiveJob {
    pub id: String,
    pub job_type: JobType,
    pub name: String,
    pub config: serde_json::Value,

    stats: Mutex<StatsAccumulator>,
    logs: Mutex<JobLogs>,
    sequences: Mutex<SequenceSet>,

    pub stop: StopToken,
    finished: watch::Sender<bool>,
    outcome: Mutex<Option<JobOutcome>>,
}

impl LiveJob {
    pub fn new(
        id: String,
        job_type: JobType,
        name: String,
        config: serde_json::Value,
        stats: StatsAccumulator,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            job_type,
            name,
            config,
            stats: Mutex::new(stats),
            logs: Mutex::new(JobLogs::default()),
            sequences: Mutex::new(SequenceSet::default()),
            stop: StopToken::new(),
            finished: watch::Sender::new(false),
            outcome: Mutex::new(None),
        })
    }

    pub fn stats(&self) -> MutexGuard<'_, StatsAccumulator> {
        self.stats
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn logs(&self) -> MutexGuard<'_, JobLogs> {
        self.logs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn sequences(&self) -> MutexGuard<'_, SequenceSet> {
        self.sequences
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn snapshot(&self) -> JobStats {
        self.stats().snapshot()
    }

    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.logs().push(level, message);
    }

    /// Publish the final outcome and release everyone blocked in
    /// [`JobRegistry::stop_and_wait`]. Called exactly once, by the work loop.
    pub fn finish(&self, outcome: JobOutcome) {
        {
            let mut slot = self
                .outcome
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            *slot = Some(outcome);
        }
        self.finished.send_replace(true);
    }

    pub fn outcome(&self) -> Option<JobOutcome> {
        self.outcome
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    async fn wait_finished(&self) {
        let mut rx = self.finished.subscribe();
        // Only fails if the sender is dropped, and we hold it.
        let _ = rx.wait_for(|done| *done).await;
    }
}

/// All currently running jobs, keyed by job id.
#[derive(Debug, Default)]
pub struct JobRegistry {
    jobs: DashMap<String, Arc<LiveJob>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, job: Arc<LiveJob>) {
        self.jobs.insert(job.id.clone(), job);
    }

    pub fn get(&self, job_id: &str) -> Option<Arc<LiveJob>> {
        self.jobs.get(job_id).map(|entry| entry.value().clone())
    }

    pub fn remove(&self, job_id: &str) {
        self.jobs.remove(job_id);
    }

    pub fn list(&self) -> Vec<Arc<LiveJob>> {
        self.jobs.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Request a stop and wait for the work loop to finish tearing down.
    /// Idempotent: concurrent and repeated calls all get the same outcome.
    /// `None` when no such job is live.
    pub async fn stop_and_wait(&self, job_id: &str) -> Option<JobOutcome> {
        let job = self.get(job_id)?;
        job.stop.stop();
        job.wait_finished().await;
        job.outcome()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn live(id: &str) -> Arc<LiveJob> {
        LiveJob::new(
            id.to_string(),
            JobType::LoadtestProducer,
            format!("{id}-name"),
            serde_json::Value::Null,
            StatsAccumulator::new(100, true),
        )
    }

    #[test]
    fn logs_are_capped_but_total_keeps_counting() {
        let mut logs = JobLogs::default();
        for i in 0..(MAX_JOB_LOGS + 50) {
            logs.push(LogLevel::Info, format!("line {i}"));
        }

        assert_eq!(logs.len(), MAX_JOB_LOGS);
        assert_eq!(logs.total, (MAX_JOB_LOGS + 50) as u64);

        let page = logs.page(0, 1);
        // Oldest retained line is the 51st ever written.
        assert_eq!(page.entries[0].message, "line 50");
        assert_eq!(page.total, (MAX_JOB_LOGS + 50) as u64);
    }

    #[test]
    fn log_paging_windows_the_retained_entries() {
        let mut logs = JobLogs::default();
        for i in 0..10 {
            logs.push(LogLevel::Info, format!("line {i}"));
        }

        let page = logs.page(4, 3);
        assert_eq!(page.entries.len(), 3);
        assert_eq!(page.entries[0].message, "line 4");
        assert_eq!(page.entries[2].message, "line 6");
    }

    #[test]
    fn clear_keeps_the_total() {
        let mut logs = JobLogs::default();
        logs.push(LogLevel::Warn, "a");
        logs.push(LogLevel::Error, "b");
        logs.clear();

        assert!(logs.is_empty());
        assert_eq!(logs.page(0, 10).total, 2);
    }

    #[test]
    fn register_get_remove() {
        let registry = JobRegistry::new();
        registry.register(live("j1"));
        registry.register(live("j2"));

        assert_eq!(registry.len(), 2);
        assert!(registry.get("j1").is_some());
        registry.remove("j1");
        assert!(registry.get("j1").is_none());
        assert_eq!(registry.list().len(), 1);
    }

    #[tokio::test]
    async fn stop_and_wait_returns_outcome_once_loop_finishes() {
        let registry = std::sync::Arc::new(JobRegistry::new());
        let job = live("j1");
        registry.register(job.clone());

        let loop_job = job.clone();
        let worker = tokio::spawn(async move {
            loop_job.stop.stopped().await;
            let stats = loop_job.stats().finalize();
            loop_job.finish(JobOutcome {
                stats,
                persist_error: None,
            });
        });

        let outcome = registry.stop_and_wait("j1").await;
        match outcome {
            Some(outcome) => {
                assert!(!outcome.stats.running);
                assert!(outcome.persist_error.is_none());
            }
            None => panic!("job should be live"),
        }

        if let Err(err) = worker.await {
            panic!("worker panicked: {err}");
        }
    }

    #[tokio::test]
    async fn stop_and_wait_unknown_job_is_none() {
        let registry = JobRegistry::new();
        assert!(registry.stop_and_wait("missing").await.is_none());
    }

    #[tokio::test]
    async fn repeated_stop_returns_same_outcome() {
        let registry = JobRegistry::new();
        let job = live("j1");
        registry.register(job.clone());

        let stats = job.stats().finalize();
        job.stop.stop();
        job.finish(JobOutcome {
            stats,
            persist_error: Some("backend offline".to_string()),
        });

        for _ in 0..3 {
            match registry.stop_and_wait("j1").await {
                Some(outcome) => {
                    assert_eq!(outcome.persist_error.as_deref(), Some("backend offline"));
                }
                None => panic!("job should still be registered"),
            }
        }
    }
}
