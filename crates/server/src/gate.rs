use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tracing::info;

/// Status of one dedup ledger row. Transitions are monotonic except
/// queued -> superseded and processing -> done/failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Queued,
    Processing,
    Superseded,
    Done,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Superseded => "superseded",
            JobStatus::Done => "done",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(JobStatus::Queued),
            "processing" => Some(JobStatus::Processing),
            "superseded" => Some(JobStatus::Superseded),
            "done" => Some(JobStatus::Done),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }
}

/// Storage for the per-(repo, pr, sha) ingestion ledger.
#[async_trait]
pub trait DedupStore: Send + Sync {
    /// None when the repository has never been seen.
    async fn repo_enabled(&self, repo: &str) -> Result<Option<bool>>;

    /// Insert a row with status `queued`. Returns false on the UNIQUE
    /// violation that signals a duplicate.
    async fn insert_dedup_row(&self, repo: &str, pr: i64, sha: &str) -> Result<bool>;

    /// Rows for this repository created after `since`.
    async fn count_since(&self, repo: &str, since: DateTime<Utc>) -> Result<i64>;

    async fn set_status(&self, repo: &str, pr: i64, sha: &str, status: JobStatus) -> Result<()>;

    /// Demote every other still-queued sha on the same PR.
    async fn supersede_others(&self, repo: &str, pr: i64, keep_sha: &str) -> Result<u64>;

    async fn status(&self, repo: &str, pr: i64, sha: &str) -> Result<Option<JobStatus>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    RepoDisabled,
    DuplicateSha,
    RateLimited,
}

impl DenyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DenyReason::RepoDisabled => "repo_disabled",
            DenyReason::DuplicateSha => "duplicate_sha",
            DenyReason::RateLimited => "rate_limited",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    Allowed,
    Denied(DenyReason),
}

/// The ingestion gate: one call per webhook, deciding idempotency,
/// quota, and supersession in that order.
pub struct Gate {
    store: Arc<dyn DedupStore>,
    max_per_repo_per_hour: i64,
}

impl Gate {
    pub fn new(store: Arc<dyn DedupStore>, max_per_repo_per_hour: i64) -> Self {
        Self {
            store,
            max_per_repo_per_hour,
        }
    }

    pub async fn try_enqueue(&self, repo: &str, pr: i64, sha: &str) -> Result<GateDecision> {
        if self.store.repo_enabled(repo).await? == Some(false) {
            return Ok(GateDecision::Denied(DenyReason::RepoDisabled));
        }

        // UNIQUE on (repo, pr, sha) makes this the only race-prone step:
        // concurrent webhooks get exactly one winner.
        if !self.store.insert_dedup_row(repo, pr, sha).await? {
            return Ok(GateDecision::Denied(DenyReason::DuplicateSha));
        }

        // Insert-then-count makes the quota self-inclusive; strictly
        // greater than the limit lets exactly `max` through.
        let hour_ago = Utc::now() - Duration::hours(1);
        let recent = self.store.count_since(repo, hour_ago).await?;
        if recent > self.max_per_repo_per_hour {
            self.store
                .set_status(repo, pr, sha, JobStatus::Failed)
                .await?;
            return Ok(GateDecision::Denied(DenyReason::RateLimited));
        }

        let superseded = self.store.supersede_others(repo, pr, sha).await?;
        if superseded > 0 {
            info!(repo, pr, sha, superseded, "superseded older queued commits");
        }
        Ok(GateDecision::Allowed)
    }

    /// Cheap pre-flight for the worker. A missing row is not superseded:
    /// rows older than the ledger must still run.
    pub async fn is_job_superseded(&self, repo: &str, pr: i64, sha: &str) -> Result<bool> {
        Ok(self.store.status(repo, pr, sha).await? == Some(JobStatus::Superseded))
    }

    pub async fn mark_job_processing(&self, repo: &str, pr: i64, sha: &str) -> Result<()> {
        self.store
            .set_status(repo, pr, sha, JobStatus::Processing)
            .await
    }

    pub async fn mark_job_done(
        &self,
        repo: &str,
        pr: i64,
        sha: &str,
        status: JobStatus,
    ) -> Result<()> {
        self.store.set_status(repo, pr, sha, status).await
    }
}

/// In-memory ledger used by tests and local runs without a database.
pub mod memory {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::*;

    #[derive(Debug, Clone)]
    struct Row {
        status: JobStatus,
        created_at: DateTime<Utc>,
    }

    #[derive(Default)]
    pub struct MemoryDedupStore {
        rows: Mutex<HashMap<(String, i64, String), Row>>,
        repos: Mutex<HashMap<String, bool>>,
    }

    impl MemoryDedupStore {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn set_repo_enabled(&self, repo: &str, enabled: bool) {
            self.repos.lock().unwrap().insert(repo.to_string(), enabled);
        }

        /// Backdate a row, for quota-window tests.
        pub fn age_row(&self, repo: &str, pr: i64, sha: &str, age: Duration) {
            let mut rows = self.rows.lock().unwrap();
            if let Some(row) = rows.get_mut(&(repo.to_string(), pr, sha.to_string())) {
                row.created_at = Utc::now() - age;
            }
        }

        pub fn non_failed_count(&self, repo: &str) -> usize {
            self.rows
                .lock()
                .unwrap()
                .iter()
                .filter(|((r, _, _), row)| r == repo && row.status != JobStatus::Failed)
                .count()
        }
    }

    #[async_trait]
    impl DedupStore for MemoryDedupStore {
        async fn repo_enabled(&self, repo: &str) -> Result<Option<bool>> {
            Ok(self.repos.lock().unwrap().get(repo).copied())
        }

        async fn insert_dedup_row(&self, repo: &str, pr: i64, sha: &str) -> Result<bool> {
            let mut rows = self.rows.lock().unwrap();
            let key = (repo.to_string(), pr, sha.to_string());
            if rows.contains_key(&key) {
                return Ok(false);
            }
            rows.insert(
                key,
                Row {
                    status: JobStatus::Queued,
                    created_at: Utc::now(),
                },
            );
            Ok(true)
        }

        async fn count_since(&self, repo: &str, since: DateTime<Utc>) -> Result<i64> {
            Ok(self
                .rows
                .lock()
                .unwrap()
                .iter()
                .filter(|((r, _, _), row)| r == repo && row.created_at > since)
                .count() as i64)
        }

        async fn set_status(
            &self,
            repo: &str,
            pr: i64,
            sha: &str,
            status: JobStatus,
        ) -> Result<()> {
            let mut rows = self.rows.lock().unwrap();
            if let Some(row) = rows.get_mut(&(repo.to_string(), pr, sha.to_string())) {
                row.status = status;
            }
            Ok(())
        }

        async fn supersede_others(&self, repo: &str, pr: i64, keep_sha: &str) -> Result<u64> {
            let mut rows = self.rows.lock().unwrap();
            let mut count = 0;
            for ((r, p, s), row) in rows.iter_mut() {
                if r == repo && *p == pr && s != keep_sha && row.status == JobStatus::Queued {
                    row.status = JobStatus::Superseded;
                    count += 1;
                }
            }
            Ok(count)
        }

        async fn status(&self, repo: &str, pr: i64, sha: &str) -> Result<Option<JobStatus>> {
            Ok(self
                .rows
                .lock()
                .unwrap()
                .get(&(repo.to_string(), pr, sha.to_string()))
                .map(|row| row.status))
        }
    }
}
