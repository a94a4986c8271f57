mod pg;

pub use pg::PgStore;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use reviewd_core::RepoSettings;
use reviewd_core::agent::TraceTurn;

#[derive(Debug, Clone)]
pub struct RepoRecord {
    pub id: Uuid,
    pub full_name: String,
    pub enabled: bool,
    pub settings: RepoSettings,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewStatus {
    Completed,
    Failed,
}

impl ReviewStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReviewStatus::Completed => "completed",
            ReviewStatus::Failed => "failed",
        }
    }
}

/// Terminal record of one agent run, written in a single insert.
#[derive(Debug, Clone)]
pub struct NewReview {
    pub repo_id: Uuid,
    pub pr_number: i64,
    pub pr_title: String,
    pub pr_body: Option<String>,
    pub pr_author: String,
    pub head_ref: String,
    pub base_ref: String,
    pub head_sha: String,
    pub base_sha: String,
    pub status: ReviewStatus,
    pub error_message: Option<String>,
    pub verdict: Option<String>,
    pub summary: String,
    /// Findings list serialized as a JSON blob.
    pub findings: Value,
    pub model: String,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub total_duration_ms: i64,
    pub setup_duration_ms: i64,
    pub sandbox_warm: bool,
    pub files_changed: i32,
    pub lines_added: i64,
    pub lines_removed: i64,
    pub active_skills: Vec<String>,
    /// Credential-scrubbed diff text.
    pub diff_text: String,
    pub system_prompt_hash: String,
}

#[async_trait]
pub trait ReviewStore: Send + Sync {
    async fn ping(&self) -> Result<()>;

    /// Upsert the installation and repository on first contact; existing
    /// rows are returned untouched (enabled flag and settings included).
    async fn ensure_repository(
        &self,
        installation_external_id: i64,
        full_name: &str,
    ) -> Result<RepoRecord>;

    async fn get_repository(&self, full_name: &str) -> Result<Option<RepoRecord>>;

    async fn insert_review(&self, review: &NewReview) -> Result<Uuid>;

    /// Insert the whole trace as one batch. Turn numbers come from the
    /// agent; insertion order is conversation order.
    async fn insert_review_traces(&self, review_id: Uuid, turns: &[TraceTurn]) -> Result<()>;
}

/// In-memory store for tests and database-free local runs.
pub mod memory {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    pub struct MemoryReviewStore {
        repos: Mutex<HashMap<String, RepoRecord>>,
        pub reviews: Mutex<Vec<(Uuid, NewReview)>>,
        pub traces: Mutex<HashMap<Uuid, Vec<TraceTurn>>>,
    }

    impl MemoryReviewStore {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn set_repository(&self, record: RepoRecord) {
            self.repos
                .lock()
                .unwrap()
                .insert(record.full_name.clone(), record);
        }
    }

    #[async_trait]
    impl ReviewStore for MemoryReviewStore {
        async fn ping(&self) -> Result<()> {
            Ok(())
        }

        async fn ensure_repository(
            &self,
            _installation_external_id: i64,
            full_name: &str,
        ) -> Result<RepoRecord> {
            let mut repos = self.repos.lock().unwrap();
            let record = repos.entry(full_name.to_string()).or_insert_with(|| {
                RepoRecord {
                    id: Uuid::new_v4(),
                    full_name: full_name.to_string(),
                    enabled: true,
                    settings: RepoSettings::default(),
                }
            });
            Ok(record.clone())
        }

        async fn get_repository(&self, full_name: &str) -> Result<Option<RepoRecord>> {
            Ok(self.repos.lock().unwrap().get(full_name).cloned())
        }

        async fn insert_review(&self, review: &NewReview) -> Result<Uuid> {
            let id = Uuid::new_v4();
            self.reviews.lock().unwrap().push((id, review.clone()));
            Ok(id)
        }

        async fn insert_review_traces(
            &self,
            review_id: Uuid,
            turns: &[TraceTurn],
        ) -> Result<()> {
            self.traces
                .lock()
                .unwrap()
                .insert(review_id, turns.to_vec());
            Ok(())
        }
    }
}
