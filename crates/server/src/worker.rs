use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use reviewd_core::agent::{AgentOutcome, ReviewAgent};
use reviewd_core::diff::{diff_stats, extract_changed_files};
use reviewd_core::error::SandboxError;
use reviewd_core::exec::Executor;
use reviewd_core::redact::scrub_credentials;
use reviewd_core::sandbox::{SandboxController, SetupOutcome};
use reviewd_core::skills::{self, Composition};
use reviewd_core::PrContext;
use reviewd_core::tools::{ToolContext, ToolRegistry};
use reviewd_provider::Provider;

use crate::gate::{Gate, JobStatus};
use crate::job::{ReviewJob, validate_job};
use crate::publisher::{ForgeClient, RunStats, build_review_post};
use crate::queue::{JobQueue, QueuedJob};
use crate::store::{NewReview, ReviewStatus, ReviewStore};

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_id: String,
    pub batch_size: i64,
    pub min_poll_interval: Duration,
    pub max_poll_interval: Duration,
    pub heartbeat_interval: Duration,
    pub model: String,
    /// Token injected into the clone URL; minted upstream.
    pub forge_token: Option<String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", uuid::Uuid::new_v4()),
            batch_size: 4,
            min_poll_interval: Duration::from_millis(250),
            max_poll_interval: Duration::from_secs(15),
            heartbeat_interval: Duration::from_secs(60),
            model: String::new(),
            forge_token: None,
        }
    }
}

/// What to do with the queue message after one processing attempt.
enum Disposition {
    /// Finished, or poison that retrying cannot help.
    Ack,
    /// Transient failure; ask the queue to redeliver.
    Retry(String),
}

pub struct ReviewWorker {
    queue: Arc<dyn JobQueue>,
    gate: Arc<Gate>,
    store: Arc<dyn ReviewStore>,
    forge: Arc<dyn ForgeClient>,
    provider: Arc<dyn Provider>,
    executor: Arc<dyn Executor>,
    sandbox: SandboxController,
    registry: ToolRegistry,
    http: reqwest::Client,
    config: WorkerConfig,
}

impl ReviewWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queue: Arc<dyn JobQueue>,
        gate: Arc<Gate>,
        store: Arc<dyn ReviewStore>,
        forge: Arc<dyn ForgeClient>,
        provider: Arc<dyn Provider>,
        executor: Arc<dyn Executor>,
        sandbox_root: impl Into<String>,
        config: WorkerConfig,
    ) -> Self {
        let sandbox = SandboxController::new(executor.clone(), sandbox_root);
        Self {
            queue,
            gate,
            store,
            forge,
            provider,
            executor,
            sandbox,
            registry: ToolRegistry::builtin(),
            http: reqwest::Client::new(),
            config,
        }
    }

    /// Poll until cancelled, backing off while the queue is empty.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(worker_id = %self.config.worker_id, "review worker started");
        let mut idle = self.config.min_poll_interval;

        while !cancel.is_cancelled() {
            match self.tick().await {
                Ok(0) => {
                    tokio::select! {
                        _ = tokio::time::sleep(idle) => {}
                        _ = cancel.cancelled() => break,
                    }
                    idle = (idle * 2).min(self.config.max_poll_interval);
                }
                Ok(_) => idle = self.config.min_poll_interval,
                Err(err) => {
                    error!(error = %err, "queue poll failed");
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.max_poll_interval) => {}
                        _ = cancel.cancelled() => break,
                    }
                }
            }
        }
        info!(worker_id = %self.config.worker_id, "review worker stopped");
    }

    /// Claim one batch and process it. Returns how many jobs were handled.
    pub async fn tick(&self) -> Result<usize> {
        let jobs = self
            .queue
            .claim(&self.config.worker_id, self.config.batch_size)
            .await?;
        let count = jobs.len();

        for job in jobs {
            let heartbeat = self.spawn_heartbeat(job.id);
            let disposition = self.process(&job).await;
            heartbeat.cancel();
            match disposition {
                Disposition::Ack => self.queue.ack(job.id).await?,
                Disposition::Retry(err) => self.queue.retry(job.id, &err).await?,
            }
        }
        Ok(count)
    }

    fn spawn_heartbeat(&self, job_id: uuid::Uuid) -> CancellationToken {
        let token = CancellationToken::new();
        let guard = token.clone();
        let queue = self.queue.clone();
        let interval = self.config.heartbeat_interval;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        if let Err(err) = queue.heartbeat(job_id).await {
                            warn!(job_id = %job_id, error = %err, "heartbeat failed");
                        }
                    }
                    _ = guard.cancelled() => break,
                }
            }
        });
        token
    }

    async fn process(&self, queued: &QueuedJob) -> Disposition {
        let job = match validate_job(&queued.payload) {
            Ok(job) => job,
            Err(err) => {
                // Poison: a malformed payload will never validate, so it
                // is dropped, not retried.
                warn!(job_id = %queued.id, error = %err, "discarding malformed job payload");
                return Disposition::Ack;
            }
        };

        let repo = job.repo_full_name.as_str();
        match self
            .gate
            .is_job_superseded(repo, job.pr_number, &job.head_sha)
            .await
        {
            Ok(true) => {
                info!(repo, pr = job.pr_number, sha = %job.head_sha, "job superseded, skipping");
                return Disposition::Ack;
            }
            Ok(false) => {}
            Err(err) => return Disposition::Retry(err.to_string()),
        }

        if let Err(err) = self
            .gate
            .mark_job_processing(repo, job.pr_number, &job.head_sha)
            .await
        {
            return Disposition::Retry(err.to_string());
        }

        match self.review(&job).await {
            Ok(()) => {
                if let Err(err) = self
                    .gate
                    .mark_job_done(repo, job.pr_number, &job.head_sha, JobStatus::Done)
                    .await
                {
                    return Disposition::Retry(err.to_string());
                }
                Disposition::Ack
            }
            Err(failure) => {
                let message = scrub_credentials(&failure.message);
                error!(repo, pr = job.pr_number, error = %message, "review failed");
                let _ = self
                    .gate
                    .mark_job_done(repo, job.pr_number, &job.head_sha, JobStatus::Failed)
                    .await;
                if failure.retryable {
                    Disposition::Retry(message)
                } else {
                    Disposition::Ack
                }
            }
        }
    }

    async fn review(&self, job: &ReviewJob) -> std::result::Result<(), Failure> {
        let repo_record = self
            .store
            .ensure_repository(job.installation_id, &job.repo_full_name)
            .await
            .map_err(Failure::transient)?;
        if !repo_record.enabled {
            info!(repo = %job.repo_full_name, "repository disabled, skipping review");
            return Ok(());
        }

        let token = self.config.forge_token.clone().unwrap_or_default();
        let setup = self
            .sandbox
            .setup(
                &job.repo_full_name,
                &job.clone_url,
                &job.head_ref,
                &job.head_sha,
                &token,
            )
            .await
            .map_err(Failure::from_sandbox)?;

        let diff = self
            .sandbox
            .diff_since(&job.repo_full_name, &job.base_sha)
            .await
            .map_err(Failure::from_sandbox)?;

        let changed_files = skills::apply_ignore_globs(
            &extract_changed_files(&diff),
            &repo_record.settings.ignore_globs,
        );

        let pr = PrContext {
            repo_full_name: job.repo_full_name.clone(),
            pr_number: job.pr_number,
            title: job.pr_title.clone(),
            body: job.pr_body.clone(),
            author: job.pr_author.clone(),
            head_ref: job.head_ref.clone(),
            head_sha: job.head_sha.clone(),
            base_ref: job.base_ref.clone(),
            base_sha: job.base_sha.clone(),
        };
        let composition = skills::compose(&changed_files, &pr, &repo_record.settings, |name| {
            self.registry.contains(name)
        });

        let tool_ctx = ToolContext {
            executor: self.executor.clone(),
            workdir: self.sandbox.workdir(&job.repo_full_name),
            base_sha: job.base_sha.clone(),
            http: self.http.clone(),
        };

        let agent = ReviewAgent::new(self.provider.as_ref(), &self.registry, self.config.model.clone());
        let outcome = match agent
            .run(&composition, &tool_ctx, &diff, changed_files.len())
            .await
        {
            Ok(outcome) => outcome,
            Err(err) => {
                // Record the failed run, then let the queue retry it.
                let _ = self
                    .store
                    .insert_review(&self.failed_review(
                        job,
                        &repo_record.id,
                        &setup,
                        &diff,
                        &composition,
                        &err.to_string(),
                    ))
                    .await;
                return Err(Failure::transient(err));
            }
        };

        let stats = RunStats {
            iterations: outcome.iterations,
            input_tokens: outcome.input_tokens,
            output_tokens: outcome.output_tokens,
            wall_time_ms: outcome.duration.as_millis() as u64,
        };
        let post = build_review_post(
            &job.repo_full_name,
            job.pr_number,
            &job.head_sha,
            &outcome.review,
            &composition.active_skill_names,
            stats,
        );
        self.forge
            .post_review(&post)
            .await
            .map_err(Failure::transient)?;

        let review_id = self
            .store
            .insert_review(&self.completed_review(
                job,
                &repo_record.id,
                &setup,
                &diff,
                &composition,
                &outcome,
            ))
            .await
            .map_err(Failure::transient)?;
        self.store
            .insert_review_traces(review_id, &outcome.trace)
            .await
            .map_err(Failure::transient)?;

        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn completed_review(
        &self,
        job: &ReviewJob,
        repo_id: &uuid::Uuid,
        setup: &SetupOutcome,
        diff: &str,
        composition: &Composition,
        outcome: &AgentOutcome,
    ) -> NewReview {
        let mut review = self.base_review(job, repo_id, setup, diff, composition);
        review.status = ReviewStatus::Completed;
        review.verdict = Some(outcome.review.verdict.as_str().to_string());
        review.summary = outcome.review.summary.clone();
        review.findings = serde_json::to_value(&outcome.review.findings).unwrap_or_default();
        review.input_tokens = outcome.input_tokens as i64;
        review.output_tokens = outcome.output_tokens as i64;
        review.total_duration_ms = outcome.duration.as_millis() as i64;
        review
    }

    #[allow(clippy::too_many_arguments)]
    fn failed_review(
        &self,
        job: &ReviewJob,
        repo_id: &uuid::Uuid,
        setup: &SetupOutcome,
        diff: &str,
        composition: &Composition,
        error: &str,
    ) -> NewReview {
        let mut review = self.base_review(job, repo_id, setup, diff, composition);
        review.status = ReviewStatus::Failed;
        review.error_message = Some(scrub_credentials(error));
        review
    }

    fn base_review(
        &self,
        job: &ReviewJob,
        repo_id: &uuid::Uuid,
        setup: &SetupOutcome,
        diff: &str,
        composition: &Composition,
    ) -> NewReview {
        let (lines_added, lines_removed) = diff_stats(diff);
        NewReview {
            repo_id: *repo_id,
            pr_number: job.pr_number,
            pr_title: job.pr_title.clone(),
            pr_body: job.pr_body.clone(),
            pr_author: job.pr_author.clone(),
            head_ref: job.head_ref.clone(),
            base_ref: job.base_ref.clone(),
            head_sha: job.head_sha.clone(),
            base_sha: job.base_sha.clone(),
            status: ReviewStatus::Failed,
            error_message: None,
            verdict: None,
            summary: String::new(),
            findings: serde_json::Value::Array(vec![]),
            model: self.config.model.clone(),
            input_tokens: 0,
            output_tokens: 0,
            total_duration_ms: 0,
            setup_duration_ms: setup.duration.as_millis() as i64,
            sandbox_warm: !setup.cloned,
            files_changed: extract_changed_files(diff).len() as i32,
            lines_added: lines_added as i64,
            lines_removed: lines_removed as i64,
            active_skills: composition.active_skill_names.clone(),
            diff_text: scrub_credentials(diff),
            system_prompt_hash: sha256_hex(&composition.system_prompt),
        }
    }
}

pub fn sha256_hex(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}

struct Failure {
    message: String,
    retryable: bool,
}

impl Failure {
    fn transient(err: impl std::fmt::Display) -> Self {
        Self {
            message: err.to_string(),
            retryable: true,
        }
    }

    fn from_sandbox(err: SandboxError) -> Self {
        // Argument-validation failures will fail identically on every
        // redelivery; only infrastructure failures are worth a retry.
        let retryable = !matches!(
            err,
            SandboxError::InvalidRef(_)
                | SandboxError::InvalidSha(_)
                | SandboxError::InvalidCloneUrl
        );
        Self {
            message: err.to_string(),
            retryable,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use serde_json::json;

    use reviewd_core::exec::{ExecError, ExecOutput, ExecRequest};
    use reviewd_provider::{
        ChatRequest, ChatResponse, ContentPart, Message, StopReason, Usage,
    };

    use reviewd_core::RepoSettings;

    use crate::gate::DedupStore;
    use crate::gate::memory::MemoryDedupStore;
    use crate::publisher::ForgeEvent;
    use crate::publisher::recording::RecordingForge;
    use crate::queue::memory::MemoryJobQueue;
    use crate::store::memory::MemoryReviewStore;

    const SAMPLE_DIFF: &str = "\
diff --git a/src/lib.rs b/src/lib.rs
--- a/src/lib.rs
+++ b/src/lib.rs
@@ -1 +1,2 @@
 fn a() {}
+fn b() {}
";

    /// Executor scripted by command substring. Defaults to success.
    struct StubExecutor {
        fail_contains: Option<&'static str>,
    }

    #[async_trait]
    impl Executor for StubExecutor {
        async fn exec(&self, req: ExecRequest) -> Result<ExecOutput, ExecError> {
            if let Some(needle) = self.fail_contains {
                if req.command.contains(needle) {
                    return Ok(ExecOutput {
                        stdout: String::new(),
                        stderr: "fatal: scripted failure".to_string(),
                        exit_code: 128,
                    });
                }
            }
            let stdout = if req.command.starts_with("git diff ") {
                SAMPLE_DIFF.to_string()
            } else {
                String::new()
            };
            Ok(ExecOutput {
                stdout,
                stderr: String::new(),
                exit_code: 0,
            })
        }
    }

    struct ScriptedProvider {
        responses: Mutex<Vec<ChatResponse>>,
    }

    #[async_trait]
    impl Provider for ScriptedProvider {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn chat(&self, _request: &ChatRequest) -> anyhow::Result<ChatResponse> {
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                anyhow::bail!("model unavailable");
            }
            Ok(responses.remove(0))
        }
    }

    fn reviewing_provider() -> Arc<ScriptedProvider> {
        let text = r#"<review>{"verdict":"comment","summary":"nit",
            "findings":[{"skill":"correctness","severity":"suggestion",
                         "path":"src/lib.rs","line":2,"title":"Name","body":"rename b"}]}</review>"#;
        Arc::new(ScriptedProvider {
            responses: Mutex::new(vec![ChatResponse {
                message: Message::assistant_parts(vec![ContentPart::Text {
                    text: text.to_string(),
                }]),
                usage: Usage {
                    input_tokens: 900,
                    output_tokens: 120,
                },
                stop_reason: StopReason::EndTurn,
            }]),
        })
    }

    struct Harness {
        queue: Arc<MemoryJobQueue>,
        dedup: Arc<MemoryDedupStore>,
        store: Arc<MemoryReviewStore>,
        forge: Arc<RecordingForge>,
        worker: ReviewWorker,
    }

    fn harness(provider: Arc<dyn Provider>, executor: Arc<dyn Executor>) -> Harness {
        let queue = Arc::new(MemoryJobQueue::new(2));
        let dedup = Arc::new(MemoryDedupStore::new());
        let store = Arc::new(MemoryReviewStore::new());
        let forge = Arc::new(RecordingForge::new());
        let gate = Arc::new(Gate::new(dedup.clone(), 50));

        let config = WorkerConfig {
            worker_id: "w-test".to_string(),
            model: "test-model".to_string(),
            ..Default::default()
        };
        let worker = ReviewWorker::new(
            queue.clone(),
            gate,
            store.clone(),
            forge.clone(),
            provider,
            executor,
            "/work",
            config,
        );
        Harness {
            queue,
            dedup,
            store,
            forge,
            worker,
        }
    }

    fn payload() -> serde_json::Value {
        json!({
            "prNumber": 7,
            "prTitle": "Add b",
            "prBody": null,
            "repoFullName": "octo/hello",
            "cloneUrl": "https://github.com/octo/hello.git",
            "headRef": "main",
            "headSha": "aaaaaaa",
            "baseRef": "main",
            "baseSha": "bbbbbbb",
            "prAuthor": "octocat",
            "installationId": 4242,
            "enqueuedAt": "2026-07-01T12:00:00Z"
        })
    }

    #[tokio::test]
    async fn happy_path_posts_review_and_finalizes_everything() {
        let h = harness(
            reviewing_provider(),
            Arc::new(StubExecutor {
                fail_contains: Some("rev-parse"),
            }),
        );
        h.dedup.insert_dedup_row("octo/hello", 7, "aaaaaaa").await.unwrap();
        h.queue.send(payload()).await.unwrap();

        assert_eq!(h.worker.tick().await.unwrap(), 1);

        // Review posted with the verdict derived from the findings.
        let posts = h.forge.posts.lock().unwrap();
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].event, ForgeEvent::Comment);
        assert_eq!(posts[0].commit_id, "aaaaaaa");
        assert_eq!(posts[0].comments.len(), 1);

        // Persistence: one completed review plus its trace.
        let reviews = h.store.reviews.lock().unwrap();
        assert_eq!(reviews.len(), 1);
        let (review_id, review) = &reviews[0];
        assert_eq!(review.status, ReviewStatus::Completed);
        assert_eq!(review.verdict.as_deref(), Some("comment"));
        assert!(!review.sandbox_warm);
        assert_eq!(review.files_changed, 1);
        assert_eq!(review.lines_added, 1);
        assert!(review.active_skills.contains(&"correctness".to_string()));
        assert_eq!(review.system_prompt_hash.len(), 64);
        let traces = h.store.traces.lock().unwrap();
        assert!(!traces.get(review_id).unwrap().is_empty());

        // Ledger closed, queue drained.
        assert_eq!(
            h.dedup.status("octo/hello", 7, "aaaaaaa").await.unwrap(),
            Some(JobStatus::Done)
        );
        assert_eq!(h.queue.succeeded_count(), 1);
    }

    #[tokio::test]
    async fn malformed_payload_is_acked_not_retried() {
        let h = harness(
            reviewing_provider(),
            Arc::new(StubExecutor { fail_contains: None }),
        );
        h.queue.send(json!({"garbage": true})).await.unwrap();

        assert_eq!(h.worker.tick().await.unwrap(), 1);
        assert_eq!(h.queue.succeeded_count(), 1);
        assert_eq!(h.queue.pending_count(), 0);
        assert!(h.forge.posts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn superseded_job_is_acked_without_review() {
        let h = harness(
            reviewing_provider(),
            Arc::new(StubExecutor { fail_contains: None }),
        );
        h.dedup.insert_dedup_row("octo/hello", 7, "aaaaaaa").await.unwrap();
        h.dedup
            .set_status("octo/hello", 7, "aaaaaaa", JobStatus::Superseded)
            .await
            .unwrap();
        h.queue.send(payload()).await.unwrap();

        assert_eq!(h.worker.tick().await.unwrap(), 1);
        assert!(h.forge.posts.lock().unwrap().is_empty());
        assert!(h.store.reviews.lock().unwrap().is_empty());
        assert_eq!(h.queue.succeeded_count(), 1);
    }

    #[tokio::test]
    async fn sandbox_failure_marks_failed_and_retries() {
        let h = harness(
            reviewing_provider(),
            Arc::new(StubExecutor {
                fail_contains: Some("clone"),
            }),
        );
        h.dedup.insert_dedup_row("octo/hello", 7, "aaaaaaa").await.unwrap();
        let id = h.queue.send(payload()).await.unwrap();

        assert_eq!(h.worker.tick().await.unwrap(), 1);
        // Attempt 1 of 2: requeued.
        assert_eq!(h.queue.pending_count(), 1);
        assert!(h.queue.last_error(id).unwrap().contains("clone"));
        assert_eq!(
            h.dedup.status("octo/hello", 7, "aaaaaaa").await.unwrap(),
            Some(JobStatus::Failed)
        );
        assert!(h.forge.posts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn model_failure_records_failed_review_and_retries() {
        let provider = Arc::new(ScriptedProvider {
            responses: Mutex::new(vec![]),
        });
        let h = harness(provider, Arc::new(StubExecutor { fail_contains: None }));
        h.dedup.insert_dedup_row("octo/hello", 7, "aaaaaaa").await.unwrap();
        h.queue.send(payload()).await.unwrap();

        assert_eq!(h.worker.tick().await.unwrap(), 1);
        assert_eq!(h.queue.pending_count(), 1);

        let reviews = h.store.reviews.lock().unwrap();
        assert_eq!(reviews.len(), 1);
        assert_eq!(reviews[0].1.status, ReviewStatus::Failed);
        assert!(reviews[0].1.error_message.as_deref().unwrap().contains("model"));
        assert!(h.forge.posts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn disabled_repository_completes_without_posting() {
        let h = harness(
            reviewing_provider(),
            Arc::new(StubExecutor { fail_contains: None }),
        );
        h.store.set_repository(crate::store::RepoRecord {
            id: uuid::Uuid::new_v4(),
            full_name: "octo/hello".to_string(),
            enabled: false,
            settings: RepoSettings::default(),
        });
        h.dedup.insert_dedup_row("octo/hello", 7, "aaaaaaa").await.unwrap();
        h.queue.send(payload()).await.unwrap();

        assert_eq!(h.worker.tick().await.unwrap(), 1);
        assert!(h.forge.posts.lock().unwrap().is_empty());
        assert_eq!(
            h.dedup.status("octo/hello", 7, "aaaaaaa").await.unwrap(),
            Some(JobStatus::Done)
        );
        assert_eq!(h.queue.succeeded_count(), 1);
    }

    #[test]
    fn sha256_hex_is_stable() {
        assert_eq!(
            sha256_hex("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(sha256_hex("abc").len(), 64);
    }
}
