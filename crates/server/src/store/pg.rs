use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, QueryBuilder, Row};
use uuid::Uuid;

use reviewd_core::RepoSettings;
use reviewd_core::agent::{TraceRole, TraceTurn};

use super::{NewReview, RepoRecord, ReviewStore};
use crate::gate::{DedupStore, JobStatus};

/// PostgreSQL persistence. Every write is a single statement or a single
/// batched insert; there are no multi-statement transactions.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn row_to_repo(row: &sqlx::postgres::PgRow) -> RepoRecord {
        let settings: serde_json::Value = row.get("settings");
        RepoRecord {
            id: row.get("id"),
            full_name: row.get("full_name"),
            enabled: row.get("enabled"),
            settings: serde_json::from_value::<RepoSettings>(settings).unwrap_or_default(),
        }
    }
}

#[async_trait]
impl ReviewStore for PgStore {
    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn ensure_repository(
        &self,
        installation_external_id: i64,
        full_name: &str,
    ) -> Result<RepoRecord> {
        let installation_id: Uuid = sqlx::query(
            "INSERT INTO installations (id, external_id, status, created_at) \
             VALUES ($1, $2, 'active', now()) \
             ON CONFLICT (external_id) DO UPDATE SET status = 'active' \
             RETURNING id",
        )
        .bind(Uuid::new_v4())
        .bind(installation_external_id)
        .fetch_one(&self.pool)
        .await?
        .get("id");

        let row = sqlx::query(
            "INSERT INTO repositories (id, full_name, installation_id, enabled, settings, created_at) \
             VALUES ($1, $2, $3, true, '{}'::jsonb, now()) \
             ON CONFLICT (full_name) DO UPDATE SET full_name = EXCLUDED.full_name \
             RETURNING id, full_name, enabled, settings",
        )
        .bind(Uuid::new_v4())
        .bind(full_name)
        .bind(installation_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(Self::row_to_repo(&row))
    }

    async fn get_repository(&self, full_name: &str) -> Result<Option<RepoRecord>> {
        let row = sqlx::query(
            "SELECT id, full_name, enabled, settings FROM repositories WHERE full_name = $1",
        )
        .bind(full_name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(Self::row_to_repo))
    }

    async fn insert_review(&self, review: &NewReview) -> Result<Uuid> {
        let id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO reviews ( \
                 id, repo_id, pr_number, pr_title, pr_body, pr_author, \
                 head_ref, base_ref, head_sha, base_sha, \
                 status, error_message, verdict, summary, findings, \
                 model, input_tokens, output_tokens, \
                 total_duration_ms, setup_duration_ms, sandbox_warm, \
                 files_changed, lines_added, lines_removed, \
                 active_skills, diff_text, system_prompt_hash, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, \
                     $11, $12, $13, $14, $15, $16, $17, $18, $19, $20, \
                     $21, $22, $23, $24, $25, $26, $27, now())",
        )
        .bind(id)
        .bind(review.repo_id)
        .bind(review.pr_number)
        .bind(&review.pr_title)
        .bind(&review.pr_body)
        .bind(&review.pr_author)
        .bind(&review.head_ref)
        .bind(&review.base_ref)
        .bind(&review.head_sha)
        .bind(&review.base_sha)
        .bind(review.status.as_str())
        .bind(&review.error_message)
        .bind(&review.verdict)
        .bind(&review.summary)
        .bind(&review.findings)
        .bind(&review.model)
        .bind(review.input_tokens)
        .bind(review.output_tokens)
        .bind(review.total_duration_ms)
        .bind(review.setup_duration_ms)
        .bind(review.sandbox_warm)
        .bind(review.files_changed)
        .bind(review.lines_added)
        .bind(review.lines_removed)
        .bind(&review.active_skills)
        .bind(&review.diff_text)
        .bind(&review.system_prompt_hash)
        .execute(&self.pool)
        .await?;
        Ok(id)
    }

    async fn insert_review_traces(&self, review_id: Uuid, turns: &[TraceTurn]) -> Result<()> {
        if turns.is_empty() {
            return Ok(());
        }

        let mut builder: QueryBuilder<sqlx::Postgres> = QueryBuilder::new(
            "INSERT INTO review_traces ( \
                 review_id, turn_number, iteration, role, content, \
                 tool_name, tool_input, tool_result, input_tokens, output_tokens) ",
        );
        builder.push_values(turns, |mut b, turn| {
            b.push_bind(review_id)
                .push_bind(turn.turn_number)
                .push_bind(turn.iteration as i32)
                .push_bind(match turn.role {
                    TraceRole::Assistant => "assistant",
                    TraceRole::User => "user",
                })
                .push_bind(&turn.content)
                .push_bind(&turn.tool_name)
                .push_bind(&turn.tool_input)
                .push_bind(&turn.tool_result)
                .push_bind(turn.input_tokens.map(|t| t as i64))
                .push_bind(turn.output_tokens.map(|t| t as i64));
        });
        builder.build().execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl DedupStore for PgStore {
    async fn repo_enabled(&self, repo: &str) -> Result<Option<bool>> {
        let row = sqlx::query("SELECT enabled FROM repositories WHERE full_name = $1")
            .bind(repo)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get("enabled")))
    }

    async fn insert_dedup_row(&self, repo: &str, pr: i64, sha: &str) -> Result<bool> {
        let result = sqlx::query(
            "INSERT INTO job_dedup (repo_full_name, pr_number, head_sha, status, created_at) \
             VALUES ($1, $2, $3, 'queued', now()) \
             ON CONFLICT (repo_full_name, pr_number, head_sha) DO NOTHING",
        )
        .bind(repo)
        .bind(pr)
        .bind(sha)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn count_since(&self, repo: &str, since: DateTime<Utc>) -> Result<i64> {
        let row = sqlx::query(
            "SELECT count(*) AS n FROM job_dedup \
             WHERE repo_full_name = $1 AND created_at > $2",
        )
        .bind(repo)
        .bind(since)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get("n"))
    }

    async fn set_status(&self, repo: &str, pr: i64, sha: &str, status: JobStatus) -> Result<()> {
        sqlx::query(
            "UPDATE job_dedup SET status = $4 \
             WHERE repo_full_name = $1 AND pr_number = $2 AND head_sha = $3",
        )
        .bind(repo)
        .bind(pr)
        .bind(sha)
        .bind(status.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn supersede_others(&self, repo: &str, pr: i64, keep_sha: &str) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE job_dedup SET status = 'superseded' \
             WHERE repo_full_name = $1 AND pr_number = $2 \
               AND head_sha <> $3 AND status = 'queued'",
        )
        .bind(repo)
        .bind(pr)
        .bind(keep_sha)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn status(&self, repo: &str, pr: i64, sha: &str) -> Result<Option<JobStatus>> {
        let row = sqlx::query(
            "SELECT status FROM job_dedup \
             WHERE repo_full_name = $1 AND pr_number = $2 AND head_sha = $3",
        )
        .bind(repo)
        .bind(pr)
        .bind(sha)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.and_then(|r| JobStatus::parse(r.get::<&str, _>("status"))))
    }
}
