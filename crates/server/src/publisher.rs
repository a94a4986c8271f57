use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::json;
use tracing::info;

use reviewd_core::review::{Review, Severity, Verdict};

/// Forge-side review event, one per verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ForgeEvent {
    Approve,
    RequestChanges,
    Comment,
}

impl From<Verdict> for ForgeEvent {
    fn from(verdict: Verdict) -> Self {
        match verdict {
            Verdict::Approve => ForgeEvent::Approve,
            Verdict::RequestChanges => ForgeEvent::RequestChanges,
            Verdict::Comment => ForgeEvent::Comment,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct InlineComment {
    pub path: String,
    pub line: i64,
    pub body: String,
}

#[derive(Debug, Clone)]
pub struct ReviewPost {
    pub repo_full_name: String,
    pub pr_number: i64,
    /// The head SHA the review was computed against.
    pub commit_id: String,
    pub event: ForgeEvent,
    pub body: String,
    pub comments: Vec<InlineComment>,
}

/// Extra numbers for the summary body.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunStats {
    pub iterations: u32,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub wall_time_ms: u64,
}

#[async_trait]
pub trait ForgeClient: Send + Sync {
    async fn post_review(&self, post: &ReviewPost) -> Result<()>;
}

/// Map a finished review onto the forge call. Findings without a usable
/// anchor are folded into the summary count but not posted inline.
pub fn build_review_post(
    repo_full_name: &str,
    pr_number: i64,
    head_sha: &str,
    review: &Review,
    active_skills: &[String],
    stats: RunStats,
) -> ReviewPost {
    let comments = review
        .findings
        .iter()
        .filter(|f| f.inline_eligible())
        .map(|f| InlineComment {
            path: f.path.clone(),
            line: f.line,
            body: format!(
                "**[{}] {}** _({})_\n\n{}",
                f.severity.as_str().to_uppercase(),
                f.title,
                f.skill,
                f.body
            ),
        })
        .collect();

    ReviewPost {
        repo_full_name: repo_full_name.to_string(),
        pr_number,
        commit_id: head_sha.to_string(),
        event: review.verdict.into(),
        body: summary_body(review, active_skills, stats),
        comments,
    }
}

fn summary_body(review: &Review, active_skills: &[String], stats: RunStats) -> String {
    let mut body = String::from("## Automated review\n\n");
    body.push_str(&review.summary);
    body.push('\n');

    let count = |severity: Severity| {
        review
            .findings
            .iter()
            .filter(|f| f.severity == severity)
            .count()
    };
    if !review.findings.is_empty() {
        body.push_str(&format!(
            "\n**Findings:** {} critical, {} warning, {} suggestion, {} note\n",
            count(Severity::Critical),
            count(Severity::Warning),
            count(Severity::Suggestion),
            count(Severity::Note),
        ));
    }

    if !active_skills.is_empty() {
        body.push_str(&format!("\n**Checks:** {}\n", active_skills.join(", ")));
    }
    body.push_str(&format!(
        "\n_{} iterations, {} in / {} out tokens, {:.1}s_\n",
        stats.iterations,
        stats.input_tokens,
        stats.output_tokens,
        stats.wall_time_ms as f64 / 1000.0
    ));
    body
}

/// GitHub pull-request review API client.
pub struct GithubForge {
    http: reqwest::Client,
    api_url: String,
    token: String,
}

impl GithubForge {
    pub fn new(api_url: String, token: String) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(30))
                .user_agent("reviewd")
                .build()
                .unwrap_or_default(),
            api_url,
            token,
        }
    }
}

#[async_trait]
impl ForgeClient for GithubForge {
    async fn post_review(&self, post: &ReviewPost) -> Result<()> {
        let url = format!(
            "{}/repos/{}/pulls/{}/reviews",
            self.api_url, post.repo_full_name, post.pr_number
        );
        let comments: Vec<serde_json::Value> = post
            .comments
            .iter()
            .map(|c| json!({"path": c.path, "line": c.line, "body": c.body}))
            .collect();

        let resp = self
            .http
            .post(&url)
            .bearer_auth(&self.token)
            .header("accept", "application/vnd.github+json")
            .json(&json!({
                "commit_id": post.commit_id,
                "event": post.event,
                "body": post.body,
                "comments": comments,
            }))
            .send()
            .await
            .context("review POST failed")?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("review POST rejected: {status}: {body}");
        }
        info!(
            repo = %post.repo_full_name,
            pr = post.pr_number,
            event = ?post.event,
            comments = post.comments.len(),
            "review posted"
        );
        Ok(())
    }
}

/// Recording fake for tests.
pub mod recording {
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    pub struct RecordingForge {
        pub posts: Mutex<Vec<ReviewPost>>,
    }

    impl RecordingForge {
        pub fn new() -> Self {
            Self::default()
        }
    }

    #[async_trait]
    impl ForgeClient for RecordingForge {
        async fn post_review(&self, post: &ReviewPost) -> Result<()> {
            self.posts.lock().unwrap().push(post.clone());
            Ok(())
        }
    }
}
