use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use reviewd_core::validate::{is_valid_ref, is_valid_repo_full_name, is_valid_sha};

/// The queue message for one review job. Field names are part of the
/// wire contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewJob {
    pub pr_number: i64,
    pub pr_title: String,
    pub pr_body: Option<String>,
    pub repo_full_name: String,
    pub clone_url: String,
    pub head_ref: String,
    pub head_sha: String,
    pub base_ref: String,
    pub base_sha: String,
    pub pr_author: String,
    pub installation_id: i64,
    pub enqueued_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("invalid job payload: {field}: {problem}")]
pub struct JobValidationError {
    pub field: &'static str,
    pub problem: &'static str,
}

fn invalid(field: &'static str, problem: &'static str) -> JobValidationError {
    JobValidationError { field, problem }
}

/// Strict validation of a queued payload. Anything that fails here is
/// poison: the caller discards it instead of retrying.
pub fn validate_job(value: &Value) -> Result<ReviewJob, JobValidationError> {
    let obj = value
        .as_object()
        .ok_or_else(|| invalid("payload", "not an object"))?;

    let pr_number = obj
        .get("prNumber")
        .and_then(|v| v.as_i64())
        .ok_or_else(|| invalid("prNumber", "missing or not an integer"))?;

    let repo_full_name = require_str(value, "repoFullName")?;
    if !is_valid_repo_full_name(repo_full_name) {
        return Err(invalid("repoFullName", "does not match owner/name"));
    }

    let clone_url = require_str(value, "cloneUrl")?;
    if !clone_url.starts_with("https://") {
        return Err(invalid("cloneUrl", "must be https"));
    }

    let head_ref = require_str(value, "headRef")?;
    let base_ref = require_str(value, "baseRef")?;
    if !is_valid_ref(head_ref) {
        return Err(invalid("headRef", "invalid ref"));
    }
    if !is_valid_ref(base_ref) {
        return Err(invalid("baseRef", "invalid ref"));
    }

    let head_sha = require_str(value, "headSha")?;
    let base_sha = require_str(value, "baseSha")?;
    if !is_valid_sha(head_sha) {
        return Err(invalid("headSha", "invalid sha"));
    }
    if !is_valid_sha(base_sha) {
        return Err(invalid("baseSha", "invalid sha"));
    }

    let installation_id = obj
        .get("installationId")
        .and_then(|v| v.as_i64())
        .ok_or_else(|| invalid("installationId", "missing or not an integer"))?;

    Ok(ReviewJob {
        pr_number,
        pr_title: obj
            .get("prTitle")
            .and_then(|v| v.as_str())
            .unwrap_or("(untitled)")
            .to_string(),
        pr_body: obj
            .get("prBody")
            .and_then(|v| v.as_str())
            .map(str::to_string),
        repo_full_name: repo_full_name.to_string(),
        clone_url: clone_url.to_string(),
        head_ref: head_ref.to_string(),
        head_sha: head_sha.to_string(),
        base_ref: base_ref.to_string(),
        base_sha: base_sha.to_string(),
        pr_author: obj
            .get("prAuthor")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
            .to_string(),
        installation_id,
        enqueued_at: obj
            .get("enqueuedAt")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse().ok())
            .unwrap_or_else(Utc::now),
    })
}

fn require_str<'a>(
    value: &'a Value,
    field: &'static str,
) -> Result<&'a str, JobValidationError> {
    value
        .get(field)
        .and_then(|v| v.as_str())
        .ok_or_else(|| invalid_str(field))
}

fn invalid_str(field: &'static str) -> JobValidationError {
    JobValidationError {
        field,
        problem: "missing or not a string",
    }
}
