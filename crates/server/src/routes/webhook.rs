use axum::Json;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::app::AppState;
use crate::gate::{DenyReason, GateDecision};
use crate::job::ReviewJob;
use crate::signature::verify_signature;

#[derive(Debug, Serialize)]
pub struct WebhookResponse {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl WebhookResponse {
    fn ok(status: &'static str) -> Self {
        Self {
            status,
            reason: None,
        }
    }

    fn with_reason(status: &'static str, reason: impl Into<String>) -> Self {
        Self {
            status,
            reason: Some(reason.into()),
        }
    }
}

/// The forge's pull-request event, reduced to the fields the gate needs.
#[derive(Debug, Deserialize)]
struct PullRequestEvent {
    action: Option<String>,
    number: Option<i64>,
    pull_request: Option<PullRequestPayload>,
    repository: Option<RepositoryPayload>,
    installation: Option<InstallationPayload>,
}

#[derive(Debug, Deserialize)]
struct PullRequestPayload {
    title: Option<String>,
    body: Option<String>,
    #[serde(default)]
    draft: bool,
    user: Option<UserPayload>,
    head: Option<GitRefPayload>,
    base: Option<GitRefPayload>,
}

#[derive(Debug, Deserialize)]
struct UserPayload {
    login: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GitRefPayload {
    #[serde(rename = "ref")]
    git_ref: Option<String>,
    sha: Option<String>,
    repo: Option<RepoInfoPayload>,
}

#[derive(Debug, Deserialize)]
struct RepoInfoPayload {
    clone_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RepositoryPayload {
    full_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct InstallationPayload {
    id: Option<i64>,
}

type Reply = (StatusCode, Json<WebhookResponse>);

fn reply(status: StatusCode, body: WebhookResponse) -> Reply {
    (status, Json(body))
}

/// Webhook intake. The raw body is read (and the signature checked over
/// those exact bytes) before any JSON parsing happens.
pub async fn webhook_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Reply {
    let signature = headers
        .get("x-hub-signature-256")
        .and_then(|v| v.to_str().ok());
    if let Err(err) = verify_signature(&state.webhook_secret, &body, signature) {
        warn!(error = %err, "webhook signature rejected");
        return reply(
            StatusCode::UNAUTHORIZED,
            WebhookResponse::with_reason("unauthorized", err.to_string()),
        );
    }

    let event_kind = headers
        .get("x-github-event")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if event_kind != "pull_request" {
        return reply(StatusCode::OK, WebhookResponse::ok("ignored"));
    }

    let event: PullRequestEvent = match serde_json::from_slice(&body) {
        Ok(event) => event,
        Err(_) => {
            return reply(
                StatusCode::BAD_REQUEST,
                WebhookResponse::with_reason("invalid", "body is not valid JSON"),
            );
        }
    };

    match event.action.as_deref() {
        Some("opened") | Some("synchronize") => {}
        _ => return reply(StatusCode::OK, WebhookResponse::ok("ignored")),
    }

    let Some(pull_request) = event.pull_request else {
        return reply(
            StatusCode::BAD_REQUEST,
            WebhookResponse::with_reason("invalid", "missing pull_request"),
        );
    };
    if pull_request.draft {
        return reply(StatusCode::OK, WebhookResponse::ok("ignored"));
    }

    let Some(installation_id) = event.installation.and_then(|i| i.id) else {
        return reply(
            StatusCode::BAD_REQUEST,
            WebhookResponse::with_reason("invalid", "missing installation id"),
        );
    };

    let (Some(repo_full_name), Some(pr_number)) = (
        event.repository.and_then(|r| r.full_name),
        event.number,
    ) else {
        return reply(
            StatusCode::BAD_REQUEST,
            WebhookResponse::with_reason("invalid", "missing repository or PR number"),
        );
    };

    let (head, base) = match (pull_request.head, pull_request.base) {
        (Some(head), Some(base)) => (head, base),
        _ => {
            return reply(
                StatusCode::BAD_REQUEST,
                WebhookResponse::with_reason("invalid", "missing head or base"),
            );
        }
    };
    let (Some(head_ref), Some(head_sha)) = (head.git_ref.clone(), head.sha.clone()) else {
        return reply(
            StatusCode::BAD_REQUEST,
            WebhookResponse::with_reason("invalid", "missing head ref or sha"),
        );
    };
    let (Some(base_ref), Some(base_sha)) = (base.git_ref.clone(), base.sha.clone()) else {
        return reply(
            StatusCode::BAD_REQUEST,
            WebhookResponse::with_reason("invalid", "missing base ref or sha"),
        );
    };
    let Some(clone_url) = head.repo.and_then(|r| r.clone_url) else {
        return reply(
            StatusCode::BAD_REQUEST,
            WebhookResponse::with_reason("invalid", "missing clone url"),
        );
    };

    if let Err(err) = state
        .store
        .ensure_repository(installation_id, &repo_full_name)
        .await
    {
        warn!(error = %err, "repository upsert failed");
        return reply(
            StatusCode::INTERNAL_SERVER_ERROR,
            WebhookResponse::with_reason("error", "storage failure"),
        );
    }

    let decision = match state
        .gate
        .try_enqueue(&repo_full_name, pr_number, &head_sha)
        .await
    {
        Ok(decision) => decision,
        Err(err) => {
            warn!(error = %err, "gate failure");
            return reply(
                StatusCode::INTERNAL_SERVER_ERROR,
                WebhookResponse::with_reason("error", "gate failure"),
            );
        }
    };

    match decision {
        GateDecision::Denied(DenyReason::RateLimited) => {
            return reply(
                StatusCode::TOO_MANY_REQUESTS,
                WebhookResponse::with_reason("rejected", "rate_limited"),
            );
        }
        GateDecision::Denied(reason) => {
            // Duplicate pushes and disabled repositories are normal
            // traffic, not client errors.
            return reply(
                StatusCode::OK,
                WebhookResponse::with_reason("skipped", reason.as_str()),
            );
        }
        GateDecision::Allowed => {}
    }

    let job = ReviewJob {
        pr_number,
        pr_title: pull_request.title.unwrap_or_else(|| "(untitled)".to_string()),
        pr_body: pull_request.body,
        repo_full_name: repo_full_name.clone(),
        clone_url,
        head_ref,
        head_sha: head_sha.clone(),
        base_ref,
        base_sha,
        pr_author: pull_request
            .user
            .and_then(|u| u.login)
            .unwrap_or_else(|| "unknown".to_string()),
        installation_id,
        enqueued_at: Utc::now(),
    };
    let payload = match serde_json::to_value(&job) {
        Ok(payload) => payload,
        Err(err) => {
            warn!(error = %err, "job serialization failed");
            return reply(
                StatusCode::INTERNAL_SERVER_ERROR,
                WebhookResponse::with_reason("error", "serialization failure"),
            );
        }
    };
    if let Err(err) = state.queue.send(payload).await {
        warn!(error = %err, "queue send failed");
        return reply(
            StatusCode::INTERNAL_SERVER_ERROR,
            WebhookResponse::with_reason("error", "queue failure"),
        );
    }

    info!(repo = %repo_full_name, pr = pr_number, sha = %head_sha, "review job enqueued");
    reply(StatusCode::OK, WebhookResponse::ok("enqueued"))
}
