pub mod agent;
pub mod diff;
pub mod error;
pub mod exec;
pub mod redact;
pub mod review;
pub mod sandbox;
pub mod skills;
pub mod tools;
pub mod validate;

use serde::{Deserialize, Serialize};

/// Everything the agent needs to know about the pull request under review.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrContext {
    pub repo_full_name: String,
    pub pr_number: i64,
    pub title: String,
    pub body: Option<String>,
    pub author: String,
    pub head_ref: String,
    pub head_sha: String,
    pub base_ref: String,
    pub base_sha: String,
}

/// Per-repository review settings, stored as an opaque JSON blob.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RepoSettings {
    #[serde(default)]
    pub strictness: Strictness,
    #[serde(default)]
    pub ignore_globs: Vec<String>,
    #[serde(default)]
    pub custom_checklist: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strictness {
    Lenient,
    #[default]
    Balanced,
    Strict,
}

impl std::fmt::Display for Strictness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Strictness::Lenient => write!(f, "lenient"),
            Strictness::Balanced => write!(f, "balanced"),
            Strictness::Strict => write!(f, "strict"),
        }
    }
}
