use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub forge: ForgeConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// Shared secret for webhook signature verification.
    #[serde(default)]
    pub webhook_secret: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            webhook_secret: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            max_connections: default_max_connections(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: i64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_max_poll_interval_ms")]
    pub max_poll_interval_ms: u64,
    #[serde(default = "default_lease_ms")]
    pub lease_ms: i64,
    #[serde(default = "default_max_retries")]
    pub max_retries: i32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            poll_interval_ms: default_poll_interval_ms(),
            max_poll_interval_ms: default_max_poll_interval_ms(),
            lease_ms: default_lease_ms(),
            max_retries: default_max_retries(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Directory under which per-repository working copies live.
    #[serde(default = "default_sandbox_root")]
    pub root: PathBuf,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            root: default_sandbox_root(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_model_id")]
    pub id: String,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            id: default_model_id(),
            base_url: None,
            api_key: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForgeConfig {
    #[serde(default = "default_forge_api_url")]
    pub api_url: String,
    #[serde(default)]
    pub token: Option<String>,
}

impl Default for ForgeConfig {
    fn default() -> Self {
        Self {
            api_url: default_forge_api_url(),
            token: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_reviews_per_repo_per_hour")]
    pub reviews_per_repo_per_hour: i64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            reviews_per_repo_per_hour: default_reviews_per_repo_per_hour(),
        }
    }
}

fn default_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_max_connections() -> u32 {
    10
}

fn default_batch_size() -> i64 {
    4
}

fn default_poll_interval_ms() -> u64 {
    250
}

fn default_max_poll_interval_ms() -> u64 {
    15_000
}

fn default_lease_ms() -> i64 {
    600_000
}

fn default_max_retries() -> i32 {
    3
}

fn default_sandbox_root() -> PathBuf {
    PathBuf::from("/var/lib/reviewd/sandboxes")
}

fn default_model_id() -> String {
    "claude-sonnet-4-20250514".to_string()
}

fn default_forge_api_url() -> String {
    "https://api.github.com".to_string()
}

fn default_reviews_per_repo_per_hour() -> i64 {
    50
}

impl Config {
    /// Load configuration: TOML file if present, then environment
    /// overrides for secrets. A missing file is not an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("REVIEWD_CONFIG").map(PathBuf::from))
            .unwrap_or_else(Self::default_path);

        let mut config = if path.exists() {
            let content =
                std::fs::read_to_string(&path).context("Failed to read config file")?;
            toml::from_str(&content).context("Failed to parse config file")?
        } else {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            Self::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    pub fn default_path() -> PathBuf {
        PathBuf::from("/etc/reviewd/config.toml")
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("DATABASE_URL") {
            self.database.url = url;
        }
        if let Ok(secret) = std::env::var("REVIEWD_WEBHOOK_SECRET") {
            self.server.webhook_secret = secret;
        }
        if let Ok(key) = std::env::var("ANTHROPIC_API_KEY") {
            self.model.api_key = Some(key);
        }
        if let Ok(token) = std::env::var("REVIEWD_FORGE_TOKEN") {
            self.forge.token = Some(token);
        }
    }
}
