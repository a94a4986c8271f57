pub mod types;

pub mod anthropic;

mod error;

pub use error::ProviderError;
pub use types::*;

use anyhow::Result;
use async_trait::async_trait;

#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse>;
}

/// Build the configured provider. The service runs a single sonnet-class
/// model; the trait seam exists so tests can script conversations.
pub fn create_provider(config: &reviewd_config::Config) -> Result<Box<dyn Provider>> {
    Ok(Box::new(anthropic::AnthropicProvider::from_config(config)?))
}
