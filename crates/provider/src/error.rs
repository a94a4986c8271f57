#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("HTTP error: {status} - {body}")]
    HttpError { status: u16, body: String },

    #[error("Deserialization error: {0}")]
    DeserializationError(String),

    #[error("Rate limited. Retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("Context window exceeded: {0}")]
    ContextOverflow(String),
}

impl ProviderError {
    pub fn from_http(status: u16, body: String, retry_after: Option<&str>) -> Self {
        match status {
            429 => {
                let retry_after_ms = retry_after
                    .and_then(|s| s.parse::<u64>().ok())
                    .map(|secs| secs * 1000)
                    .unwrap_or(30_000);
                ProviderError::RateLimited { retry_after_ms }
            }
            400 | 413 if body.contains("context") || body.contains("too long") => {
                ProviderError::ContextOverflow(body)
            }
            _ => ProviderError::HttpError { status, body },
        }
    }
}
