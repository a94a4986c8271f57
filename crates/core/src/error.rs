use crate::exec::ExecError;

#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("invalid ref: {0}")]
    InvalidRef(String),

    #[error("invalid sha: {0}")]
    InvalidSha(String),

    #[error("invalid clone url")]
    InvalidCloneUrl,

    #[error("{step} failed (exit {exit_code}): {message}")]
    Git {
        step: &'static str,
        exit_code: i32,
        /// Credential-scrubbed stderr.
        message: String,
    },

    #[error("executor failure: {0}")]
    Exec(#[from] ExecError),
}

/// Tool failures are surfaced to the model as `tool_result` entries with
/// `is_error = true`; none of them abort the agent loop.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("Missing required parameter: {0}")]
    MissingArgument(&'static str),

    #[error("{0}")]
    Rejected(String),

    #[error("{0}")]
    Failed(String),

    #[error("executor failure: {0}")]
    Exec(#[from] ExecError),
}

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("model call failed: {0}")]
    Model(#[source] anyhow::Error),
}
