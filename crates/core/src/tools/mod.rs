pub mod diff;
pub mod find;
pub mod list;
pub mod read;
pub mod run;
pub mod search;
pub mod vuln;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::ToolError;
use crate::exec::{ExecOutput, ExecRequest, Executor};
use crate::redact::scrub_credentials;

pub use reviewd_provider::ToolDefinition;

/// Output caps at the tool boundary. The model is told when a cap fired.
pub const MAX_LIST_ENTRIES: usize = 500;
pub const MAX_TOOL_OUTPUT: usize = 30_000;
pub const MAX_DIFF_OUTPUT: usize = 50_000;

/// Default deadline for a single tool-driven sandbox command.
pub const TOOL_EXEC_TIMEOUT: Duration = Duration::from_secs(30);

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn parameters_schema(&self) -> Value;
    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<String, ToolError>;
}

#[derive(Clone)]
pub struct ToolContext {
    pub executor: Arc<dyn Executor>,
    /// Absolute sandbox working directory for the repository under review.
    pub workdir: String,
    /// The PR's base SHA, used by `git_diff`.
    pub base_sha: String,
    /// Shared HTTP client for tools that call external APIs.
    pub http: reqwest::Client,
}

impl ToolContext {
    pub async fn exec(
        &self,
        command: impl Into<String>,
        timeout: Duration,
    ) -> Result<ExecOutput, ToolError> {
        self.exec_in(command, Some(self.workdir.clone()), timeout).await
    }

    pub async fn exec_in(
        &self,
        command: impl Into<String>,
        cwd: Option<String>,
        timeout: Duration,
    ) -> Result<ExecOutput, ToolError> {
        Ok(self
            .executor
            .exec(ExecRequest::new(command, cwd, timeout))
            .await?)
    }
}

pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    /// The full tool surface. The composer narrows it per job.
    pub fn builtin() -> Self {
        let mut registry = Self {
            tools: HashMap::new(),
        };
        registry.register(Arc::new(read::ReadFileTool));
        registry.register(Arc::new(list::ListFilesTool));
        registry.register(Arc::new(run::RunCommandTool));
        registry.register(Arc::new(diff::GitDiffTool));
        registry.register(Arc::new(search::SearchContentTool));
        registry.register(Arc::new(find::FindFilesTool));
        registry.register(Arc::new(vuln::CheckVulnerabilitiesTool));
        registry
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Definitions for the given subset, in the order requested.
    pub fn definitions(&self, names: &[String]) -> Vec<ToolDefinition> {
        names
            .iter()
            .filter_map(|name| self.tools.get(name))
            .map(|t| ToolDefinition {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.parameters_schema(),
            })
            .collect()
    }

    /// Run one tool call, mapping every failure to scrubbed error text.
    /// Never panics, never aborts the loop.
    pub async fn dispatch(&self, name: &str, args: Value, ctx: &ToolContext) -> ToolOutcome {
        let Some(tool) = self.get(name) else {
            return ToolOutcome {
                content: format!("Unknown tool: {name}"),
                is_error: true,
            };
        };
        match tool.execute(args, ctx).await {
            Ok(output) => ToolOutcome {
                content: output,
                is_error: false,
            },
            Err(err) => ToolOutcome {
                content: scrub_credentials(&err.to_string()),
                is_error: true,
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct ToolOutcome {
    pub content: String,
    pub is_error: bool,
}

pub(crate) fn required_str<'a>(
    args: &'a Value,
    key: &'static str,
) -> Result<&'a str, ToolError> {
    args.get(key)
        .and_then(|v| v.as_str())
        .ok_or(ToolError::MissingArgument(key))
}

/// Truncate to `limit` characters with an explicit marker.
pub(crate) fn cap_output(mut text: String, limit: usize) -> String {
    if text.len() <= limit {
        return text;
    }
    let mut cut = limit;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    text.truncate(cut);
    text.push_str("\n... (output truncated)");
    text
}

/// Keep at most `limit` lines, appending a count of what was dropped.
pub(crate) fn cap_entries(text: &str, limit: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    if lines.len() <= limit {
        return text.to_string();
    }
    let mut out = lines[..limit].join("\n");
    out.push_str(&format!("\n... ({} more entries omitted)", lines.len() - limit));
    out
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::Mutex;

    use crate::exec::ExecError;

    /// Executor fake that records requests and replays canned outputs.
    pub struct FakeExecutor {
        pub log: Mutex<Vec<ExecRequest>>,
        pub responses: Mutex<Vec<ExecOutput>>,
    }

    impl FakeExecutor {
        pub fn new() -> Self {
            Self {
                log: Mutex::new(Vec::new()),
                responses: Mutex::new(Vec::new()),
            }
        }

        pub fn push_response(&self, stdout: &str, stderr: &str, exit_code: i32) {
            self.responses.lock().unwrap().push(ExecOutput {
                stdout: stdout.to_string(),
                stderr: stderr.to_string(),
                exit_code,
            });
        }

        pub fn commands(&self) -> Vec<String> {
            self.log.lock().unwrap().iter().map(|r| r.command.clone()).collect()
        }
    }

    #[async_trait]
    impl Executor for FakeExecutor {
        async fn exec(&self, req: ExecRequest) -> Result<ExecOutput, ExecError> {
            self.log.lock().unwrap().push(req);
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                Ok(ExecOutput {
                    stdout: String::new(),
                    stderr: String::new(),
                    exit_code: 0,
                })
            } else {
                Ok(responses.remove(0))
            }
        }
    }

    pub fn context(exec: Arc<FakeExecutor>) -> ToolContext {
        ToolContext {
            executor: exec,
            workdir: "/work/octo--hello".to_string(),
            base_sha: "bbbbbbb".to_string(),
            http: reqwest::Client::new(),
        }
    }
}
