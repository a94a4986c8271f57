use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};

use super::{MAX_TOOL_OUTPUT, Tool, ToolContext, cap_output, required_str};
use crate::error::ToolError;
use crate::validate::{contains_shell_metacharacters, jail_path};

const RUN_TIMEOUT: Duration = Duration::from_secs(60);

/// Commands the model may run: test runners, linters, and read-only git
/// subcommands. A command is accepted iff its trimmed form equals an entry
/// or starts with `<entry> `.
const COMMAND_ALLOWLIST: &[&str] = &[
    "cargo test",
    "cargo check",
    "cargo clippy",
    "cargo fmt --check",
    "npm test",
    "npm run lint",
    "npm run test",
    "pnpm test",
    "pnpm lint",
    "yarn test",
    "yarn lint",
    "pytest",
    "python -m pytest",
    "ruff check",
    "flake8",
    "mypy",
    "go test",
    "go vet",
    "golangci-lint run",
    "mvn test",
    "gradle test",
    "make test",
    "make check",
    "eslint",
    "tsc --noEmit",
    "git log",
    "git show",
    "git blame",
    "git status",
    "git shortlog",
    "git diff --stat",
    "git branch --list",
];

pub struct RunCommandTool;

#[async_trait]
impl Tool for RunCommandTool {
    fn name(&self) -> &str {
        "run_command"
    }

    fn description(&self) -> &str {
        "Run an allowlisted command (test runners, linters, read-only git) in the repository. \
         Shell chaining, subshells, and redirection are rejected."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The command line to run"
                },
                "cwd": {
                    "type": "string",
                    "description": "Optional subdirectory to run in, relative to the repository root"
                }
            },
            "required": ["command"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<String, ToolError> {
        let command = required_str(&args, "command")?.trim().to_string();

        if contains_shell_metacharacters(&command) {
            return Err(ToolError::Rejected(
                "Command contains forbidden characters".to_string(),
            ));
        }
        if command == "cd" || command.starts_with("cd ") {
            return Err(ToolError::Rejected(
                "cd is not allowed; pass cwd instead".to_string(),
            ));
        }
        if !is_allowlisted(&command) {
            return Err(ToolError::Rejected(format!(
                "Command is not on the allowlist: {command}"
            )));
        }

        let cwd = match args.get("cwd").and_then(|v| v.as_str()) {
            Some(sub) => Some(jail_path(&ctx.workdir, sub).map_err(ToolError::Rejected)?),
            None => None,
        };

        let out = ctx
            .exec_in(command, cwd.or_else(|| Some(ctx.workdir.clone())), RUN_TIMEOUT)
            .await?;

        let success = out.success();
        let exit_code = out.exit_code;
        let mut text = out.stdout;
        if !out.stderr.is_empty() {
            if !text.is_empty() {
                text.push('\n');
            }
            text.push_str(&out.stderr);
        }
        if !success {
            text.push_str(&format!("\n(exit code {exit_code})"));
        }
        if text.is_empty() {
            text.push_str("(no output)");
        }
        Ok(cap_output(text, MAX_TOOL_OUTPUT))
    }
}

fn is_allowlisted(command: &str) -> bool {
    COMMAND_ALLOWLIST
        .iter()
        .any(|prefix| command == *prefix || command.starts_with(&format!("{prefix} ")))
}
