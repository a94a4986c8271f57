use async_trait::async_trait;
use serde_json::{Value, json};

use super::{MAX_LIST_ENTRIES, TOOL_EXEC_TIMEOUT, Tool, ToolContext, cap_entries, required_str};
use crate::error::ToolError;
use crate::exec::shell_quote_single;
use crate::validate::contains_shell_metacharacters;

const MAX_DEPTH: u64 = 15;

pub struct FindFilesTool;

#[async_trait]
impl Tool for FindFilesTool {
    fn name(&self) -> &str {
        "find_files"
    }

    fn description(&self) -> &str {
        "Find files or directories by name pattern, e.g. '*.toml'."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "pattern": {
                    "type": "string",
                    "description": "Name pattern, e.g. '*.lock'"
                },
                "type": {
                    "type": "string",
                    "enum": ["f", "d"],
                    "description": "Restrict to files (f) or directories (d)"
                },
                "max_depth": {
                    "type": "integer",
                    "description": "Maximum directory depth (capped at 15)"
                }
            },
            "required": ["pattern"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<String, ToolError> {
        let pattern = required_str(&args, "pattern")?;
        if contains_shell_metacharacters(pattern) {
            return Err(ToolError::Rejected(
                "Pattern contains forbidden characters".to_string(),
            ));
        }

        let depth = args
            .get("max_depth")
            .and_then(|v| v.as_u64())
            .unwrap_or(MAX_DEPTH)
            .min(MAX_DEPTH);

        let mut command = format!("find . -maxdepth {depth}");
        match args.get("type").and_then(|v| v.as_str()) {
            Some("f") => command.push_str(" -type f"),
            Some("d") => command.push_str(" -type d"),
            Some(other) => {
                return Err(ToolError::Rejected(format!(
                    "Unknown type filter: {other}"
                )));
            }
            None => {}
        }
        command.push_str(&format!(" -name {}", shell_quote_single(pattern)));

        let out = ctx.exec(command, TOOL_EXEC_TIMEOUT).await?;
        if !out.success() {
            return Err(ToolError::Failed(format!(
                "find failed: {}",
                out.stderr.trim()
            )));
        }
        if out.stdout.is_empty() {
            return Ok("(no matches)".to_string());
        }
        Ok(cap_entries(&out.stdout, MAX_LIST_ENTRIES))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::tools::test_support::{FakeExecutor, context};

    #[tokio::test]
    async fn builds_the_find_invocation() {
        let exec = Arc::new(FakeExecutor::new());
        exec.push_response("./Cargo.toml\n./crates/core/Cargo.toml", "", 0);
        let ctx = context(exec.clone());

        let out = FindFilesTool
            .execute(json!({"pattern": "Cargo.toml", "type": "f", "max_depth": 4}), &ctx)
            .await
            .unwrap();
        assert!(out.contains("./crates/core/Cargo.toml"));
        assert_eq!(
            exec.commands(),
            vec!["find . -maxdepth 4 -type f -name 'Cargo.toml'".to_string()]
        );
    }

    #[tokio::test]
    async fn caps_depth_at_fifteen() {
        let exec = Arc::new(FakeExecutor::new());
        let ctx = context(exec.clone());

        FindFilesTool
            .execute(json!({"pattern": "*.rs", "max_depth": 99}), &ctx)
            .await
            .unwrap();
        assert_eq!(
            exec.commands(),
            vec!["find . -maxdepth 15 -name '*.rs'".to_string()]
        );
    }

    #[tokio::test]
    async fn rejects_metacharacters_and_bad_type() {
        let exec = Arc::new(FakeExecutor::new());
        let ctx = context(exec.clone());

        assert!(FindFilesTool
            .execute(json!({"pattern": "*.rs; id"}), &ctx)
            .await
            .is_err());
        assert!(FindFilesTool
            .execute(json!({"pattern": "*.rs", "type": "x"}), &ctx)
            .await
            .is_err());
        assert!(exec.commands().is_empty());
    }
}
