use async_trait::async_trait;
use serde_json::{Value, json};

use super::{MAX_DIFF_OUTPUT, TOOL_EXEC_TIMEOUT, Tool, ToolContext, cap_output};
use crate::error::ToolError;
use crate::validate::is_valid_sha;

pub struct GitDiffTool;

#[async_trait]
impl Tool for GitDiffTool {
    fn name(&self) -> &str {
        "git_diff"
    }

    fn description(&self) -> &str {
        "Show the three-dot diff between a base commit and the PR head. \
         Defaults to the PR's base SHA."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "base_sha": {
                    "type": "string",
                    "description": "Base commit SHA (7 to 40 hex chars)"
                }
            },
            "required": []
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<String, ToolError> {
        let base = args
            .get("base_sha")
            .and_then(|v| v.as_str())
            .unwrap_or(&ctx.base_sha)
            .to_string();

        if !is_valid_sha(&base) {
            return Err(ToolError::Rejected(format!("Invalid base SHA: {base}")));
        }

        let out = ctx
            .exec(format!("git diff {base}...HEAD"), TOOL_EXEC_TIMEOUT)
            .await?;
        if !out.success() {
            return Err(ToolError::Failed(format!(
                "git diff failed: {}",
                out.stderr.trim()
            )));
        }
        if out.stdout.is_empty() {
            return Ok("(no differences)".to_string());
        }
        Ok(cap_output(out.stdout, MAX_DIFF_OUTPUT))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::tools::test_support::{FakeExecutor, context};

    #[tokio::test]
    async fn uses_context_base_sha_by_default() {
        let exec = Arc::new(FakeExecutor::new());
        exec.push_response("diff --git a/x b/x", "", 0);
        let ctx = context(exec.clone());

        let out = GitDiffTool.execute(json!({}), &ctx).await.unwrap();
        assert!(out.starts_with("diff --git"));
        assert_eq!(exec.commands(), vec!["git diff bbbbbbb...HEAD".to_string()]);
    }

    #[tokio::test]
    async fn rejects_invalid_sha() {
        let exec = Arc::new(FakeExecutor::new());
        let ctx = context(exec.clone());

        let err = GitDiffTool
            .execute(json!({"base_sha": "HEAD~1; id"}), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Rejected(_)));
        assert!(exec.commands().is_empty());
    }
}
