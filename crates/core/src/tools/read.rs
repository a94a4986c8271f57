use async_trait::async_trait;
use serde_json::{Value, json};

use super::{MAX_TOOL_OUTPUT, TOOL_EXEC_TIMEOUT, Tool, ToolContext, cap_output, required_str};
use crate::error::ToolError;
use crate::exec::shell_quote_single;
use crate::validate::jail_path;

pub struct ReadFileTool;

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read a file from the repository working copy. Paths are relative to the repository root."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Path of the file to read, relative to the repository root"
                }
            },
            "required": ["path"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<String, ToolError> {
        let path = required_str(&args, "path")?;
        let jailed = jail_path(&ctx.workdir, path).map_err(ToolError::Rejected)?;

        let out = ctx
            .exec(
                format!("cat {}", shell_quote_single(&jailed)),
                TOOL_EXEC_TIMEOUT,
            )
            .await?;
        if !out.success() {
            return Err(ToolError::Failed(format!(
                "could not read {path}: {}",
                out.stderr.trim()
            )));
        }
        Ok(cap_output(out.stdout, MAX_TOOL_OUTPUT))
    }
}
