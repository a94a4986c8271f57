use async_trait::async_trait;
use serde_json::{Value, json};

use super::{MAX_LIST_ENTRIES, TOOL_EXEC_TIMEOUT, Tool, ToolContext, cap_entries};
use crate::error::ToolError;
use crate::exec::shell_quote_single;
use crate::validate::contains_shell_metacharacters;

pub struct ListFilesTool;

#[async_trait]
impl Tool for ListFilesTool {
    fn name(&self) -> &str {
        "list_files"
    }

    fn description(&self) -> &str {
        "List tracked files in the repository, optionally filtered by a pathspec pattern."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "pattern": {
                    "type": "string",
                    "description": "Optional git pathspec, e.g. 'src/*.rs'"
                }
            },
            "required": []
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<String, ToolError> {
        let pattern = args.get("pattern").and_then(|v| v.as_str());

        let command = match pattern {
            Some(p) => {
                if contains_shell_metacharacters(p) {
                    return Err(ToolError::Rejected(
                        "Pattern contains forbidden characters".to_string(),
                    ));
                }
                format!("git ls-files -- {}", shell_quote_single(p))
            }
            None => "git ls-files".to_string(),
        };

        let out = ctx.exec(command, TOOL_EXEC_TIMEOUT).await?;
        if !out.success() {
            return Err(ToolError::Failed(format!(
                "git ls-files failed: {}",
                out.stderr.trim()
            )));
        }
        if out.stdout.is_empty() {
            return Ok("(no files)".to_string());
        }
        Ok(cap_entries(&out.stdout, MAX_LIST_ENTRIES))
    }
}
