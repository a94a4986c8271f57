use async_trait::async_trait;
use serde_json::{Value, json};

use super::{MAX_TOOL_OUTPUT, TOOL_EXEC_TIMEOUT, Tool, ToolContext, cap_output, required_str};
use crate::error::ToolError;
use crate::exec::shell_quote_single;
use crate::validate::contains_shell_metacharacters;

const MAX_MATCHES_PER_FILE: usize = 200;

pub struct SearchContentTool;

#[async_trait]
impl Tool for SearchContentTool {
    fn name(&self) -> &str {
        "search_content"
    }

    fn description(&self) -> &str {
        "Search file contents with a regex. Returns matching lines with file paths and line numbers."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "pattern": {
                    "type": "string",
                    "description": "Regex pattern to search for"
                },
                "glob": {
                    "type": "string",
                    "description": "Optional file glob, e.g. '*.rs'"
                },
                "case_sensitive": {
                    "type": "boolean",
                    "description": "Case-sensitive search (default true)"
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

        let glob = args.get("glob").and_then(|v| v.as_str());
        if let Some(g) = glob {
            if contains_shell_metacharacters(g) {
                return Err(ToolError::Rejected(
                    "Glob contains forbidden characters".to_string(),
                ));
            }
        }
        let case_sensitive = args
            .get("case_sensitive")
            .and_then(|v| v.as_bool())
            .unwrap_or(true);

        let mut command = format!("rg --no-heading --line-number -m {MAX_MATCHES_PER_FILE}");
        if !case_sensitive {
            command.push_str(" -i");
        }
        if let Some(g) = glob {
            command.push_str(&format!(" --glob {}", shell_quote_single(g)));
        }
        command.push_str(&format!(" {}", shell_quote_single(pattern)));

        // rg exits 1 on "no matches" with nothing on stderr; only exit
        // codes >= 2 are real failures.
        let out = ctx.exec(command, TOOL_EXEC_TIMEOUT).await?;
        if out.exit_code == 1 && out.stderr.is_empty() {
            return Ok("(no matches)".to_string());
        }
        if !out.success() {
            return Err(ToolError::Failed(format!(
                "search failed: {}",
                out.stderr.trim()
            )));
        }
        Ok(cap_output(out.stdout, MAX_TOOL_OUTPUT))
    }
}
