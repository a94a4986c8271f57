use async_trait::async_trait;
use serde_json::{Value, json};

use super::{MAX_TOOL_OUTPUT, Tool, ToolContext, cap_output};
use crate::error::ToolError;

const OSV_API: &str = "https://api.osv.dev/v1";
const MAX_PACKAGES: usize = 50;

pub struct CheckVulnerabilitiesTool;

#[async_trait]
impl Tool for CheckVulnerabilitiesTool {
    fn name(&self) -> &str {
        "check_vulnerabilities"
    }

    fn description(&self) -> &str {
        "Check a list of packages against the OSV vulnerability database. \
         Accepts up to 50 packages per call."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "ecosystem": {
                    "type": "string",
                    "description": "Package ecosystem, e.g. 'crates.io', 'npm', 'PyPI', 'Go'"
                },
                "packages": {
                    "type": "array",
                    "items": { "type": "string" },
                    "description": "Package names to check"
                }
            },
            "required": ["ecosystem", "packages"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<String, ToolError> {
        let ecosystem = args
            .get("ecosystem")
            .and_then(|v| v.as_str())
            .ok_or(ToolError::MissingArgument("ecosystem"))?;
        let packages: Vec<String> = args
            .get("packages")
            .and_then(|v| v.as_array())
            .ok_or(ToolError::MissingArgument("packages"))?
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .take(MAX_PACKAGES)
            .collect();

        if packages.is_empty() {
            return Ok("(no packages to check)".to_string());
        }

        let queries: Vec<Value> = packages
            .iter()
            .map(|name| json!({"package": {"name": name, "ecosystem": ecosystem}}))
            .collect();

        let batch: Value = ctx
            .http
            .post(format!("{OSV_API}/querybatch"))
            .json(&json!({ "queries": queries }))
            .send()
            .await
            .map_err(|e| ToolError::Failed(format!("vulnerability query failed: {e}")))?
            .json()
            .await
            .map_err(|e| ToolError::Failed(format!("vulnerability response invalid: {e}")))?;

        let empty = vec![];
        let results = batch["results"].as_array().unwrap_or(&empty);

        let mut report = String::new();
        for (i, name) in packages.iter().enumerate() {
            let has_hits = results
                .get(i)
                .and_then(|r| r["vulns"].as_array())
                .is_some_and(|v| !v.is_empty());
            if !has_hits {
                continue;
            }

            // The batch response carries ids only; fetch the full records
            // for this package in one follow-up query.
            let detail: Value = ctx
                .http
                .post(format!("{OSV_API}/query"))
                .json(&json!({"package": {"name": name, "ecosystem": ecosystem}}))
                .send()
                .await
                .map_err(|e| ToolError::Failed(format!("vulnerability query failed: {e}")))?
                .json()
                .await
                .map_err(|e| ToolError::Failed(format!("vulnerability response invalid: {e}")))?;

            report.push_str(&format_package_report(name, &detail));
        }

        if report.is_empty() {
            return Ok(format!(
                "No known vulnerabilities in the {} checked package(s).",
                packages.len()
            ));
        }
        Ok(cap_output(report, MAX_TOOL_OUTPUT))
    }
}

fn format_package_report(name: &str, detail: &Value) -> String {
    let empty = vec![];
    let vulns = detail["vulns"].as_array().unwrap_or(&empty);
    let mut out = format!("{name}: {} advisories\n", vulns.len());
    for vuln in vulns {
        let id = vuln["id"].as_str().unwrap_or("unknown-id");
        let summary = vuln["summary"].as_str().unwrap_or("(no summary)");
        let severity = severity_label(vuln);
        match first_fixed_version(vuln) {
            Some(fixed) => {
                out.push_str(&format!("  - {id} ({severity}): {summary} (fixed in {fixed})\n"))
            }
            None => out.push_str(&format!("  - {id} ({severity}): {summary} (no fix listed)\n")),
        }
    }
    out
}

/// Prefer a CVSS_V3 numeric score; 9+ is critical, 7+ high, 4+ moderate,
/// otherwise low. Falls back to the database's own label.
fn severity_label(vuln: &Value) -> String {
    let cvss_score = vuln["severity"]
        .as_array()
        .into_iter()
        .flatten()
        .find(|s| s["type"].as_str() == Some("CVSS_V3"))
        .and_then(|s| s["score"].as_str())
        .and_then(|score| score.parse::<f64>().ok());

    if let Some(score) = cvss_score {
        return if score >= 9.0 {
            "critical".to_string()
        } else if score >= 7.0 {
            "high".to_string()
        } else if score >= 4.0 {
            "moderate".to_string()
        } else {
            "low".to_string()
        };
    }

    vuln["database_specific"]["severity"]
        .as_str()
        .map(str::to_lowercase)
        .unwrap_or_else(|| "unknown".to_string())
}

/// First `fixed` event across the affected ranges.
fn first_fixed_version(vuln: &Value) -> Option<String> {
    vuln["affected"]
        .as_array()?
        .iter()
        .flat_map(|a| a["ranges"].as_array().into_iter().flatten())
        .flat_map(|r| r["events"].as_array().into_iter().flatten())
        .find_map(|e| e["fixed"].as_str().map(str::to_string))
}
