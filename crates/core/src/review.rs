use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Approve,
    RequestChanges,
    Comment,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Approve => "approve",
            Verdict::RequestChanges => "request_changes",
            Verdict::Comment => "comment",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "approve" => Some(Verdict::Approve),
            "request_changes" => Some(Verdict::RequestChanges),
            "comment" => Some(Verdict::Comment),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Note,
    Suggestion,
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Critical => "critical",
            Severity::Warning => "warning",
            Severity::Suggestion => "suggestion",
            Severity::Note => "note",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "critical" => Some(Severity::Critical),
            "warning" => Some(Severity::Warning),
            "suggestion" => Some(Severity::Suggestion),
            "note" => Some(Severity::Note),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Finding {
    pub skill: String,
    pub severity: Severity,
    pub path: String,
    pub line: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_line: Option<i64>,
    pub title: String,
    pub body: String,
}

impl Finding {
    /// Eligible for posting as an inline comment.
    pub fn inline_eligible(&self) -> bool {
        !self.path.is_empty() && self.line >= 1
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Review {
    pub verdict: Verdict,
    pub summary: String,
    pub findings: Vec<Finding>,
}

/// The verdict law: any critical finding forces `request_changes`; any
/// warning or suggestion forces at least `comment`; notes alone approve.
pub fn derive_verdict(findings: &[Finding]) -> Verdict {
    if findings.iter().any(|f| f.severity == Severity::Critical) {
        Verdict::RequestChanges
    } else if findings
        .iter()
        .any(|f| matches!(f.severity, Severity::Warning | Severity::Suggestion))
    {
        Verdict::Comment
    } else {
        Verdict::Approve
    }
}

static REVIEW_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<review>(.*?)</review>").expect("valid regex"));

static FENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)^\s*```(?:json)?\s*(.*?)\s*```\s*$").expect("valid regex")
});

/// Extract and parse the first `<review>…</review>` envelope from model
/// output. Returns `None` when no block exists, the JSON is invalid, or
/// the verdict is not one of the three literals.
pub fn parse_review(text: &str) -> Option<Review> {
    let captures = REVIEW_BLOCK.captures(text)?;
    let mut inner = captures.get(1)?.as_str().trim().to_string();

    if let Some(fenced) = FENCE.captures(&inner) {
        inner = fenced.get(1)?.as_str().to_string();
    }

    let value: serde_json::Value = serde_json::from_str(&inner).ok()?;
    let verdict = Verdict::parse(value.get("verdict")?.as_str()?)?;
    let summary = value
        .get("summary")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();

    let findings = value
        .get("findings")
        .and_then(|v| v.as_array())
        .map(|items| items.iter().filter_map(coerce_finding).collect())
        .unwrap_or_default();

    Some(Review {
        verdict,
        summary,
        findings,
    })
}

/// A finding survives iff it has a string `path` and an integer `line`;
/// every other field falls back to a safe default.
fn coerce_finding(value: &serde_json::Value) -> Option<Finding> {
    let path = value.get("path")?.as_str()?.to_string();
    let line = value.get("line")?.as_i64()?;

    let severity = value
        .get("severity")
        .and_then(|v| v.as_str())
        .and_then(Severity::parse)
        .unwrap_or(Severity::Suggestion);

    Some(Finding {
        skill: value
            .get("skill")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
            .to_string(),
        severity,
        path,
        line,
        end_line: value.get("end_line").and_then(|v| v.as_i64()),
        title: value
            .get("title")
            .and_then(|v| v.as_str())
            .unwrap_or("Finding")
            .to_string(),
        body: value
            .get("body")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn finding(severity: Severity) -> Finding {
        Finding {
            skill: "correctness".into(),
            severity,
            path: "src/lib.rs".into(),
            line: 3,
            end_line: None,
            title: "t".into(),
            body: "b".into(),
        }
    }

    #[test]
    fn verdict_law() {
        assert_eq!(derive_verdict(&[]), Verdict::Approve);
        assert_eq!(derive_verdict(&[finding(Severity::Note)]), Verdict::Approve);
        assert_eq!(
            derive_verdict(&[finding(Severity::Note), finding(Severity::Suggestion)]),
            Verdict::Comment
        );
        assert_eq!(
            derive_verdict(&[finding(Severity::Warning)]),
            Verdict::Comment
        );
        assert_eq!(
            derive_verdict(&[finding(Severity::Warning), finding(Severity::Critical)]),
            Verdict::RequestChanges
        );
    }

    #[test]
    fn parses_plain_envelope() {
        let text = r#"Here is my assessment.
<review>{"verdict":"comment","summary":"looks okay",
 "findings":[{"skill":"security","severity":"warning","path":"src/auth.rs","line":42,
              "title":"Token logged","body":"The token is written to the log."}]}</review>"#;
        let review = parse_review(text).unwrap();
        assert_eq!(review.verdict, Verdict::Comment);
        assert_eq!(review.findings.len(), 1);
        assert_eq!(review.findings[0].path, "src/auth.rs");
        assert_eq!(review.findings[0].line, 42);
    }

    #[test]
    fn strips_fenced_json() {
        let text = "<review>\n```json\n{\"verdict\":\"approve\",\"summary\":\"fine\"}\n```\n</review>";
        let review = parse_review(text).unwrap();
        assert_eq!(review.verdict, Verdict::Approve);
        assert!(review.findings.is_empty());
    }

    #[test]
    fn first_block_wins() {
        let text = "<review>{\"verdict\":\"approve\",\"summary\":\"a\"}</review>\n\
                    <review>{\"verdict\":\"comment\",\"summary\":\"b\"}</review>";
        assert_eq!(parse_review(text).unwrap().verdict, Verdict::Approve);
    }

    #[test]
    fn bad_verdict_or_json_is_rejected() {
        assert!(parse_review("<review>{\"verdict\":\"ship_it\",\"summary\":\"\"}</review>").is_none());
        assert!(parse_review("<review>not json</review>").is_none());
        assert!(parse_review("no envelope here").is_none());
    }

    #[test]
    fn findings_without_path_or_line_are_dropped_and_defaults_applied() {
        let text = r#"<review>{"verdict":"comment","summary":"s","findings":[
            {"path":"a.rs","line":1},
            {"path":"b.rs"},
            {"line":9},
            {"path":"c.rs","line":"seven"},
            {"path":"d.rs","line":2,"severity":"bogus"}
        ]}</review>"#;
        let review = parse_review(text).unwrap();
        assert_eq!(review.findings.len(), 2);
        let first = &review.findings[0];
        assert_eq!(first.skill, "unknown");
        assert_eq!(first.severity, Severity::Suggestion);
        assert_eq!(first.title, "Finding");
        assert_eq!(review.findings[1].severity, Severity::Suggestion);
    }

    #[test]
    fn inline_eligibility() {
        let mut f = finding(Severity::Note);
        assert!(f.inline_eligible());
        f.line = 0;
        assert!(!f.inline_eligible());
        f.line = 1;
        f.path.clear();
        assert!(!f.inline_eligible());
    }
}
