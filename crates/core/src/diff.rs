/// Maximum diff size embedded in the opening prompt. Larger diffs are cut
/// with an explicit marker so the model knows to re-fetch with `git_diff`.
pub const PROMPT_DIFF_CAP: usize = 100_000;

/// Unique changed-file paths, in diff order, taken from `+++ b/` headers.
pub fn extract_changed_files(diff: &str) -> Vec<String> {
    let mut files = Vec::new();
    for line in diff.lines() {
        if let Some(path) = line.strip_prefix("+++ b/") {
            let path = path.trim();
            if !path.is_empty() && !files.iter().any(|f| f == path) {
                files.push(path.to_string());
            }
        }
    }
    files
}

/// Truncate a diff to `limit` characters, appending a marker that tells
/// the model truncation happened.
pub fn cap_diff(diff: &str, limit: usize) -> String {
    if diff.len() <= limit {
        return diff.to_string();
    }
    let mut cut = limit;
    while !diff.is_char_boundary(cut) {
        cut -= 1;
    }
    format!(
        "{}\n\n[diff truncated at {} characters; use the git_diff tool to re-fetch sections you need]",
        &diff[..cut],
        limit
    )
}

/// Added and deleted line counts, excluding file headers.
pub fn diff_stats(diff: &str) -> (u64, u64) {
    let mut additions = 0;
    let mut deletions = 0;
    for line in diff.lines() {
        if line.starts_with("+++") || line.starts_with("---") {
            continue;
        }
        if line.starts_with('+') {
            additions += 1;
        } else if line.starts_with('-') {
            deletions += 1;
        }
    }
    (additions, deletions)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
diff --git a/src/lib.rs b/src/lib.rs
--- a/src/lib.rs
+++ b/src/lib.rs
@@ -1 +1 @@
-old
+new
diff --git a/src/lib.rs b/src/lib.rs
+++ b/src/lib.rs
diff --git a/docs/guide.md b/docs/guide.md
--- /dev/null
+++ b/docs/guide.md
@@ -0,0 +1 @@
+hello
";

    #[test]
    fn changed_files_are_unique_and_ordered() {
        assert_eq!(
            extract_changed_files(SAMPLE),
            vec!["src/lib.rs".to_string(), "docs/guide.md".to_string()]
        );
    }

    #[test]
    fn empty_diff_has_no_files() {
        assert!(extract_changed_files("").is_empty());
    }

    #[test]
    fn stats_skip_file_headers() {
        assert_eq!(diff_stats(SAMPLE), (2, 1));
    }

    #[test]
    fn cap_marks_truncation() {
        let diff = "x".repeat(200);
        let capped = cap_diff(&diff, 100);
        assert!(capped.starts_with(&"x".repeat(100)));
        assert!(capped.contains("truncated at 100 characters"));

        let short = cap_diff("small", 100);
        assert_eq!(short, "small");
    }
}
