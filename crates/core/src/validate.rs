use std::sync::LazyLock;

use regex::Regex;

pub static REPO_FULL_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_.-]+/[A-Za-z0-9_.-]+$").expect("valid regex"));

pub static GIT_REF: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._/-]*$").expect("valid regex"));

pub static GIT_SHA: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9a-fA-F]{7,40}$").expect("valid regex"));

/// Characters that enable chaining, subshells, expansion, or redirection
/// when interpolated into a `sh -c` line.
pub const SHELL_METACHARACTERS: &[char] = &[
    ';', '|', '&', '`', '$', '(', ')', '{', '}', '>', '<', '\n', '\r', '\\', '!', '"', '#', '~',
];

pub fn contains_shell_metacharacters(s: &str) -> bool {
    s.chars().any(|c| SHELL_METACHARACTERS.contains(&c))
}

pub fn is_valid_repo_full_name(s: &str) -> bool {
    REPO_FULL_NAME.is_match(s)
}

pub fn is_valid_ref(s: &str) -> bool {
    GIT_REF.is_match(s)
}

pub fn is_valid_sha(s: &str) -> bool {
    GIT_SHA.is_match(s)
}

/// Normalize a tool-supplied path and confine it to the sandbox workdir.
///
/// Segments are split on `/`; empty and `.` segments are dropped; `..`
/// pops. The result must remain strictly under `workdir`.
pub fn jail_path(workdir: &str, path: &str) -> Result<String, String> {
    if path.contains('\0') {
        return Err("path contains a null byte".to_string());
    }

    let joined = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("{}/{}", workdir.trim_end_matches('/'), path)
    };

    let mut stack: Vec<&str> = Vec::new();
    for segment in joined.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                stack.pop();
            }
            other => stack.push(other),
        }
    }
    let normalized = format!("/{}", stack.join("/"));

    let prefix = format!("{}/", workdir.trim_end_matches('/'));
    if normalized.starts_with(&prefix) {
        Ok(normalized)
    } else {
        Err(format!("path escapes the sandbox: {path}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repo_ref_sha_regexes() {
        assert!(is_valid_repo_full_name("octo/hello"));
        assert!(is_valid_repo_full_name("my.org/repo-name_2"));
        assert!(!is_valid_repo_full_name("octo"));
        assert!(!is_valid_repo_full_name("octo/he llo"));
        assert!(!is_valid_repo_full_name("a/b/c"));

        assert!(is_valid_ref("main"));
        assert!(is_valid_ref("feature/add-parser"));
        assert!(!is_valid_ref("-rf"));
        assert!(!is_valid_ref("branch;rm"));

        assert!(is_valid_sha("aaaaaaa"));
        assert!(is_valid_sha("0123456789abcdef0123456789abcdef01234567"));
        assert!(!is_valid_sha("abc"));
        assert!(!is_valid_sha("zzzzzzz"));
    }

    #[test]
    fn jail_rejects_absolute_paths_outside_workdir() {
        assert!(jail_path("/work/octo--hello", "/etc/passwd").is_err());
    }

    #[test]
    fn jail_rejects_parent_escape() {
        assert!(jail_path("/work/octo--hello", "../escape").is_err());
        assert!(jail_path("/work/octo--hello", "a/../../escape").is_err());
    }

    #[test]
    fn jail_rejects_null_bytes() {
        assert!(jail_path("/work/octo--hello", "src/\0main.rs").is_err());
    }

    #[test]
    fn jail_normalizes_inside_paths() {
        assert_eq!(
            jail_path("/work/octo--hello", "src/./a/../main.rs").unwrap(),
            "/work/octo--hello/src/main.rs"
        );
        assert_eq!(
            jail_path("/work/octo--hello", "README.md").unwrap(),
            "/work/octo--hello/README.md"
        );
    }

    #[test]
    fn metacharacter_screen() {
        assert!(contains_shell_metacharacters("git log; rm -rf /"));
        assert!(contains_shell_metacharacters("echo $(whoami)"));
        assert!(contains_shell_metacharacters("a > b"));
        assert!(!contains_shell_metacharacters("cargo test --workspace"));
    }
}
