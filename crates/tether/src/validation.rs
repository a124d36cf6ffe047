//! Input validation and path sanitization.
//!
//! Leaf dependency for everything above it: prompts, session-id tokens, and
//! working directories are checked here before any subprocess is spawned.
//! Traversal attempts come back as [`TetherError::SecurityViolation`] so the
//! caller can surface a security event rather than a plain rejection.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;

use crate::error::{Result, TetherError};

/// Upper bound on prompt length, in bytes.
const MAX_PROMPT_BYTES: usize = 100_000;

static SESSION_ID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]{0,127}$").expect("session id regex")
});

/// Validate a prompt, returning the trimmed text.
pub fn validate_prompt(prompt: &str) -> Result<&str> {
    let trimmed = prompt.trim();
    if trimmed.is_empty() {
        return Err(TetherError::InvalidPrompt("prompt is empty".into()));
    }
    if trimmed.len() > MAX_PROMPT_BYTES {
        return Err(TetherError::InvalidPrompt(format!(
            "prompt exceeds {MAX_PROMPT_BYTES} bytes"
        )));
    }
    if trimmed.contains('\0') {
        return Err(TetherError::SecurityViolation(
            "prompt contains a NUL byte".into(),
        ));
    }
    Ok(trimmed)
}

/// Validate a session identifier token.
///
/// Session ids travel into agent command lines (`--resume <id>`), so the
/// grammar is deliberately narrow: alphanumeric plus `.`, `_`, `-`.
pub fn validate_session_id(id: &str) -> Result<()> {
    if SESSION_ID_RE.is_match(id) {
        Ok(())
    } else {
        Err(TetherError::InvalidSessionId(id.to_string()))
    }
}

/// Validate a working directory and pin it under the workspace root.
///
/// The path must be absolute, exist, and canonicalize to somewhere inside
/// `workspace_root`. Escaping the root (`..`, symlinks) is a security
/// violation, not a not-found.
pub fn validate_working_directory(path: &str, workspace_root: &Path) -> Result<PathBuf> {
    let candidate = PathBuf::from(path);
    if !candidate.is_absolute() {
        return Err(TetherError::InvalidWorkingDirectory {
            path: candidate,
            reason: "path must be absolute".into(),
        });
    }

    let canonical = candidate
        .canonicalize()
        .map_err(|e| TetherError::InvalidWorkingDirectory {
            path: candidate.clone(),
            reason: e.to_string(),
        })?;
    if !canonical.is_dir() {
        return Err(TetherError::InvalidWorkingDirectory {
            path: canonical,
            reason: "not a directory".into(),
        });
    }

    let root = workspace_root
        .canonicalize()
        .map_err(|e| TetherError::InvalidWorkingDirectory {
            path: workspace_root.to_path_buf(),
            reason: format!("workspace root unavailable: {e}"),
        })?;
    if !canonical.starts_with(&root) {
        return Err(TetherError::SecurityViolation(format!(
            "working directory {canonical:?} escapes workspace root {root:?}"
        )));
    }

    Ok(canonical)
}

/// Sanitize a client-supplied filename down to a safe basename.
pub fn sanitize_file_name(name: &str) -> String {
    let base = name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(name)
        .trim_start_matches('.');
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .take(64)
        .collect();
    if cleaned.is_empty() {
        "file".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_prompt_trims() {
        assert_eq!(validate_prompt("  list files  ").unwrap(), "list files");
    }

    #[test]
    fn test_validate_prompt_rejects_empty() {
        assert!(matches!(
            validate_prompt("   "),
            Err(TetherError::InvalidPrompt(_))
        ));
    }

    #[test]
    fn test_validate_prompt_rejects_nul() {
        assert!(matches!(
            validate_prompt("ls\0; rm -rf /"),
            Err(TetherError::SecurityViolation(_))
        ));
    }

    #[test]
    fn test_session_id_grammar() {
        assert!(validate_session_id("ext-123").is_ok());
        assert!(validate_session_id("a1b2c3d4-e5f6-7890-abcd-ef0123456789").is_ok());
        assert!(validate_session_id("").is_err());
        assert!(validate_session_id("-leading-dash").is_err());
        assert!(validate_session_id("has space").is_err());
        assert!(validate_session_id("semi;colon").is_err());
        assert!(validate_session_id(&"x".repeat(200)).is_err());
    }

    #[test]
    fn test_working_directory_must_be_absolute() {
        let root = tempfile::tempdir().unwrap();
        let err = validate_working_directory("relative/path", root.path()).unwrap_err();
        assert!(matches!(err, TetherError::InvalidWorkingDirectory { .. }));
    }

    #[test]
    fn test_working_directory_inside_root() {
        let root = tempfile::tempdir().unwrap();
        let project = root.path().join("proj");
        std::fs::create_dir(&project).unwrap();

        let resolved =
            validate_working_directory(project.to_str().unwrap(), root.path()).unwrap();
        assert!(resolved.ends_with("proj"));
    }

    #[test]
    fn test_working_directory_traversal_is_security_violation() {
        let root = tempfile::tempdir().unwrap();
        let inside = root.path().join("inside");
        std::fs::create_dir(&inside).unwrap();

        let sneaky = format!("{}/inside/../..", root.path().display());
        let err = validate_working_directory(&sneaky, root.path()).unwrap_err();
        assert!(err.is_security_violation());
    }

    #[test]
    fn test_sanitize_file_name() {
        assert_eq!(sanitize_file_name("report.pdf"), "report.pdf");
        assert_eq!(sanitize_file_name("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_file_name("weird name!.txt"), "weird_name_.txt");
        assert_eq!(sanitize_file_name("..."), "file");
    }
}
