//! Todo file path validation.
//!
//! Checks are lexical only (no filesystem access), so they run identically
//! against the local disk and in-memory file systems.

use std::path::{Component, Path, PathBuf};

use crate::error::CoreError;

/// File extensions accepted for the synced task list.
const MARKDOWN_EXTENSIONS: &[&str] = &["md", "markdown"];

/// Reject empty paths, NUL bytes, `..` components, and non-Markdown files.
pub fn validate_todo_path(path: &Path) -> Result<(), CoreError> {
    if path.as_os_str().is_empty() {
        return Err(invalid(path, "path is empty"));
    }
    if path.to_string_lossy().contains('\0') {
        return Err(invalid(path, "path contains a NUL byte"));
    }
    if path.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err(CoreError::PathTraversal {
            path: path.to_path_buf(),
        });
    }
    let is_markdown = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            MARKDOWN_EXTENSIONS
                .iter()
                .any(|allowed| ext.eq_ignore_ascii_case(allowed))
        })
        .unwrap_or(false);
    if !is_markdown {
        return Err(invalid(path, "expected a .md or .markdown file"));
    }
    Ok(())
}

/// Validate `path` and require it to resolve inside `root`.
///
/// Relative paths are joined onto `root`. Returns the resolved path.
pub fn validate_within(path: &Path, root: &Path) -> Result<PathBuf, CoreError> {
    validate_todo_path(path)?;
    let resolved = if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    };
    let normalized: PathBuf = resolved
        .components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect();
    if !normalized.starts_with(root) {
        return Err(CoreError::PathTraversal { path: resolved });
    }
    Ok(normalized)
}

fn invalid(path: &Path, reason: &str) -> CoreError {
    CoreError::InvalidPath {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("/work/TODO.md")]
    #[case("notes/tasks.markdown")]
    #[case("./TODO.MD")]
    fn accepts_markdown_paths(#[case] path: &str) {
        assert!(validate_todo_path(Path::new(path)).is_ok());
    }

    #[rstest]
    #[case("../TODO.md")]
    #[case("/work/../../etc/TODO.md")]
    fn rejects_parent_components(#[case] path: &str) {
        assert!(matches!(
            validate_todo_path(Path::new(path)),
            Err(CoreError::PathTraversal { .. })
        ));
    }

    #[rstest]
    #[case("")]
    #[case("/etc/passwd")]
    #[case("/work/TODO.txt")]
    fn rejects_unusable_paths(#[case] path: &str) {
        assert!(matches!(
            validate_todo_path(Path::new(path)),
            Err(CoreError::InvalidPath { .. })
        ));
    }

    #[test]
    fn within_root_joins_relative_paths() {
        let resolved = validate_within(Path::new("./TODO.md"), Path::new("/work")).unwrap();
        assert_eq!(resolved, PathBuf::from("/work/TODO.md"));
    }

    #[test]
    fn within_root_rejects_absolute_escape() {
        let err = validate_within(Path::new("/elsewhere/TODO.md"), Path::new("/work")).unwrap_err();
        assert!(matches!(err, CoreError::PathTraversal { .. }));
    }
}
