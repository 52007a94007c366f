//! Unified diff of what an app-to-file sync would write.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use similar::TextDiff;

/// Result of a dry-run app-to-file sync. Nothing is written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Preview {
    pub path: PathBuf,
    /// Tasks the file would contain.
    pub tasks: usize,
    /// `None` when the file is already up to date.
    pub unified_diff: Option<String>,
}

impl Preview {
    pub fn is_unchanged(&self) -> bool {
        self.unified_diff.is_none()
    }
}

/// Unified diff between `current` and `proposed`, or `None` if they match
/// after line-ending normalization.
pub fn unified_diff(label: &str, current: &str, proposed: &str) -> Option<String> {
    let current = current.replace("\r\n", "\n");
    let proposed = proposed.replace("\r\n", "\n");
    if current == proposed {
        return None;
    }
    let old_header = format!("a/{label}");
    let new_header = format!("b/{label}");
    Some(
        TextDiff::from_lines(&current, &proposed)
            .unified_diff()
            .header(&old_header, &new_header)
            .context_radius(3)
            .to_string(),
    )
}
