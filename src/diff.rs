//! Reconciliation of `git diff --name-status` output.
//!
//! Each line is `<status>\t<path>` or, for renames, `R<score>\t<old>\t<new>`.
//! Added, modified and renamed-to paths are reprocessed; deleted and
//! renamed-from paths have their records removed explicitly.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

/// Paths touched since a recorded commit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiffChanges {
    /// Files to reprocess, joined to the repository root.
    pub changed_files: BTreeSet<PathBuf>,
    /// Repository-relative paths whose records must go, in diff order.
    pub deleted_paths: Vec<String>,
}

impl DiffChanges {
    pub fn is_empty(&self) -> bool {
        self.changed_files.is_empty() && self.deleted_paths.is_empty()
    }
}

/// Parse tab-separated name-status lines relative to `root`.
///
/// Unknown statuses (copies, type changes) and blank lines are skipped.
pub fn parse_name_status(raw: &str, root: &Path) -> DiffChanges {
    let mut changes = DiffChanges::default();

    for line in raw.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let mut fields = line.split('\t');
        let status = fields.next().unwrap_or_default().trim();
        let first = fields.next().map(str::trim).filter(|p| !p.is_empty());
        let second = fields.next().map(str::trim).filter(|p| !p.is_empty());

        match (status, first, second) {
            ("A" | "M", Some(path), _) => {
                changes.changed_files.insert(root.join(path));
            }
            ("D", Some(path), _) => changes.deleted_paths.push(path.to_string()),
            (s, Some(old), Some(new)) if s.starts_with('R') => {
                changes.deleted_paths.push(old.to_string());
                changes.changed_files.insert(root.join(new));
            }
            _ => tracing::debug!(line, "ignoring diff line"),
        }
    }

    changes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_status_reconciliation() {
        let raw = "A\tnew.ts\nM\tmod.ts\nD\tgone.ts\nR100\told.ts\tnew2.ts\n";
        let root = Path::new("/repo");
        let changes = parse_name_status(raw, root);

        let expected: BTreeSet<PathBuf> = ["new.ts", "mod.ts", "new2.ts"]
            .iter()
            .map(|p| root.join(p))
            .collect();
        assert_eq!(changes.changed_files, expected);
        assert_eq!(changes.deleted_paths, vec!["gone.ts", "old.ts"]);
    }

    #[test]
    fn test_blank_lines_and_duplicates() {
        let raw = "\nM\ta.md\n\nM\ta.md\nD\tb.md\nD\tb.md\n   \n";
        let changes = parse_name_status(raw, Path::new("r"));
        assert_eq!(changes.changed_files.len(), 1);
        assert_eq!(changes.deleted_paths, vec!["b.md", "b.md"]);
    }

    #[test]
    fn test_empty_diff() {
        assert!(parse_name_status("", Path::new("r")).is_empty());
    }
}
