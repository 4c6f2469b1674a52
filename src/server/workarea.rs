//! Per-application work area allocation and cleanup (spec.md §4.6, §5).
//!
//! Each submitted application gets a private directory under the
//! configured work-area root, named by its id; stale directories left
//! behind by applications whose record has been flushed are swept with
//! `walkdir`, matching the teacher's approach to work-area hygiene.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

pub fn allocate(root: &Path, app_id: u64) -> Result<PathBuf> {
    let dir = root.join(app_id.to_string());
    std::fs::create_dir_all(&dir).with_context(|| format!("creating work area {:?}", dir))?;
    Ok(dir)
}

/// Removes every subdirectory of `root` whose name (parsed as an app id) is
/// not in `active_ids`.
pub fn sweep_stale(root: &Path, active_ids: &HashSet<u64>) -> Result<Vec<PathBuf>> {
    let mut removed = Vec::new();
    if !root.exists() {
        return Ok(removed);
    }

    for entry in walkdir::WalkDir::new(root).min_depth(1).max_depth(1) {
        let entry = entry?;
        if !entry.file_type().is_dir() {
            continue;
        }
        let is_stale = match entry.file_name().to_str().and_then(|n| n.parse::<u64>().ok()) {
            Some(id) => !active_ids.contains(&id),
            None => true,
        };
        if is_stale {
            std::fs::remove_dir_all(entry.path()).with_context(|| format!("removing stale work area {:?}", entry.path()))?;
            removed.push(entry.path().to_path_buf());
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_creates_a_per_app_directory() {
        let tmp = std::env::temp_dir().join(format!("ddm-core-test-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&tmp);
        let dir = allocate(&tmp, 42).unwrap();
        assert!(dir.is_dir());
        assert_eq!(dir.file_name().unwrap(), "42");
        std::fs::remove_dir_all(&tmp).unwrap();
    }

    #[test]
    fn sweep_removes_only_inactive_directories() {
        let tmp = std::env::temp_dir().join(format!("ddm-core-test-sweep-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&tmp);
        allocate(&tmp, 1).unwrap();
        allocate(&tmp, 2).unwrap();

        let mut active = HashSet::new();
        active.insert(1u64);
        let removed = sweep_stale(&tmp, &active).unwrap();

        assert_eq!(removed.len(), 1);
        assert!(tmp.join("1").is_dir());
        assert!(!tmp.join("2").exists());
        std::fs::remove_dir_all(&tmp).unwrap();
    }
}
