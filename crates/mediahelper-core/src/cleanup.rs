use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use log::debug;
use rayon::prelude::*;

/// Delete every empty directory below each root, deepest first. The roots
/// themselves are kept. Returns how many directories were removed.
pub fn delete_empty_directories<P: AsRef<Path> + Sync>(roots: &[P]) -> u64 {
    let removed = AtomicU64::new(0);
    roots.par_iter().for_each(|root| {
        let root = root.as_ref();
        if root.is_dir() {
            prune_children(root, &removed);
        }
    });
    removed.into_inner()
}

/// Returns true if `dir` is empty once its empty subdirectories are gone.
fn prune_children(dir: &Path, removed: &AtomicU64) -> bool {
    let Ok(entries) = fs::read_dir(dir) else {
        return false;
    };
    let mut subdirs = Vec::new();
    let mut has_files = false;
    for entry in entries.flatten() {
        match entry.file_type() {
            Ok(t) if t.is_dir() => subdirs.push(entry.path()),
            _ => has_files = true,
        }
    }

    let kept_subdirs = subdirs
        .par_iter()
        .filter(|sub| {
            if prune_children(sub, removed) && fs::remove_dir(sub).is_ok() {
                debug!("removed empty directory {}", sub.display());
                removed.fetch_add(1, Ordering::Relaxed);
                false
            } else {
                true
            }
        })
        .count();

    !has_files && kept_subdirs == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_removes_nested_empty_directories_only() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("a/b/c")).unwrap();
        fs::create_dir_all(root.join("d/e")).unwrap();
        fs::write(root.join("d/keep.jpg"), b"x").unwrap();
        fs::create_dir_all(root.join("f")).unwrap();
        fs::write(root.join("f/g.jpg"), b"x").unwrap();

        let removed = delete_empty_directories(&[root]);
        assert_eq!(removed, 4);
        assert!(root.exists());
        assert!(!root.join("a").exists());
        assert!(!root.join("d/e").exists());
        assert!(root.join("d/keep.jpg").exists());
        assert!(root.join("f/g.jpg").exists());
    }

    #[test]
    fn test_empty_root_is_kept() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(delete_empty_directories(&[dir.path()]), 0);
        assert!(dir.path().exists());
        assert_eq!(delete_empty_directories(&[dir.path().join("missing")]), 0);
    }
}
