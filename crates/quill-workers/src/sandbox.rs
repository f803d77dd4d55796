//! Sandbox directories and job partitioning.

use quill_client::QuillResult;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Divide items into `count` groups, round-robin, so group sizes differ by
/// at most one and losing one group spreads the damage.
pub fn divide<T>(items: Vec<T>, count: usize) -> Vec<Vec<T>> {
    let mut groups: Vec<Vec<T>> = (0..count).map(|_| Vec::new()).collect();
    if count == 0 {
        return groups;
    }
    for (index, item) in items.into_iter().enumerate() {
        groups[index % count].push(item);
    }
    groups
}

/// Remove everything inside `path`, leaving the directory itself.
pub fn clean(path: &Path) -> std::io::Result<()> {
    for entry in fs::read_dir(path)? {
        let entry = entry?;
        let entry_path = entry.path();
        if entry.file_type()?.is_dir() {
            debug!(path = %entry_path.display(), "Removing directory");
            fs::remove_dir_all(&entry_path)?;
        } else {
            debug!(path = %entry_path.display(), "Removing file");
            fs::remove_file(&entry_path)?;
        }
    }
    Ok(())
}

/// Ensure `path` exists and is empty.
pub fn create_clean(path: &Path) -> std::io::Result<()> {
    fs::create_dir_all(path)?;
    clean(path)
}

/// An empty working directory held for the duration of one job. Created
/// clean on enter; cleaned again on drop, including on cancellation and
/// error paths.
pub struct Sandbox {
    path: PathBuf,
}

impl Sandbox {
    pub fn enter(path: impl Into<PathBuf>) -> QuillResult<Self> {
        let path = path.into();
        create_clean(&path)?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for Sandbox {
    fn drop(&mut self) {
        if let Err(err) = clean(&self.path) {
            warn!(path = %self.path.display(), error = %err, "Failed to clean sandbox");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("quill-sandbox-{}-{}", name, std::process::id()))
    }

    #[test]
    fn test_divide_even_spread() {
        let groups = divide((0..100).collect::<Vec<_>>(), 7);
        assert_eq!(groups.len(), 7);
        for group in &groups {
            assert!(group.len() == 14 || group.len() == 15);
        }
        let mut flattened: Vec<i32> = groups.into_iter().flatten().collect();
        flattened.sort_unstable();
        assert_eq!(flattened, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn test_divide_empty_input() {
        let groups = divide(Vec::<u8>::new(), 4);
        assert_eq!(groups.len(), 4);
        assert!(groups.iter().all(Vec::is_empty));
    }

    #[test]
    fn test_divide_fewer_items_than_groups() {
        let groups = divide(vec!["a", "b"], 5);
        assert_eq!(groups[0], ["a"]);
        assert_eq!(groups[1], ["b"]);
        assert!(groups[2..].iter().all(Vec::is_empty));
    }

    #[test]
    fn test_sandbox_cleans_on_enter_and_drop() {
        let root = scratch("lifecycle");
        fs::create_dir_all(&root).unwrap();
        fs::write(root.join("stale"), b"junk").unwrap();

        {
            let sandbox = Sandbox::enter(&root).unwrap();
            assert!(!root.join("stale").exists());
            fs::write(sandbox.path().join("scratch"), b"work").unwrap();
        }
        assert!(root.exists());
        assert!(!root.join("scratch").exists());

        fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn test_sandbox_creates_missing_directories() {
        let root = scratch("nested").join("a").join("b");
        let _sandbox = Sandbox::enter(&root).unwrap();
        assert!(root.is_dir());
        fs::remove_dir_all(root.parent().unwrap().parent().unwrap()).unwrap();
    }
}
