//! Adding exploded deployments from the filesystem.

use crate::error::{Error, Result};
use crate::hash::Hash;
use crate::repository::Repository;
use crate::staged::UnpersistedItem;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

impl Repository {
    /// Add a directory tree and return its hash.
    ///
    /// Every file is staged and hashed, directories are hashed bottom-up and
    /// the tree is persisted with dedup. Hidden files are included; symlinks
    /// and special files are rejected. No reference is added.
    pub fn add_directory(&self, path: &Path) -> Result<Hash> {
        let metadata = fs::metadata(path)?;
        if !metadata.is_dir() {
            return Err(Error::invalid_entry(format!(
                "not a directory: {}",
                path.display()
            )));
        }

        let mut root = UnpersistedItem::directory();
        let mut files = 0usize;
        let mut pending: Vec<(PathBuf, Vec<String>)> = vec![(path.to_path_buf(), Vec::new())];

        while let Some((dir, segments)) = pending.pop() {
            let parent: Vec<&str> = segments.iter().map(String::as_str).collect();
            root.directory_at(&parent)?;

            let walker = ignore::WalkBuilder::new(&dir)
                .max_depth(Some(1))
                .standard_filters(false)
                .follow_links(false)
                .build();

            for entry in walker {
                let entry = entry?;
                if entry.depth() == 0 {
                    continue;
                }

                let entry_path = entry.path();
                let name = entry_path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .ok_or_else(|| {
                        Error::invalid_entry(format!("Invalid filename: {}", entry_path.display()))
                    })?
                    .to_string();
                let file_type = entry
                    .file_type()
                    .ok_or_else(|| Error::invalid_entry(format!("Unknown file type: {}", entry_path.display())))?;

                if file_type.is_symlink() {
                    return Err(Error::invalid_entry(format!(
                        "Symlinks not supported: {}",
                        entry_path.display()
                    )));
                } else if file_type.is_dir() {
                    let mut child = segments.clone();
                    child.push(name);
                    pending.push((entry_path.to_path_buf(), child));
                } else if file_type.is_file() {
                    let file = fs::File::open(entry_path)?;
                    let leaf = UnpersistedItem::stage_leaf(&self.layout, self.algorithm(), file)?;
                    root.insert(&parent, &name, leaf)?;
                    files += 1;
                } else {
                    return Err(Error::invalid_entry(format!(
                        "Unsupported file type: {}",
                        entry_path.display()
                    )));
                }
            }
        }

        let hash = root.compute_hash(self.algorithm())?;
        root.persist(&self.layout, &self.tracker, hash, &hash.to_hex())?;

        info!(path = %path.display(), hash = %hash, files, "directory added");
        Ok(hash)
    }
}
