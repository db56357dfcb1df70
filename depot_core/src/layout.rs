//! Sharded on-disk layout, staging and atomic persistence.
//!
//! ```text
//! <root>/<hash[0:2]>/<hash[2:]>/content      leaf blob
//! <root>/<hash[0:2]>/<hash[2:]>/empty-dir    zero-length marker
//! <root>/<hash[0:2]>/<hash[2:]>/children     children index
//! <root>/.staging-XXXXXX                     staged bytes awaiting persist
//! ```

use crate::error::{Error, Result};
use crate::hash::{HASH_SIZE, Hash};
use std::collections::BTreeSet;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

/// File holding a leaf's raw bytes.
pub const CONTENT_FILE: &str = "content";

/// Zero-length marker of an empty directory.
pub const EMPTY_DIR_MARKER: &str = "empty-dir";

/// Text index of a non-empty directory's children.
pub const CHILDREN_INDEX: &str = "children";

/// Prefix of staging files created directly under the root.
pub const STAGING_PREFIX: &str = ".staging-";

/// Maps hashes to shard directories under a repository root.
#[derive(Debug, Clone)]
pub struct ShardLayout {
    root: PathBuf,
}

impl ShardLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Get the repository root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Get the shard directory for a hash: `<root>/<prefix>/<suffix>`.
    pub fn shard_dir(&self, hash: &Hash) -> PathBuf {
        self.root.join(hash.prefix()).join(hash.suffix())
    }

    /// Get the shard directory for a hash, creating missing segments.
    ///
    /// Fails with a Filesystem error if an existing segment is not a
    /// writable directory. A shard pruned by a concurrent collection pass
    /// while it is being created is recreated once.
    pub fn ensure_shard_dir(&self, hash: &Hash) -> Result<PathBuf> {
        let prefix_dir = self.root.join(hash.prefix());
        let shard_dir = prefix_dir.join(hash.suffix());

        ensure_writable_dir(&prefix_dir)?;
        if let Err(e) = ensure_writable_dir(&shard_dir) {
            if shard_dir.exists() {
                return Err(e);
            }
            debug!(hash = %hash, error = %e, "shard vanished while being created, retrying");
            ensure_writable_dir(&prefix_dir)?;
            ensure_writable_dir(&shard_dir)?;
        }
        Ok(shard_dir)
    }

    /// Move `staged` into the shard of `hash` as `name`.
    pub(crate) fn place_staged(&self, hash: &Hash, name: &str, staged: NamedTempFile) -> Result<()> {
        let dir = self.ensure_shard_dir(hash)?;
        self.move_into_shard(hash, &dir, name, staged)
    }

    fn move_into_shard(
        &self,
        hash: &Hash,
        dir: &Path,
        name: &str,
        staged: NamedTempFile,
    ) -> Result<()> {
        let dest = dir.join(name);
        match staged.persist(&dest) {
            Ok(_) => Ok(()),
            Err(err) if err.error.kind() == io::ErrorKind::NotFound && !dir.is_dir() => {
                debug!(hash = %hash, "shard pruned before move, recreating");
                self.ensure_shard_dir(hash)?;
                move_into_place(err.file, &dest)
            }
            Err(err) => copy_into_place(err, &dest),
        }
    }

    /// Write `bytes` atomically into the shard of `hash` as `name`.
    pub(crate) fn place_bytes(&self, hash: &Hash, name: &str, bytes: &[u8]) -> Result<()> {
        let dir = self.ensure_shard_dir(hash)?;
        self.write_into_shard(hash, &dir, name, bytes)
    }

    fn write_into_shard(&self, hash: &Hash, dir: &Path, name: &str, bytes: &[u8]) -> Result<()> {
        match write_atomic(&dir.join(name), bytes) {
            Err(Error::Io { source }) if source.kind() == io::ErrorKind::NotFound && !dir.is_dir() => {
                debug!(hash = %hash, "shard pruned before write, recreating");
                let dir = self.ensure_shard_dir(hash)?;
                write_atomic(&dir.join(name), bytes)
            }
            other => other,
        }
    }

    /// Create a staging file inside the root so the final move stays on one
    /// filesystem.
    pub fn stage(&self) -> Result<NamedTempFile> {
        let staged = tempfile::Builder::new()
            .prefix(STAGING_PREFIX)
            .tempfile_in(&self.root)?;
        debug!(path = %staged.path().display(), "staging file created");
        Ok(staged)
    }

    /// Remove the shard directories of a hash if they are empty.
    ///
    /// Best effort: a concurrent writer may have repopulated them.
    pub fn prune(&self, hash: &Hash) {
        let shard_dir = self.shard_dir(hash);
        if fs::remove_dir(&shard_dir).is_ok()
            && let Some(prefix_dir) = shard_dir.parent()
        {
            let _ = fs::remove_dir(prefix_dir);
        }
    }

    /// Walk the two-level shard structure and return every hash that has one
    /// of the stored forms present.
    ///
    /// Unreadable shards and names that are not hash fragments are logged
    /// and skipped; only a failure to read the root itself is an error.
    pub fn inventory(&self) -> Result<BTreeSet<Hash>> {
        let mut hashes = BTreeSet::new();

        for prefix_entry in fs::read_dir(&self.root)? {
            let prefix_entry = match prefix_entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(root = %self.root.display(), error = %e, "unreadable root entry");
                    continue;
                }
            };
            let prefix_path = prefix_entry.path();
            let Some(prefix) = shard_name(&prefix_path, 2) else {
                continue;
            };

            let suffixes = match fs::read_dir(&prefix_path) {
                Ok(entries) => entries,
                Err(e) => {
                    warn!(path = %prefix_path.display(), error = %e, "unreadable shard directory");
                    continue;
                }
            };

            for suffix_entry in suffixes.flatten() {
                let suffix_path = suffix_entry.path();
                let Some(suffix) = shard_name(&suffix_path, HASH_SIZE * 2 - 2) else {
                    continue;
                };

                match Hash::from_hex(&format!("{}{}", prefix, suffix)) {
                    Ok(hash) if has_stored_form(&suffix_path) => {
                        hashes.insert(hash);
                    }
                    Ok(_) => {}
                    Err(e) => debug!(path = %suffix_path.display(), error = %e, "skipping shard entry"),
                }
            }
        }

        Ok(hashes)
    }
}

/// Returns the directory name if `path` is a directory whose name has the
/// expected length of lower-case hex characters.
fn shard_name(path: &Path, len: usize) -> Option<String> {
    let name = path.file_name()?.to_str()?;
    if name.len() != len
        || !name.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
        || !path.is_dir()
    {
        return None;
    }
    Some(name.to_string())
}

fn has_stored_form(shard_dir: &Path) -> bool {
    [CONTENT_FILE, EMPTY_DIR_MARKER, CHILDREN_INDEX]
        .iter()
        .any(|name| shard_dir.join(name).is_file())
}

/// Make sure `path` is a writable directory, creating it if missing.
pub(crate) fn ensure_writable_dir(path: &Path) -> Result<()> {
    match fs::create_dir(path) {
        Ok(()) => return Ok(()),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
        Err(e) => return Err(Error::filesystem(path, format!("cannot create directory: {}", e))),
    }

    let metadata = fs::metadata(path)?;
    if !metadata.is_dir() {
        return Err(Error::filesystem(path, "exists but is not a directory"));
    }
    if metadata.permissions().readonly() {
        return Err(Error::filesystem(path, "directory is not writable"));
    }
    // Mode bits do not account for ownership
    tempfile::tempfile_in(path)
        .map_err(|e| Error::filesystem(path, format!("directory is not writable: {}", e)))?;
    Ok(())
}

/// Move a staged file to its final location.
///
/// Tries an atomic rename first. If that fails (for example across
/// filesystems) the bytes are copied into a temp file next to `dest` which is
/// then renamed; partial output is removed on failure.
pub(crate) fn move_into_place(staged: NamedTempFile, dest: &Path) -> Result<()> {
    match staged.persist(dest) {
        Ok(_) => Ok(()),
        Err(err) => copy_into_place(err, dest),
    }
}

fn copy_into_place(err: tempfile::PersistError, dest: &Path) -> Result<()> {
    warn!(
        dest = %dest.display(),
        error = %err.error,
        "rename of staged content failed, falling back to copy"
    );

    let staged = err.file;
    let parent = dest
        .parent()
        .ok_or_else(|| Error::filesystem(dest, "destination has no parent directory"))?;

    let mut copy = NamedTempFile::new_in(parent)?;
    let mut source = staged.reopen()?;
    io::copy(&mut source, copy.as_file_mut())?;
    copy.as_file().sync_all()?;
    copy.persist(dest)?;

    if let Err(e) = staged.close() {
        warn!(error = %e, "failed to delete staging file after copy");
    }
    Ok(())
}

/// Write small bytes (markers, indexes) atomically to `dest`.
pub(crate) fn write_atomic(dest: &Path, bytes: &[u8]) -> Result<()> {
    let parent = dest
        .parent()
        .ok_or_else(|| Error::filesystem(dest, "destination has no parent directory"))?;
    let mut temp = NamedTempFile::new_in(parent)?;
    temp.write_all(bytes)?;
    temp.flush()?;
    temp.persist(dest)?;
    Ok(())
}

/// Delete a file, tolerating absence; other failures are logged.
pub(crate) fn remove_file_logged(path: &Path) -> bool {
    match fs::remove_file(path) {
        Ok(()) => true,
        Err(e) if e.kind() == io::ErrorKind::NotFound => false,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to delete file");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::Algorithm;
    use tempfile::TempDir;

    #[test]
    fn test_shard_dir() {
        let temp_dir = TempDir::new().unwrap();
        let layout = ShardLayout::new(temp_dir.path());

        let hash = Hash::hash_bytes(Algorithm::Sha1, b"hello world");
        let path = layout.shard_dir(&hash);
        assert!(path.ends_with("2a/ae6c35c94fcfb415dbe95f408b9ce91ee846ed"));
    }

    #[test]
    fn test_ensure_shard_dir_creates_segments() {
        let temp_dir = TempDir::new().unwrap();
        let layout = ShardLayout::new(temp_dir.path());

        let hash = Hash::hash_bytes(Algorithm::Sha1, b"test");
        let dir = layout.ensure_shard_dir(&hash).unwrap();
        assert!(dir.is_dir());

        // Second call is a no-op
        assert_eq!(layout.ensure_shard_dir(&hash).unwrap(), dir);
    }

    #[test]
    fn test_ensure_shard_dir_rejects_file_segment() {
        let temp_dir = TempDir::new().unwrap();
        let layout = ShardLayout::new(temp_dir.path());

        let hash = Hash::hash_bytes(Algorithm::Sha1, b"test");
        fs::write(temp_dir.path().join(hash.prefix()), b"not a dir").unwrap();

        let err = layout.ensure_shard_dir(&hash).unwrap_err();
        assert!(matches!(err, Error::Filesystem { .. }));
    }

    #[test]
    #[cfg(unix)]
    fn test_ensure_shard_dir_rejects_read_only_segment() {
        use std::os::unix::fs::PermissionsExt;

        let temp_dir = TempDir::new().unwrap();
        let layout = ShardLayout::new(temp_dir.path());

        let hash = Hash::hash_bytes(Algorithm::Sha1, b"test");
        let prefix_dir = temp_dir.path().join(hash.prefix());
        fs::create_dir(&prefix_dir).unwrap();
        fs::set_permissions(&prefix_dir, fs::Permissions::from_mode(0o555)).unwrap();

        let err = layout.ensure_shard_dir(&hash).unwrap_err();
        assert!(matches!(err, Error::Filesystem { .. }));

        fs::set_permissions(&prefix_dir, fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[test]
    fn test_place_bytes_recreates_pruned_shard() {
        let temp_dir = TempDir::new().unwrap();
        let layout = ShardLayout::new(temp_dir.path());

        let hash = Hash::hash_bytes(Algorithm::Sha1, b"marker");
        let dir = layout.ensure_shard_dir(&hash).unwrap();

        // A collection pass prunes the fresh, still empty shard
        layout.prune(&hash);
        assert!(!dir.exists());

        layout.write_into_shard(&hash, &dir, EMPTY_DIR_MARKER, b"").unwrap();
        assert!(dir.join(EMPTY_DIR_MARKER).is_file());
    }

    #[test]
    fn test_place_staged_recreates_pruned_shard() {
        let temp_dir = TempDir::new().unwrap();
        let layout = ShardLayout::new(temp_dir.path());

        let mut staged = layout.stage().unwrap();
        staged.write_all(b"payload").unwrap();

        let hash = Hash::hash_bytes(Algorithm::Sha1, b"payload");
        let dir = layout.ensure_shard_dir(&hash).unwrap();
        layout.prune(&hash);
        assert!(!dir.exists());

        layout.move_into_shard(&hash, &dir, CONTENT_FILE, staged).unwrap();
        assert_eq!(fs::read(dir.join(CONTENT_FILE)).unwrap(), b"payload");
    }

    #[test]
    fn test_stage_inside_root() {
        let temp_dir = TempDir::new().unwrap();
        let layout = ShardLayout::new(temp_dir.path());

        let staged = layout.stage().unwrap();
        assert_eq!(staged.path().parent().unwrap(), temp_dir.path());

        let name = staged.path().file_name().unwrap().to_str().unwrap().to_string();
        assert!(name.starts_with(STAGING_PREFIX));

        // Dropping the staged file cleans it up
        let path = staged.path().to_path_buf();
        drop(staged);
        assert!(!path.exists());
    }

    #[test]
    fn test_move_into_place() {
        let temp_dir = TempDir::new().unwrap();
        let layout = ShardLayout::new(temp_dir.path());

        let mut staged = layout.stage().unwrap();
        staged.write_all(b"payload").unwrap();
        let staged_path = staged.path().to_path_buf();

        let hash = Hash::hash_bytes(Algorithm::Sha1, b"payload");
        let dest = layout.ensure_shard_dir(&hash).unwrap().join(CONTENT_FILE);
        move_into_place(staged, &dest).unwrap();

        assert_eq!(fs::read(&dest).unwrap(), b"payload");
        assert!(!staged_path.exists());
    }

    #[test]
    fn test_inventory_finds_stored_forms_only() {
        let temp_dir = TempDir::new().unwrap();
        let layout = ShardLayout::new(temp_dir.path());

        let leaf = Hash::hash_bytes(Algorithm::Sha1, b"leaf");
        let marker = Hash::hash_bytes(Algorithm::Sha1, b"marker");
        let bare = Hash::hash_bytes(Algorithm::Sha1, b"bare");

        write_atomic(&layout.ensure_shard_dir(&leaf).unwrap().join(CONTENT_FILE), b"x").unwrap();
        write_atomic(&layout.ensure_shard_dir(&marker).unwrap().join(EMPTY_DIR_MARKER), b"").unwrap();
        layout.ensure_shard_dir(&bare).unwrap();

        // Noise that must be ignored
        let _staged = layout.stage().unwrap();
        fs::create_dir(temp_dir.path().join("not-a-shard")).unwrap();

        let inventory = layout.inventory().unwrap();
        assert_eq!(inventory.len(), 2);
        assert!(inventory.contains(&leaf));
        assert!(inventory.contains(&marker));
    }

    #[test]
    fn test_prune_removes_empty_shard_dirs() {
        let temp_dir = TempDir::new().unwrap();
        let layout = ShardLayout::new(temp_dir.path());

        let hash = Hash::hash_bytes(Algorithm::Sha1, b"prune");
        let dir = layout.ensure_shard_dir(&hash).unwrap();
        layout.prune(&hash);

        assert!(!dir.exists());
        assert!(!temp_dir.path().join(hash.prefix()).exists());
    }
}
