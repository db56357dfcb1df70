//! Persisted content items.

use crate::children::{self, ChildEntry};
use crate::error::{Error, Result};
use crate::hash::{Algorithm, Hash};
use crate::layout::{
    CHILDREN_INDEX, CONTENT_FILE, EMPTY_DIR_MARKER, ShardLayout, remove_file_logged,
};
use crate::refs::{ContentReference, ReferenceTable};
use serde::Serialize;
use std::fs;
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// The stored form of a content item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentKind {
    /// Raw bytes in a `content` file.
    Leaf,
    /// Directory without children, stored as an `empty-dir` marker.
    EmptyDirectory,
    /// Directory with a `children` index.
    Directory,
}

impl ContentKind {
    /// Get the string name of this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentKind::Leaf => "leaf",
            ContentKind::EmptyDirectory => "empty_directory",
            ContentKind::Directory => "directory",
        }
    }

    /// Whether this kind is one of the directory forms.
    pub fn is_directory(&self) -> bool {
        !matches!(self, ContentKind::Leaf)
    }
}

/// Handle to content stored under its hash.
///
/// The handle itself is cheap; every accessor goes to disk.
#[derive(Debug, Clone)]
pub struct ContentItem {
    layout: ShardLayout,
    hash: Hash,
}

impl ContentItem {
    pub(crate) fn new(layout: ShardLayout, hash: Hash) -> Self {
        Self { layout, hash }
    }

    pub(crate) fn layout(&self) -> &ShardLayout {
        &self.layout
    }

    /// Get the hash of this item.
    pub fn hash(&self) -> Hash {
        self.hash
    }

    /// Get the shard directory of this item.
    pub fn shard_dir(&self) -> PathBuf {
        self.layout.shard_dir(&self.hash)
    }

    /// Whether any stored form is present.
    pub fn exists(&self) -> bool {
        self.stored_kind().is_some()
    }

    /// Get the stored form, or NotFound.
    pub fn kind(&self) -> Result<ContentKind> {
        self.stored_kind()
            .ok_or_else(|| Error::not_found(self.hash.to_hex()))
    }

    fn stored_kind(&self) -> Option<ContentKind> {
        let dir = self.shard_dir();
        if dir.join(CONTENT_FILE).is_file() {
            Some(ContentKind::Leaf)
        } else if dir.join(CHILDREN_INDEX).is_file() {
            Some(ContentKind::Directory)
        } else if dir.join(EMPTY_DIR_MARKER).is_file() {
            Some(ContentKind::EmptyDirectory)
        } else {
            None
        }
    }

    /// Path of the leaf blob.
    pub fn content_path(&self) -> PathBuf {
        self.shard_dir().join(CONTENT_FILE)
    }

    /// Size of the leaf blob in bytes.
    pub fn size(&self) -> Result<u64> {
        match self.kind()? {
            ContentKind::Leaf => Ok(fs::metadata(self.content_path())?.len()),
            _ => Err(Error::invalid_state(format!(
                "{} is a directory and has no byte length",
                self.hash
            ))),
        }
    }

    /// Children of a directory, sorted by name. Empty for an empty directory.
    pub fn children(&self) -> Result<Vec<ChildEntry>> {
        match self.kind()? {
            ContentKind::Leaf => Err(Error::not_a_directory(self.hash.to_hex())),
            ContentKind::EmptyDirectory => Ok(Vec::new()),
            ContentKind::Directory => {
                let text = fs::read_to_string(self.shard_dir().join(CHILDREN_INDEX))?;
                children::decode_index(&text).map_err(|e| {
                    Error::corrupted_content(self.hash.to_hex(), format!("bad children index: {}", e))
                })
            }
        }
    }

    /// Open the byte stream of this item.
    ///
    /// A leaf yields its raw bytes. A directory yields its canonical form,
    /// the same bytes that were hashed when it was persisted.
    pub fn open(&self) -> Result<Box<dyn Read + Send>> {
        match self.kind()? {
            ContentKind::Leaf => Ok(Box::new(fs::File::open(self.content_path())?)),
            _ => {
                let entries = self.children()?;
                let bytes = children::canonical_bytes(entries.iter().map(|e| (e.name.as_str(), e.hash)));
                Ok(Box::new(Cursor::new(bytes)))
            }
        }
    }

    /// Recompute the hash from stored bytes and compare.
    pub fn verify(&self, algorithm: Algorithm) -> Result<()> {
        let computed = Hash::hash_reader(algorithm, self.open()?)?;
        if computed != self.hash {
            return Err(Error::corrupted_content(
                self.hash.to_hex(),
                format!("hash mismatch: stored bytes hash to {}", computed),
            ));
        }
        Ok(())
    }

    /// Materialize this item at `target` on an ordinary filesystem.
    ///
    /// A leaf becomes a byte-for-byte copy; a directory is created with its
    /// children below it. Existing files at the same paths are overwritten.
    pub fn copy_to(&self, target: &Path) -> Result<()> {
        let mut stack = vec![(self.hash, target.to_path_buf())];

        while let Some((hash, dest)) = stack.pop() {
            let item = ContentItem::new(self.layout.clone(), hash);
            match item.kind()? {
                ContentKind::Leaf => {
                    if let Some(parent) = dest.parent() {
                        fs::create_dir_all(parent)?;
                    }
                    fs::copy(item.content_path(), &dest)?;
                }
                ContentKind::EmptyDirectory => fs::create_dir_all(&dest)?,
                ContentKind::Directory => {
                    fs::create_dir_all(&dest)?;
                    for entry in item.children()? {
                        stack.push((entry.hash, dest.join(&entry.name)));
                    }
                }
            }
        }

        debug!(hash = %self.hash, target = %target.display(), "content copied");
        Ok(())
    }

    /// Physically remove this item on behalf of `context`.
    ///
    /// Directories first release the `(context, child)` edge of each child;
    /// children whose reference set becomes empty are removed as well, using
    /// their own hex hash as context. Files of children go before the
    /// parent's index. If the index is unreadable, every edge whose context
    /// is `context` is released instead. Returns every hash that was removed.
    pub(crate) fn remove(&self, table: &mut ReferenceTable, context: &str) -> Vec<Hash> {
        let mut pending = vec![(self.hash, context.to_string())];
        let mut order = Vec::new();

        while let Some((hash, ctx)) = pending.pop() {
            let item = ContentItem::new(self.layout.clone(), hash);
            if item.kind().map(|k| k == ContentKind::Directory).unwrap_or(false) {
                match item.children() {
                    Ok(entries) => {
                        for entry in entries {
                            let edge = ContentReference::new(ctx.clone(), entry.hash);
                            if table.release(&edge) {
                                pending.push((entry.hash, entry.hash.to_hex()));
                            }
                        }
                    }
                    Err(e) => {
                        warn!(hash = %hash, error = %e, "cannot read children while removing, releasing edges by context");
                        for orphan in table.release_context(&ctx) {
                            pending.push((orphan, orphan.to_hex()));
                        }
                    }
                }
            }
            order.push(item);
        }

        let mut removed = Vec::new();
        for item in order.into_iter().rev() {
            if item.delete_files() {
                removed.push(item.hash);
            }
        }

        info!(hash = %self.hash, context, removed = removed.len(), "content removed");
        removed
    }

    /// Delete whatever stored form is present and prune the shard.
    fn delete_files(&self) -> bool {
        let dir = self.shard_dir();
        let mut deleted = false;
        for name in [CONTENT_FILE, CHILDREN_INDEX, EMPTY_DIR_MARKER] {
            deleted |= remove_file_logged(&dir.join(name));
        }
        self.layout.prune(&self.hash);
        deleted
    }
}
