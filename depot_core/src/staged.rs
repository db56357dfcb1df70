//! Content that is not yet stored under its hash.
//!
//! An [`UnpersistedItem`] is either a leaf whose bytes sit in a staging file
//! under the repository root, or a directory of named unpersisted children.
//! It is owned by the operation building it and either becomes stored
//! content through [`UnpersistedItem::persist`] or is dropped, which deletes
//! any staging files it still holds.

use crate::children::{self, ChildEntry, validate_name};
use crate::error::{Error, Result};
use crate::hash::{Algorithm, Hash, HashingWriter};
use crate::item::ContentItem;
use crate::layout::{CHILDREN_INDEX, CONTENT_FILE, EMPTY_DIR_MARKER, ShardLayout};
use crate::refs::{ContentReference, ReferenceTracker};
use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::io::{self, Cursor, Read, Write};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

/// Deepest directory nesting accepted when building a tree.
pub const MAX_TREE_DEPTH: usize = 256;

#[derive(Debug)]
enum Node {
    /// Staged bytes; taken on persist.
    Leaf(Option<NamedTempFile>),
    Directory(BTreeMap<String, UnpersistedItem>),
}

/// A leaf or directory that has not been persisted yet.
#[derive(Debug)]
pub struct UnpersistedItem {
    node: Node,
    hash: Option<Hash>,
    persisted: bool,
}

impl UnpersistedItem {
    /// Stream `reader` into a staging file, hashing on the way.
    pub fn stage_leaf<R: Read>(layout: &ShardLayout, algorithm: Algorithm, mut reader: R) -> Result<Self> {
        let staged = layout.stage()?;
        let mut writer = HashingWriter::new(staged, algorithm);
        io::copy(&mut reader, &mut writer)?;
        writer.flush()?;

        let size = writer.written();
        let (staged, hash) = writer.finish();
        debug!(hash = %hash, size, "leaf staged");

        Ok(Self {
            node: Node::Leaf(Some(staged)),
            hash: Some(hash),
            persisted: false,
        })
    }

    /// A new directory without children.
    pub fn directory() -> Self {
        Self {
            node: Node::Directory(BTreeMap::new()),
            hash: None,
            persisted: false,
        }
    }

    /// Whether this item is a directory.
    pub fn is_directory(&self) -> bool {
        matches!(self.node, Node::Directory(_))
    }

    /// The hash, once known.
    pub fn hash(&self) -> Result<Hash> {
        self.hash
            .ok_or_else(|| Error::invalid_state("hash requested before it was computed"))
    }

    /// Get the directory at `path` below this one, creating missing levels.
    ///
    /// Fails if a segment names an existing leaf or the path is too deep.
    pub fn directory_at(&mut self, path: &[&str]) -> Result<&mut UnpersistedItem> {
        if path.len() >= MAX_TREE_DEPTH {
            return Err(Error::invalid_entry(format!(
                "directory nesting exceeds {} levels",
                MAX_TREE_DEPTH
            )));
        }

        let mut current = self;
        for segment in path {
            validate_name(segment)?;
            let nodes = current.children_mut()?;
            let child = nodes
                .entry((*segment).to_string())
                .or_insert_with(UnpersistedItem::directory);
            if !child.is_directory() {
                return Err(Error::invalid_entry(format!(
                    "{} is both a file and a directory",
                    segment
                )));
            }
            current = child;
        }
        Ok(current)
    }

    /// Insert `item` as the child `name` of the directory at `parent`.
    ///
    /// A leaf already stored under `name` is replaced; a directory is not.
    pub fn insert(&mut self, parent: &[&str], name: &str, item: UnpersistedItem) -> Result<()> {
        validate_name(name)?;
        let dir = self.directory_at(parent)?;
        match dir.children_mut()?.entry(name.to_string()) {
            Entry::Vacant(slot) => {
                slot.insert(item);
            }
            Entry::Occupied(mut slot) => {
                if slot.get().is_directory() {
                    return Err(Error::invalid_entry(format!(
                        "{} is both a file and a directory",
                        name
                    )));
                }
                debug!(name, "replacing earlier entry");
                slot.insert(item);
            }
        }
        Ok(())
    }

    fn children_mut(&mut self) -> Result<&mut BTreeMap<String, UnpersistedItem>> {
        self.hash = None;
        match &mut self.node {
            Node::Directory(nodes) => Ok(nodes),
            Node::Leaf(_) => Err(Error::invalid_state("a leaf has no children")),
        }
    }

    /// Compute hashes bottom-up and return this item's hash.
    ///
    /// Each child is hashed to completion before its parent's canonical
    /// bytes are assembled.
    pub fn compute_hash(&mut self, algorithm: Algorithm) -> Result<Hash> {
        if let Some(hash) = self.hash {
            return Ok(hash);
        }
        if let Node::Directory(nodes) = &mut self.node {
            for child in nodes.values_mut() {
                child.compute_hash(algorithm)?;
            }
        }
        let hash = Hash::hash_reader(algorithm, self.input_stream()?)?;
        self.hash = Some(hash);
        Ok(hash)
    }

    /// The byte stream that is hashed for this item.
    ///
    /// A leaf rereads its staging file. A directory yields canonical bytes
    /// built from its children's hashes, which must already be known.
    pub fn input_stream(&self) -> Result<Box<dyn Read + Send>> {
        match &self.node {
            Node::Leaf(Some(staged)) => Ok(Box::new(staged.reopen()?)),
            Node::Leaf(None) => Err(Error::invalid_state("staged bytes already persisted")),
            Node::Directory(nodes) => {
                let mut entries = Vec::with_capacity(nodes.len());
                for (name, child) in nodes {
                    entries.push((name.as_str(), child.hash()?));
                }
                Ok(Box::new(Cursor::new(children::canonical_bytes(entries))))
            }
        }
    }

    /// Store this item under `hash`.
    ///
    /// If content with that hash is already stored, the staged data is
    /// discarded without rewriting. Non-empty directories persist their
    /// children first and then register one `(context, child)` reference
    /// per child. Fails if called twice.
    pub fn persist(
        &mut self,
        layout: &ShardLayout,
        tracker: &ReferenceTracker,
        hash: Hash,
        context: &str,
    ) -> Result<ContentItem> {
        if self.persisted {
            return Err(Error::invalid_state(format!("{} was already persisted", hash)));
        }
        if let Some(known) = self.hash
            && known != hash
        {
            return Err(Error::invalid_state(format!(
                "persist called with {} but content hashes to {}",
                hash, known
            )));
        }
        self.persisted = true;
        self.hash = Some(hash);

        let item = ContentItem::new(layout.clone(), hash);
        match &mut self.node {
            Node::Leaf(staged) => {
                let staged = staged
                    .take()
                    .ok_or_else(|| Error::invalid_state("staged bytes already consumed"))?;
                if item.exists() {
                    debug!(hash = %hash, "content already stored, discarding staged bytes");
                    discard(staged);
                } else {
                    layout.place_staged(&hash, CONTENT_FILE, staged)?;
                    info!(hash = %hash, "leaf persisted");
                }
            }
            Node::Directory(nodes) if nodes.is_empty() => {
                if !item.exists() {
                    layout.place_bytes(&hash, EMPTY_DIR_MARKER, b"")?;
                    info!(hash = %hash, "empty directory persisted");
                }
            }
            Node::Directory(nodes) => {
                let mut entries = Vec::with_capacity(nodes.len());
                for (name, child) in nodes.iter_mut() {
                    let child_hash = child.hash()?;
                    child.persist(layout, tracker, child_hash, &child_hash.to_hex())?;
                    entries.push(ChildEntry::new(name.clone(), child_hash)?);
                }

                if item.exists() {
                    debug!(hash = %hash, "directory already stored");
                } else {
                    let index = children::encode_index(entries.clone());
                    layout.place_bytes(&hash, CHILDREN_INDEX, index.as_bytes())?;
                    info!(hash = %hash, children = entries.len(), "directory persisted");
                }

                for entry in entries {
                    tracker.add_reference(ContentReference::new(context, entry.hash));
                }
            }
        }

        Ok(item)
    }
}

fn discard(staged: NamedTempFile) {
    if let Err(e) = staged.close() {
        warn!(error = %e, "failed to delete staging file");
    }
}
