//! Reference tracking.
//!
//! A [`ContentReference`] is one consumer's dependency on a hash. The
//! tracker keeps, per hash, the set of references depending on it. All
//! mutations go through one lock so that "the set became empty, delete the
//! content" cannot interleave with a concurrent addition for the same hash.
//!
//! Directories depend on their children through edges whose context is the
//! parent's hex hash.

use crate::hash::Hash;
use crate::item::{ContentItem, ContentKind};
use crate::layout::ShardLayout;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fmt;
use tracing::{debug, warn};

/// One logical consumer's dependency on a content hash.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ContentReference {
    context_path: String,
    hash: Hash,
}

impl ContentReference {
    /// Create a new reference.
    pub fn new(context_path: impl Into<String>, hash: Hash) -> Self {
        Self {
            context_path: context_path.into(),
            hash,
        }
    }

    /// Get the consumer's context path.
    pub fn context_path(&self) -> &str {
        &self.context_path
    }

    /// Get the referenced hash.
    pub fn hash(&self) -> Hash {
        self.hash
    }
}

impl fmt::Display for ContentReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.context_path, self.hash)
    }
}

/// Multimap from hash to the references depending on it.
#[derive(Debug, Default)]
pub(crate) struct ReferenceTable {
    refs: HashMap<Hash, HashSet<ContentReference>>,
}

impl ReferenceTable {
    /// Insert a reference. Returns true if it was not already present.
    pub(crate) fn insert(&mut self, reference: ContentReference) -> bool {
        self.refs.entry(reference.hash).or_default().insert(reference)
    }

    /// Remove a reference. Returns true if it was present and its hash is
    /// now unreferenced; the hash entry is dropped in that case.
    pub(crate) fn release(&mut self, reference: &ContentReference) -> bool {
        let Some(set) = self.refs.get_mut(&reference.hash) else {
            return false;
        };
        if !set.remove(reference) {
            return false;
        }
        if set.is_empty() {
            self.refs.remove(&reference.hash);
            return true;
        }
        false
    }

    /// Remove every reference whose context is `context`. Returns the
    /// hashes left unreferenced, sorted.
    pub(crate) fn release_context(&mut self, context: &str) -> Vec<Hash> {
        let mut orphaned = Vec::new();
        self.refs.retain(|hash, set| {
            let before = set.len();
            set.retain(|r| r.context_path != context);
            if set.is_empty() && before > 0 {
                orphaned.push(*hash);
                return false;
            }
            true
        });
        orphaned.sort();
        orphaned
    }

    pub(crate) fn contains(&self, hash: &Hash) -> bool {
        self.refs.contains_key(hash)
    }

    pub(crate) fn contains_reference(&self, reference: &ContentReference) -> bool {
        self.refs
            .get(&reference.hash)
            .is_some_and(|set| set.contains(reference))
    }

    fn references(&self, hash: &Hash) -> Vec<ContentReference> {
        let mut refs: Vec<_> = self
            .refs
            .get(hash)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        refs.sort();
        refs
    }
}

/// Tracks which hashes are depended upon and by whom.
#[derive(Debug)]
pub struct ReferenceTracker {
    layout: ShardLayout,
    table: Mutex<ReferenceTable>,
}

impl ReferenceTracker {
    pub(crate) fn new(layout: ShardLayout) -> Self {
        Self {
            layout,
            table: Mutex::new(ReferenceTable::default()),
        }
    }

    /// Add a reference. Returns true if it was not already tracked.
    ///
    /// When the hash was not tracked before and is a stored directory, the
    /// edges to its children are registered too, recursively, so content
    /// persisted by an earlier process stays alive below a tracked root.
    pub fn add_reference(&self, reference: ContentReference) -> bool {
        let mut table = self.table.lock();
        let hash = reference.hash;
        let newly_tracked = !table.contains(&hash);
        let inserted = table.insert(reference);

        if newly_tracked {
            self.register_edges(&mut table, hash);
        }
        if inserted {
            debug!(hash = %hash, "reference added");
        }
        inserted
    }

    fn register_edges(&self, table: &mut ReferenceTable, root: Hash) {
        let mut pending = vec![root];

        while let Some(hash) = pending.pop() {
            let item = ContentItem::new(self.layout.clone(), hash);
            if !matches!(item.kind(), Ok(ContentKind::Directory)) {
                continue;
            }
            let entries = match item.children() {
                Ok(entries) => entries,
                Err(e) => {
                    warn!(hash = %hash, error = %e, "cannot register child edges");
                    continue;
                }
            };

            let context = hash.to_hex();
            for entry in entries {
                let newly_tracked = !table.contains(&entry.hash);
                table.insert(ContentReference::new(context.clone(), entry.hash));
                if newly_tracked {
                    pending.push(entry.hash);
                }
            }
        }
    }

    /// Drop a reference.
    ///
    /// Returns the hashes physically removed, which is empty unless
    /// `remove_unreferenced` is set and this was the last reference.
    pub(crate) fn remove_reference(
        &self,
        reference: &ContentReference,
        remove_unreferenced: bool,
    ) -> Vec<Hash> {
        let mut table = self.table.lock();

        if !table.contains_reference(reference) {
            debug!(reference = %reference, "reference not tracked");
            return Vec::new();
        }
        if !table.release(reference) {
            debug!(reference = %reference, "reference removed, content still referenced");
            return Vec::new();
        }

        if !remove_unreferenced {
            debug!(hash = %reference.hash, "content unreferenced, eligible for collection");
            return Vec::new();
        }

        let item = ContentItem::new(self.layout.clone(), reference.hash);
        item.remove(&mut table, &reference.hash.to_hex())
    }

    /// Physically remove `hash` unless it is referenced, atomically with
    /// respect to reference additions.
    ///
    /// Returns None if the hash is referenced.
    pub(crate) fn remove_if_unreferenced(&self, hash: &Hash) -> Option<Vec<Hash>> {
        let mut table = self.table.lock();
        if table.contains(hash) {
            return None;
        }
        let item = ContentItem::new(self.layout.clone(), *hash);
        Some(item.remove(&mut table, &hash.to_hex()))
    }

    /// Whether any reference depends on `hash`.
    pub fn is_referenced(&self, hash: &Hash) -> bool {
        self.table.lock().contains(hash)
    }

    /// The references depending on `hash`, sorted.
    pub fn references(&self, hash: &Hash) -> Vec<ContentReference> {
        self.table.lock().references(hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::children::{self, ChildEntry};
    use crate::hash::Algorithm;
    use crate::layout::{CHILDREN_INDEX, CONTENT_FILE, write_atomic};
    use tempfile::TempDir;

    fn store_leaf(layout: &ShardLayout, data: &[u8]) -> Hash {
        let hash = Hash::hash_bytes(Algorithm::Sha1, data);
        let dir = layout.ensure_shard_dir(&hash).unwrap();
        write_atomic(&dir.join(CONTENT_FILE), data).unwrap();
        hash
    }

    fn store_dir(layout: &ShardLayout, entries: Vec<ChildEntry>) -> Hash {
        let bytes = children::canonical_bytes(entries.iter().map(|e| (e.name.as_str(), e.hash)));
        let hash = Hash::hash_bytes(Algorithm::Sha1, &bytes);
        let dir = layout.ensure_shard_dir(&hash).unwrap();
        write_atomic(&dir.join(CHILDREN_INDEX), children::encode_index(entries).as_bytes())
            .unwrap();
        hash
    }

    #[test]
    fn test_reference_equality_by_context_and_hash() {
        let hash = Hash::hash_bytes(Algorithm::Sha1, b"x");
        let other = Hash::hash_bytes(Algorithm::Sha1, b"y");
        assert_eq!(ContentReference::new("a", hash), ContentReference::new("a", hash));
        assert_ne!(ContentReference::new("a", hash), ContentReference::new("b", hash));
        assert_ne!(ContentReference::new("a", hash), ContentReference::new("a", other));
    }

    #[test]
    fn test_table_release() {
        let hash = Hash::hash_bytes(Algorithm::Sha1, b"x");
        let a = ContentReference::new("a", hash);
        let b = ContentReference::new("b", hash);

        let mut table = ReferenceTable::default();
        assert!(table.insert(a.clone()));
        assert!(!table.insert(a.clone()));
        assert!(table.insert(b.clone()));

        assert!(!table.release(&a));
        assert!(table.contains(&hash));
        assert!(!table.release(&a));
        assert!(table.release(&b));
        assert!(!table.contains(&hash));
    }

    #[test]
    fn test_table_release_context() {
        let x = Hash::hash_bytes(Algorithm::Sha1, b"x");
        let y = Hash::hash_bytes(Algorithm::Sha1, b"y");

        let mut table = ReferenceTable::default();
        table.insert(ContentReference::new("parent", x));
        table.insert(ContentReference::new("parent", y));
        table.insert(ContentReference::new("other", y));

        assert_eq!(table.release_context("parent"), vec![x]);
        assert!(!table.contains(&x));
        assert_eq!(table.references(&y), vec![ContentReference::new("other", y)]);
        assert!(table.release_context("parent").is_empty());
    }

    #[test]
    fn test_add_and_remove_reference() {
        let temp_dir = TempDir::new().unwrap();
        let layout = ShardLayout::new(temp_dir.path());
        let tracker = ReferenceTracker::new(layout.clone());

        let hash = store_leaf(&layout, b"data");
        let dep1 = ContentReference::new("dep1", hash);
        let dep2 = ContentReference::new("dep2", hash);

        assert!(tracker.add_reference(dep1.clone()));
        assert!(tracker.add_reference(dep2.clone()));
        assert_eq!(tracker.references(&hash), vec![dep1.clone(), dep2.clone()]);

        assert!(tracker.remove_reference(&dep1, true).is_empty());
        assert!(ContentItem::new(layout.clone(), hash).exists());

        assert_eq!(tracker.remove_reference(&dep2, true), vec![hash]);
        assert!(!ContentItem::new(layout, hash).exists());
        assert!(!tracker.is_referenced(&hash));
    }

    #[test]
    fn test_deferred_removal_keeps_content() {
        let temp_dir = TempDir::new().unwrap();
        let layout = ShardLayout::new(temp_dir.path());
        let tracker = ReferenceTracker::new(layout.clone());

        let hash = store_leaf(&layout, b"data");
        let dep = ContentReference::new("dep", hash);
        tracker.add_reference(dep.clone());

        assert!(tracker.remove_reference(&dep, false).is_empty());
        assert!(!tracker.is_referenced(&hash));
        assert!(ContentItem::new(layout, hash).exists());
    }

    #[test]
    fn test_remove_untracked_reference_is_noop() {
        let temp_dir = TempDir::new().unwrap();
        let layout = ShardLayout::new(temp_dir.path());
        let tracker = ReferenceTracker::new(layout.clone());

        let hash = store_leaf(&layout, b"data");
        assert!(tracker.remove_reference(&ContentReference::new("nobody", hash), true).is_empty());
        assert!(ContentItem::new(layout, hash).exists());
    }

    #[test]
    fn test_directory_reference_registers_child_edges() {
        let temp_dir = TempDir::new().unwrap();
        let layout = ShardLayout::new(temp_dir.path());
        let tracker = ReferenceTracker::new(layout.clone());

        let leaf = store_leaf(&layout, b"nested");
        let sub = store_dir(&layout, vec![ChildEntry::new("nested.txt", leaf).unwrap()]);
        let root = store_dir(&layout, vec![ChildEntry::new("sub", sub).unwrap()]);

        tracker.add_reference(ContentReference::new("deployment", root));

        assert_eq!(
            tracker.references(&sub),
            vec![ContentReference::new(root.to_hex(), sub)]
        );
        assert_eq!(
            tracker.references(&leaf),
            vec![ContentReference::new(sub.to_hex(), leaf)]
        );
    }

    #[test]
    fn test_remove_if_unreferenced() {
        let temp_dir = TempDir::new().unwrap();
        let layout = ShardLayout::new(temp_dir.path());
        let tracker = ReferenceTracker::new(layout.clone());

        let kept = store_leaf(&layout, b"kept");
        let orphan = store_leaf(&layout, b"orphan");
        tracker.add_reference(ContentReference::new("dep", kept));

        assert!(tracker.remove_if_unreferenced(&kept).is_none());
        assert_eq!(tracker.remove_if_unreferenced(&orphan), Some(vec![orphan]));
        assert!(ContentItem::new(layout, kept).exists());
    }
}
