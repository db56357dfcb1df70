//! The repository facade.

use crate::clock::{Clock, SystemClock};
use crate::config::RepositoryConfig;
use crate::error::{Error, Result};
use crate::hash::{Algorithm, Hash};
use crate::item::ContentItem;
use crate::layout::{STAGING_PREFIX, ShardLayout, remove_file_logged};
use crate::refs::{ContentReference, ReferenceTracker};
use crate::staged::UnpersistedItem;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// A content repository rooted at one directory.
///
/// All operations run on the caller's thread; the repository may be shared
/// between threads.
#[derive(Debug)]
pub struct Repository {
    pub(crate) config: RepositoryConfig,
    pub(crate) layout: ShardLayout,
    pub(crate) tracker: ReferenceTracker,
    /// Hash to the time it was first seen unreferenced. Held for a whole
    /// collection pass.
    pub(crate) obsolete: Mutex<HashMap<Hash, u64>>,
    pub(crate) clock: Arc<dyn Clock>,
}

impl Repository {
    /// Open the repository described by `config`, creating the root if
    /// needed.
    ///
    /// The root must be a writable directory or creatable. Staging files left
    /// behind by an earlier process are removed.
    pub fn open(config: RepositoryConfig) -> Result<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Like [`Repository::open`] with an explicit time source.
    pub fn with_clock(config: RepositoryConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let root = config.root.clone();

        if root.exists() && !root.is_dir() {
            return Err(Error::configuration(&root, "exists but is not a directory"));
        }
        fs::create_dir_all(&root)
            .map_err(|e| Error::configuration(&root, format!("cannot create root: {}", e)))?;

        sweep_staging(&root);

        // Probe writability with a real staging file
        tempfile::Builder::new()
            .prefix(STAGING_PREFIX)
            .tempfile_in(&root)
            .map_err(|e| Error::configuration(&root, format!("root is not writable: {}", e)))?;

        let layout = ShardLayout::new(root);
        info!(
            root = %layout.root().display(),
            algorithm = config.algorithm.as_str(),
            grace_period_ms = config.obsolescence_grace_period_ms,
            "repository opened"
        );

        Ok(Self {
            tracker: ReferenceTracker::new(layout.clone()),
            layout,
            config,
            obsolete: Mutex::new(HashMap::new()),
            clock,
        })
    }

    /// Get the repository root.
    pub fn root(&self) -> &Path {
        self.layout.root()
    }

    /// Get the hash algorithm.
    pub fn algorithm(&self) -> Algorithm {
        self.config.algorithm
    }

    pub fn config(&self) -> &RepositoryConfig {
        &self.config
    }

    pub(crate) fn item(&self, hash: Hash) -> ContentItem {
        ContentItem::new(self.layout.clone(), hash)
    }

    /// Store a byte stream and return its hash.
    ///
    /// Bytes are hashed while being staged; identical content is stored
    /// once. No reference is added.
    pub fn add_content<R: Read>(&self, reader: R) -> Result<Hash> {
        let mut staged = UnpersistedItem::stage_leaf(&self.layout, self.algorithm(), reader)?;
        let hash = staged.hash()?;
        staged.persist(&self.layout, &self.tracker, hash, &hash.to_hex())?;
        Ok(hash)
    }

    /// Record that `reference` depends on its hash. Returns true if the
    /// reference was new.
    pub fn add_content_reference(&self, reference: ContentReference) -> bool {
        self.tracker.add_reference(reference)
    }

    /// Drop `reference`.
    ///
    /// If it was the last reference to its hash, the content either becomes
    /// eligible for collection or, with `remove_unreferenced_immediately`, is
    /// removed right away together with children nothing else references.
    /// Returns the hashes physically removed.
    pub fn remove_content(&self, reference: &ContentReference) -> Vec<Hash> {
        self.tracker
            .remove_reference(reference, self.config.remove_unreferenced_immediately)
    }

    pub fn has_content(&self, hash: &Hash) -> bool {
        self.item(*hash).exists()
    }

    /// Get stored content, or NotFound.
    pub fn get_content(&self, hash: &Hash) -> Result<ContentItem> {
        let item = self.item(*hash);
        if !item.exists() {
            return Err(Error::not_found(hash.to_hex()));
        }
        Ok(item)
    }

    /// Explode the archive stored under `hash` and return the hash of the
    /// resulting directory.
    ///
    /// The caller must reference the result to keep it alive.
    pub fn explode_content(&self, hash: &Hash) -> Result<Hash> {
        let exploded = self.get_content(hash)?.explode(&self.tracker, self.algorithm())?;
        Ok(exploded.hash())
    }

    /// Materialize the directory stored under `hash` at `target`.
    pub fn copy_exploded_content(&self, hash: &Hash, target: &Path) -> Result<()> {
        let item = self.get_content(hash)?;
        if !item.kind()?.is_directory() {
            return Err(Error::not_a_directory(hash.to_hex()));
        }
        item.copy_to(target)?;
        debug!(hash = %hash, target = %target.display(), "exploded content copied");
        Ok(())
    }

    /// Check that stored content still hashes to `hash`.
    pub fn verify_content(&self, hash: &Hash) -> Result<()> {
        self.get_content(hash)?.verify(self.algorithm())
    }

    pub fn references(&self, hash: &Hash) -> Vec<ContentReference> {
        self.tracker.references(hash)
    }

    pub fn is_referenced(&self, hash: &Hash) -> bool {
        self.tracker.is_referenced(hash)
    }
}

/// Remove staging files directly under `root`.
fn sweep_staging(root: &Path) {
    let Ok(entries) = fs::read_dir(root) else {
        return;
    };
    for entry in entries.flatten() {
        let is_staging = entry
            .file_name()
            .to_str()
            .is_some_and(|name| name.starts_with(STAGING_PREFIX));
        if is_staging && entry.path().is_file() && remove_file_logged(&entry.path()) {
            debug!(path = %entry.path().display(), "stale staging file removed");
        }
    }
}
