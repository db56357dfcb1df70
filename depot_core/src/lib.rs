//! # Depot Core
//!
//! A content-addressed repository for deployment content.
//!
//! Artifacts are stored once under the hash of their bytes. Archives can be
//! exploded into directory trees whose hashes are computed from their
//! children, so identical files are shared between deployments. Consumers
//! register references on the content they depend on; unreferenced content
//! is reclaimed by a collector after a grace period.
//!
//! ## On-disk layout
//!
//! ```text
//! <root>/<hash[0:2]>/<hash[2:]>/content      leaf blob
//! <root>/<hash[0:2]>/<hash[2:]>/empty-dir    empty directory marker
//! <root>/<hash[0:2]>/<hash[2:]>/children     name=<hex hash> per child
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use depot_core::{ContentReference, Repository, RepositoryConfig};
//! use std::fs::File;
//! use std::path::Path;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let repo = Repository::open(RepositoryConfig::new("./depot-content"))?;
//!
//! // Store an archive and explode it into a tree
//! let archive = repo.add_content(File::open("app.war")?)?;
//! let exploded = repo.explode_content(&archive)?;
//!
//! // Keep the tree alive on behalf of a deployment
//! repo.add_content_reference(ContentReference::new("deployment=app.war", exploded));
//!
//! // Materialize it
//! repo.copy_exploded_content(&exploded, Path::new("./deployments/app"))?;
//!
//! // Run periodically; unreferenced content is deleted after the grace period
//! let report = repo.clean_obsolete_content()?;
//! println!("marked {}, deleted {}", report.marked.len(), report.deleted.len());
//! # Ok(())
//! # }
//! ```

mod children;
mod clock;
mod config;
mod error;
mod explode;
mod gc;
mod hash;
mod item;
mod layout;
mod refs;
mod repository;
mod staged;
mod walk;

pub use children::{ChildEntry, DIRECTORY_HEADER, MAX_NAME_LEN};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{DEFAULT_GRACE_PERIOD_MS, DEFAULT_ROOT, RepositoryConfig};
pub use error::{Error, Result};
pub use gc::GcReport;
pub use hash::{Algorithm, ContentHasher, HASH_SIZE, Hash, HashingWriter};
pub use item::{ContentItem, ContentKind};
pub use layout::{CHILDREN_INDEX, CONTENT_FILE, EMPTY_DIR_MARKER, STAGING_PREFIX, ShardLayout};
pub use refs::{ContentReference, ReferenceTracker};
pub use repository::Repository;
pub use staged::{MAX_TREE_DEPTH, UnpersistedItem};
