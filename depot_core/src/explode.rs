//! Exploding archive leaves into directory trees.

use crate::error::{Error, Result};
use crate::hash::Algorithm;
use crate::item::{ContentItem, ContentKind};
use crate::refs::ReferenceTracker;
use crate::staged::UnpersistedItem;
use std::fs;
use tracing::{debug, info};
use zip::ZipArchive;

/// Split an archive entry name on `/` or `\\` into path segments, dropping
/// empty, `.` and `..` segments.
pub(crate) fn entry_segments(name: &str) -> Vec<&str> {
    name.split(['/', '\\'])
        .filter(|s| !s.is_empty() && *s != "." && *s != "..")
        .collect()
}

fn rejected_entry(hash: String, name: &str, err: Error) -> Error {
    match err {
        Error::InvalidEntry { reason } => {
            Error::exploded_content(hash, format!("entry {}: {}", name, reason))
        }
        other => other,
    }
}

impl ContentItem {
    /// Explode this leaf, which must be a zip archive, into a directory
    /// tree and persist it.
    ///
    /// Leaves are staged as entries are read, hashes are computed bottom-up
    /// and the tree is persisted with the root's hex hash as the context of
    /// its child edges. The source leaf is left untouched.
    pub fn explode(
        &self,
        tracker: &ReferenceTracker,
        algorithm: Algorithm,
    ) -> Result<ContentItem> {
        let hash = self.hash();
        if self.kind()? != ContentKind::Leaf {
            return Err(Error::exploded_content(hash.to_hex(), "content is already a directory"));
        }

        let file = fs::File::open(self.content_path())?;
        let mut archive = ZipArchive::new(file)
            .map_err(|e| Error::exploded_content(hash.to_hex(), format!("not a zip archive: {}", e)))?;

        let layout = self.layout();
        let mut root = UnpersistedItem::directory();

        for i in 0..archive.len() {
            let mut entry = archive.by_index(i).map_err(|e| {
                Error::exploded_content(hash.to_hex(), format!("unreadable entry {}: {}", i, e))
            })?;
            let name = entry.name().to_string();
            let segments = entry_segments(&name);

            if entry.is_dir() || name.ends_with('\\') {
                root.directory_at(&segments)
                    .map_err(|e| rejected_entry(hash.to_hex(), &name, e))?;
                continue;
            }

            let Some((file_name, parent)) = segments.split_last() else {
                debug!(entry = %name, "skipping entry without a usable name");
                continue;
            };
            let leaf = UnpersistedItem::stage_leaf(layout, algorithm, &mut entry)?;
            root.insert(parent, file_name, leaf)
                .map_err(|e| rejected_entry(hash.to_hex(), &name, e))?;
        }

        let exploded = root.compute_hash(algorithm)?;
        let item = root.persist(layout, tracker, exploded, &exploded.to_hex())?;

        info!(source = %hash, exploded = %exploded, entries = archive.len(), "content exploded");
        Ok(item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::Hash;
    use crate::layout::{CONTENT_FILE, ShardLayout, write_atomic};
    use std::io::{Cursor, Write};
    use tempfile::TempDir;
    use zip::ZipWriter;
    use zip::write::SimpleFileOptions;

    fn build_zip(files: &[(&str, &[u8])], dirs: &[&str]) -> Vec<u8> {
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        let options = SimpleFileOptions::default();
        for dir in dirs {
            writer.add_directory(*dir, options).unwrap();
        }
        for (name, data) in files {
            writer.start_file(*name, options).unwrap();
            writer.write_all(data).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    fn store_leaf(layout: &ShardLayout, data: &[u8]) -> ContentItem {
        let hash = Hash::hash_bytes(Algorithm::Sha1, data);
        let dir = layout.ensure_shard_dir(&hash).unwrap();
        write_atomic(&dir.join(CONTENT_FILE), data).unwrap();
        ContentItem::new(layout.clone(), hash)
    }

    #[test]
    fn test_entry_segments() {
        assert_eq!(entry_segments("a.txt"), vec!["a.txt"]);
        assert_eq!(entry_segments("dir/"), vec!["dir"]);
        assert_eq!(entry_segments("./dir//b.txt"), vec!["dir", "b.txt"]);
        assert_eq!(entry_segments("../x/../y"), vec!["x", "y"]);
        assert!(entry_segments("/").is_empty());
        assert_eq!(entry_segments("WEB-INF\\web.xml"), vec!["WEB-INF", "web.xml"]);
        assert_eq!(entry_segments(".\\lib/a.jar"), vec!["lib", "a.jar"]);
    }

    #[test]
    fn test_explode_zip() {
        let temp_dir = TempDir::new().unwrap();
        let layout = ShardLayout::new(temp_dir.path());
        let tracker = ReferenceTracker::new(layout.clone());

        let archive = build_zip(&[("a.txt", b"alpha"), ("dir/b.txt", b"beta")], &["dir/", "empty/"]);
        let source = store_leaf(&layout, &archive);

        let exploded = source.explode(&tracker, Algorithm::Sha1).unwrap();
        assert_eq!(exploded.kind().unwrap(), ContentKind::Directory);
        exploded.verify(Algorithm::Sha1).unwrap();

        let names: Vec<_> = exploded.children().unwrap().into_iter().map(|e| e.name).collect();
        assert_eq!(names, vec!["a.txt", "dir", "empty"]);

        // Source is untouched
        assert_eq!(fs::read(source.content_path()).unwrap(), archive);
    }

    #[test]
    fn test_explode_is_deterministic() {
        let temp_dir = TempDir::new().unwrap();
        let layout = ShardLayout::new(temp_dir.path());
        let tracker = ReferenceTracker::new(layout.clone());

        // Same tree, different entry order and explicit directory entries
        let first = store_leaf(&layout, &build_zip(&[("a", b"1"), ("d/b", b"2")], &[]));
        let second = store_leaf(&layout, &build_zip(&[("d/b", b"2"), ("a", b"1")], &["d/"]));
        assert_ne!(first.hash(), second.hash());

        let first = first.explode(&tracker, Algorithm::Sha1).unwrap();
        let second = second.explode(&tracker, Algorithm::Sha1).unwrap();
        assert_eq!(first.hash(), second.hash());
    }

    #[test]
    fn test_explode_non_archive_fails() {
        let temp_dir = TempDir::new().unwrap();
        let layout = ShardLayout::new(temp_dir.path());
        let tracker = ReferenceTracker::new(layout.clone());

        let source = store_leaf(&layout, b"definitely not a zip file");
        let err = source.explode(&tracker, Algorithm::Sha1).unwrap_err();
        assert!(matches!(err, Error::ExplodedContent { .. }));
        assert_eq!(fs::read(source.content_path()).unwrap(), b"definitely not a zip file");
    }

    #[test]
    fn test_explode_skips_dot_segments() {
        let temp_dir = TempDir::new().unwrap();
        let layout = ShardLayout::new(temp_dir.path());
        let tracker = ReferenceTracker::new(layout.clone());

        let source = store_leaf(&layout, &build_zip(&[("./a/../b.txt", b"b")], &[]));
        let exploded = source.explode(&tracker, Algorithm::Sha1).unwrap();

        let children = exploded.children().unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].name, "a");
        let inner = ContentItem::new(layout, children[0].hash).children().unwrap();
        assert_eq!(inner[0].name, "b.txt");
    }

    #[test]
    fn test_explode_backslash_separators() {
        let temp_dir = TempDir::new().unwrap();
        let layout = ShardLayout::new(temp_dir.path());
        let tracker = ReferenceTracker::new(layout.clone());

        let windows = store_leaf(&layout, &build_zip(&[("WEB-INF\\web.xml", b"<web-app/>")], &[]));
        let unix = store_leaf(&layout, &build_zip(&[("WEB-INF/web.xml", b"<web-app/>")], &[]));

        let windows = windows.explode(&tracker, Algorithm::Sha1).unwrap();
        let unix = unix.explode(&tracker, Algorithm::Sha1).unwrap();
        assert_eq!(windows.hash(), unix.hash());

        let children = windows.children().unwrap();
        assert_eq!(children[0].name, "WEB-INF");
        let inner = ContentItem::new(layout, children[0].hash).children().unwrap();
        assert_eq!(inner[0].name, "web.xml");
    }

    #[test]
    fn test_explode_later_duplicate_wins() {
        let temp_dir = TempDir::new().unwrap();
        let layout = ShardLayout::new(temp_dir.path());
        let tracker = ReferenceTracker::new(layout.clone());

        let source = store_leaf(&layout, &build_zip(&[("a.txt", b"first"), ("./a.txt", b"second")], &[]));
        let exploded = source.explode(&tracker, Algorithm::Sha1).unwrap();

        let children = exploded.children().unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].name, "a.txt");
        assert_eq!(children[0].hash, Hash::hash_bytes(Algorithm::Sha1, b"second"));
    }

    #[test]
    fn test_explode_file_and_directory_conflict() {
        let temp_dir = TempDir::new().unwrap();
        let layout = ShardLayout::new(temp_dir.path());
        let tracker = ReferenceTracker::new(layout.clone());

        let source = store_leaf(&layout, &build_zip(&[("a", b"file"), ("a/b", b"nested")], &[]));
        let err = source.explode(&tracker, Algorithm::Sha1).unwrap_err();
        assert!(matches!(err, Error::ExplodedContent { .. }));
    }
}
