//! Children index encoding and the canonical directory form.
//!
//! The index file is UTF-8 text with one `name=<hex hash>` line per child,
//! sorted by name. The canonical bytes of a directory, which is what gets
//! hashed, are:
//!
//! ```text
//! "directory\0"
//! repeat per child, bytewise name order:
//!     name bytes, 0x00, 20 raw hash bytes
//! ```

use crate::error::{Error, Result};
use crate::hash::Hash;
use serde::Serialize;

/// Header that separates directory hashes from leaf hashes.
pub const DIRECTORY_HEADER: &[u8] = b"directory\0";

/// Maximum child name length in bytes.
pub const MAX_NAME_LEN: usize = 255;

/// A named child of a directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChildEntry {
    /// Name of the entry within its parent.
    pub name: String,
    /// Hash of the child content.
    pub hash: Hash,
}

impl ChildEntry {
    /// Create a new child entry, validating the name.
    pub fn new(name: impl Into<String>, hash: Hash) -> Result<Self> {
        let name = name.into();
        validate_name(&name)?;
        Ok(Self { name, hash })
    }
}

impl PartialOrd for ChildEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ChildEntry {
    /// Compare by name (bytewise UTF-8) for canonical ordering.
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.name.as_bytes().cmp(other.name.as_bytes())
    }
}

/// Check that a name can be used as a directory entry.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::invalid_entry("Name cannot be empty"));
    }

    if name.len() > MAX_NAME_LEN {
        return Err(Error::invalid_entry(format!(
            "Name too long: {} bytes (max {})",
            name.len(),
            MAX_NAME_LEN
        )));
    }

    if name == "." || name == ".." {
        return Err(Error::invalid_entry(format!("Reserved name: {}", name)));
    }

    if name.contains(['/', '\\', '\0', '\n', '\r']) {
        return Err(Error::invalid_entry(format!(
            "Name contains a separator or control character: {:?}",
            name
        )));
    }

    Ok(())
}

/// Encode entries as the children index text (sorted by name).
pub fn encode_index(mut entries: Vec<ChildEntry>) -> String {
    entries.sort();

    let mut out = String::new();
    for entry in entries {
        out.push_str(&entry.name);
        out.push('=');
        out.push_str(&entry.hash.to_hex());
        out.push('\n');
    }
    out
}

/// Decode a children index; the result is sorted by name.
pub fn decode_index(text: &str) -> Result<Vec<ChildEntry>> {
    let mut entries = Vec::new();

    for line in text.lines() {
        if line.is_empty() {
            continue;
        }

        let (name, hex) = line
            .rsplit_once('=')
            .ok_or_else(|| Error::invalid_entry(format!("Malformed index line: {:?}", line)))?;
        entries.push(ChildEntry::new(name, Hash::from_hex(hex)?)?);
    }

    entries.sort();
    for pair in entries.windows(2) {
        if pair[0].name == pair[1].name {
            return Err(Error::invalid_entry(format!(
                "Duplicate entry in index: {}",
                pair[0].name
            )));
        }
    }

    Ok(entries)
}

/// Canonical bytes of a directory with the given children.
///
/// Input order does not matter.
pub fn canonical_bytes<'a, I>(entries: I) -> Vec<u8>
where
    I: IntoIterator<Item = (&'a str, Hash)>,
{
    let mut sorted: Vec<(&str, Hash)> = entries.into_iter().collect();
    sorted.sort_by(|a, b| a.0.as_bytes().cmp(b.0.as_bytes()));

    let mut buf = Vec::with_capacity(DIRECTORY_HEADER.len() + sorted.len() * 48);
    buf.extend_from_slice(DIRECTORY_HEADER);
    for (name, hash) in sorted {
        buf.extend_from_slice(name.as_bytes());
        buf.push(0);
        buf.extend_from_slice(hash.as_bytes());
    }
    buf
}
