//! Content hashing.
//!
//! Every repository hashes with exactly one [`Algorithm`]. Both algorithms
//! produce a 20-byte digest, so hex keys and shard paths have the same shape
//! regardless of the algorithm in use.

use crate::error::{Error, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha1::Digest;
use std::fmt;
use std::io::{self, Read, Write};
use std::str::FromStr;

/// Hash digest size in bytes.
pub const HASH_SIZE: usize = 20;

/// Supported hash algorithms.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Algorithm {
    /// SHA-1, the layout-compatible default.
    #[default]
    #[serde(rename = "sha1")]
    Sha1,
    /// BLAKE3 extendable output truncated to 160 bits.
    #[serde(rename = "blake3-160")]
    Blake3,
}

impl Algorithm {
    /// Returns the string representation of the algorithm (for config files).
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::Sha1 => "sha1",
            Algorithm::Blake3 => "blake3-160",
        }
    }

    /// Parse algorithm from string.
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "sha1" => Ok(Algorithm::Sha1),
            "blake3-160" | "blake3" => Ok(Algorithm::Blake3),
            _ => Err(Error::unsupported_algorithm(s)),
        }
    }
}

/// A 20-byte content hash.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Hash([u8; HASH_SIZE]);

impl Hash {
    /// Create a Hash from raw bytes.
    pub fn from_bytes(bytes: [u8; HASH_SIZE]) -> Self {
        Hash(bytes)
    }

    /// Create a Hash from a hex string (40 hex characters, either case).
    pub fn from_hex(hex_str: &str) -> Result<Self> {
        if hex_str.len() != HASH_SIZE * 2 {
            return Err(Error::invalid_hash(format!(
                "Expected {} hex characters, got {}",
                HASH_SIZE * 2,
                hex_str.len()
            )));
        }

        let mut hash = [0u8; HASH_SIZE];
        hex::decode_to_slice(hex_str, &mut hash)
            .map_err(|e| Error::invalid_hash(format!("Invalid hex: {}", e)))?;
        Ok(Hash(hash))
    }

    /// Convert to lower-case hex string (40 characters).
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Get the first 2 hex characters (the shard prefix directory).
    pub fn prefix(&self) -> String {
        hex::encode(&self.0[..1])
    }

    /// Get the remaining 38 hex characters (the shard suffix directory).
    pub fn suffix(&self) -> String {
        hex::encode(&self.0[1..])
    }

    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8; HASH_SIZE] {
        &self.0
    }

    /// Hash raw bytes.
    pub fn hash_bytes(algorithm: Algorithm, data: &[u8]) -> Self {
        let mut hasher = ContentHasher::new(algorithm);
        hasher.update(data);
        hasher.finalize()
    }

    /// Hash data from a reader without buffering it whole.
    pub fn hash_reader<R: Read>(algorithm: Algorithm, mut reader: R) -> Result<Self> {
        let mut hasher = ContentHasher::new(algorithm);
        io::copy(&mut reader, &mut hasher)?;
        Ok(hasher.finalize())
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", self.to_hex())
    }
}

impl FromStr for Hash {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Hash::from_hex(s)
    }
}

impl Serialize for Hash {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Hash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Hash::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

enum Digester {
    Sha1(sha1::Sha1),
    Blake3(Box<blake3::Hasher>),
}

/// Streaming digest producer.
///
/// Implements [`Write`] so it can sit at the end of `io::copy` or be wrapped
/// by [`HashingWriter`] to hash bytes while they are being staged.
pub struct ContentHasher {
    digester: Digester,
}

impl ContentHasher {
    /// Start a new digest.
    pub fn new(algorithm: Algorithm) -> Self {
        let digester = match algorithm {
            Algorithm::Sha1 => Digester::Sha1(sha1::Sha1::new()),
            Algorithm::Blake3 => Digester::Blake3(Box::new(blake3::Hasher::new())),
        };
        Self { digester }
    }

    /// Feed bytes into the digest.
    pub fn update(&mut self, data: &[u8]) {
        match &mut self.digester {
            Digester::Sha1(h) => h.update(data),
            Digester::Blake3(h) => {
                h.update(data);
            }
        }
    }

    /// Finish the digest.
    pub fn finalize(self) -> Hash {
        let mut out = [0u8; HASH_SIZE];
        match self.digester {
            Digester::Sha1(h) => out.copy_from_slice(&h.finalize()),
            Digester::Blake3(h) => h.finalize_xof().fill(&mut out),
        }
        Hash(out)
    }
}

impl Write for ContentHasher {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// A writer that forwards bytes to an inner writer and hashes them on the way.
pub struct HashingWriter<W> {
    inner: W,
    hasher: ContentHasher,
    written: u64,
}

impl<W: Write> HashingWriter<W> {
    pub fn new(inner: W, algorithm: Algorithm) -> Self {
        Self {
            inner,
            hasher: ContentHasher::new(algorithm),
            written: 0,
        }
    }

    /// Number of bytes written so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Return the inner writer and the finished hash.
    pub fn finish(self) -> (W, Hash) {
        (self.inner, self.hasher.finalize())
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
