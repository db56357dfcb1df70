//! Repository configuration.
//!
//! ```toml
//! root = "/var/lib/depot/content"
//! algorithm = "sha1"
//! obsolescence_grace_period_ms = 300000
//! remove_unreferenced_immediately = false
//! ```

use crate::error::{Error, Result};
use crate::hash::Algorithm;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Default time unreferenced content must stay unreferenced before the
/// collector deletes it.
pub const DEFAULT_GRACE_PERIOD_MS: u64 = 300_000;

/// Default repository root, relative to the working directory.
pub const DEFAULT_ROOT: &str = "depot-content";

/// Settings for a [`Repository`](crate::Repository).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepositoryConfig {
    /// Repository root directory.
    pub root: PathBuf,
    /// Digest used for every hash in the repository.
    pub algorithm: Algorithm,
    /// Grace period for unreferenced content, in milliseconds.
    pub obsolescence_grace_period_ms: u64,
    /// Physically remove content as soon as its last reference is dropped,
    /// instead of leaving it to the collector.
    pub remove_unreferenced_immediately: bool,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from(DEFAULT_ROOT),
            algorithm: Algorithm::default(),
            obsolescence_grace_period_ms: DEFAULT_GRACE_PERIOD_MS,
            remove_unreferenced_immediately: false,
        }
    }
}

impl RepositoryConfig {
    /// Default settings for a repository at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }

    pub fn with_algorithm(mut self, algorithm: Algorithm) -> Self {
        self.algorithm = algorithm;
        self
    }

    pub fn with_grace_period_ms(mut self, millis: u64) -> Self {
        self.obsolescence_grace_period_ms = millis;
        self
    }

    pub fn with_immediate_removal(mut self, enabled: bool) -> Self {
        self.remove_unreferenced_immediately = enabled;
        self
    }

    /// Parse a TOML document. `origin` names the source in errors.
    pub fn from_toml_str(text: &str, origin: &Path) -> Result<Self> {
        toml::from_str(text)
            .map_err(|e| Error::configuration(origin, format!("failed to parse config: {}", e)))
    }

    /// Load a TOML config file.
    ///
    /// A relative `root` is resolved against the file's directory.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .map_err(|e| Error::configuration(path, format!("failed to read config: {}", e)))?;
        let mut config = Self::from_toml_str(&text, path)?;

        if config.root.is_relative()
            && let Some(dir) = path.parent()
        {
            config.root = dir.join(&config.root);
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = RepositoryConfig::default();
        assert_eq!(config.root, PathBuf::from("depot-content"));
        assert_eq!(config.algorithm, Algorithm::Sha1);
        assert_eq!(config.obsolescence_grace_period_ms, 300_000);
        assert!(!config.remove_unreferenced_immediately);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = RepositoryConfig::from_toml_str(
            "algorithm = \"blake3-160\"\nobsolescence_grace_period_ms = 10\n",
            Path::new("inline"),
        )
        .unwrap();

        assert_eq!(config.algorithm, Algorithm::Blake3);
        assert_eq!(config.obsolescence_grace_period_ms, 10);
        assert_eq!(config.root, PathBuf::from(DEFAULT_ROOT));
    }

    #[test]
    fn test_invalid_toml_is_configuration_error() {
        let err = RepositoryConfig::from_toml_str("algorithm = \"md5\"", Path::new("inline"))
            .unwrap_err();
        assert!(matches!(err, Error::Configuration { .. }));
    }

    #[test]
    fn test_load_resolves_relative_root() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("depot.toml");
        fs::write(&path, "root = \"content\"\nremove_unreferenced_immediately = true\n").unwrap();

        let config = RepositoryConfig::load(&path).unwrap();
        assert_eq!(config.root, temp_dir.path().join("content"));
        assert!(config.remove_unreferenced_immediately);
    }

    #[test]
    fn test_load_missing_file() {
        let temp_dir = TempDir::new().unwrap();
        let err = RepositoryConfig::load(&temp_dir.path().join("missing.toml")).unwrap_err();
        assert!(matches!(err, Error::Configuration { .. }));
    }

    #[test]
    fn test_toml_round_trip() {
        let config = RepositoryConfig::new("/srv/depot")
            .with_algorithm(Algorithm::Blake3)
            .with_grace_period_ms(1_000);
        let text = toml::to_string(&config).unwrap();
        assert_eq!(RepositoryConfig::from_toml_str(&text, Path::new("inline")).unwrap(), config);
    }
}
