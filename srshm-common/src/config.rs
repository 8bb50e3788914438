//! Repository configuration: where regions live on disk and how long the
//! recovery-aware lock waits before escalating.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::consts::DEFAULT_LOCK_TIMEOUT_MS;
use crate::error::{ShmError, ShmResult};

/// Configuration for one repository's shared-memory substrate.
///
/// Deserializes from TOML; every field has a default so a repo can start
/// from `RepoConfig::default()` and override only what it needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RepoConfig {
    /// Directory the Main/Ext/lock region files are created under.
    pub runtime_dir: PathBuf,
    /// Repository name; region files are named `<name>.main`, `<name>.ext`.
    pub name: String,
    /// Milliseconds `with_recovery` waits for a shared/exclusive hold before
    /// assuming the holder died and running a recovery sweep.
    pub lock_timeout_ms: u64,
    /// Fraction of Ext SHM that must be `wasted` before a write-path
    /// operation triggers an implicit defrag.
    pub defrag_wasted_threshold: f64,
}

impl Default for RepoConfig {
    fn default() -> Self {
        Self {
            runtime_dir: PathBuf::from("/dev/shm"),
            name: "srshm".to_string(),
            lock_timeout_ms: DEFAULT_LOCK_TIMEOUT_MS,
            defrag_wasted_threshold: 0.25,
        }
    }
}

impl RepoConfig {
    /// Load configuration from a TOML file, falling back to defaults for any
    /// field the file omits.
    pub fn load_from_file(path: &Path) -> ShmResult<Self> {
        let text = std::fs::read_to_string(path)?;
        toml::from_str(&text).map_err(|e| ShmError::Validation {
            message: format!("invalid config at {}: {e}", path.display()),
        })
    }

    /// Path of the Main SHM region file.
    pub fn main_path(&self) -> PathBuf {
        self.runtime_dir.join(format!("{}.main", self.name))
    }

    /// Path of the Ext SHM region file.
    pub fn ext_path(&self) -> PathBuf {
        self.runtime_dir.join(format!("{}.ext", self.name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_internally_consistent() {
        let cfg = RepoConfig::default();
        assert!(cfg.lock_timeout_ms > 0);
        assert!(cfg.defrag_wasted_threshold > 0.0 && cfg.defrag_wasted_threshold < 1.0);
    }

    #[test]
    fn load_from_file_fills_in_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("repo.toml");
        std::fs::write(&path, "name = \"demo\"\n").unwrap();

        let cfg = RepoConfig::load_from_file(&path).unwrap();
        assert_eq!(cfg.name, "demo");
        assert_eq!(cfg.lock_timeout_ms, DEFAULT_LOCK_TIMEOUT_MS);
    }

    #[test]
    fn region_paths_use_configured_name() {
        let cfg = RepoConfig {
            name: "demo".into(),
            runtime_dir: PathBuf::from("/tmp/srshm"),
            ..RepoConfig::default()
        };
        assert_eq!(cfg.main_path(), PathBuf::from("/tmp/srshm/demo.main"));
        assert_eq!(cfg.ext_path(), PathBuf::from("/tmp/srshm/demo.ext"));
    }
}
