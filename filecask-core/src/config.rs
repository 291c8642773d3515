//! Repository configuration
//!
//! Stored at `<dir>/filecask.json`. All size and interval fields have
//! defaults suitable for a production node; tests shrink them.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Default cap on a single block file (128 MiB).
pub const DEFAULT_MAX_BLOCK_FILE_SIZE: u32 = 128 * 1024 * 1024;

/// Default preallocation chunk (16 MiB).
pub const DEFAULT_BLOCK_FILE_CHUNK_SIZE: u32 = 16 * 1024 * 1024;

/// Repository configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryConfig {
    /// Repository root directory.
    pub dir: PathBuf,
    /// Cap on a single block file; a record never spans two files.
    #[serde(default = "default_max_block_file_size")]
    pub max_block_file_size: u32,
    /// Block files grow in fixed preallocated chunks of this size.
    #[serde(default = "default_block_file_chunk_size")]
    pub block_file_chunk_size: u32,
    /// Compaction becomes eligible once soft-deleted bytes exceed this
    /// percentage of total stored bytes.
    #[serde(default = "default_shrink_percent")]
    pub shrink_percent: u32,
    /// Interval between expiration sweeps, in seconds.
    #[serde(default = "default_expiry_sweep_secs")]
    pub expiry_sweep_secs: u64,
    /// Interval between compaction eligibility checks, in seconds.
    #[serde(default = "default_compaction_sweep_secs")]
    pub compaction_sweep_secs: u64,
}

fn default_max_block_file_size() -> u32 {
    DEFAULT_MAX_BLOCK_FILE_SIZE
}

fn default_block_file_chunk_size() -> u32 {
    DEFAULT_BLOCK_FILE_CHUNK_SIZE
}

fn default_shrink_percent() -> u32 {
    25
}

fn default_expiry_sweep_secs() -> u64 {
    600
}

fn default_compaction_sweep_secs() -> u64 {
    1800
}

impl RepositoryConfig {
    /// Create a config rooted at `dir` with default limits.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            max_block_file_size: default_max_block_file_size(),
            block_file_chunk_size: default_block_file_chunk_size(),
            shrink_percent: default_shrink_percent(),
            expiry_sweep_secs: default_expiry_sweep_secs(),
            compaction_sweep_secs: default_compaction_sweep_secs(),
        }
    }

    fn config_path(dir: &Path) -> PathBuf {
        dir.join("filecask.json")
    }

    /// Load the config from a repository directory, falling back to
    /// defaults when no config file exists yet.
    pub fn load(dir: &Path) -> Result<Self> {
        let path = Self::config_path(dir);
        if !path.exists() {
            return Ok(Self::new(dir));
        }
        let data = fs::read_to_string(&path)?;
        let mut config: RepositoryConfig = serde_json::from_str(&data)
            .map_err(|e| crate::error::RepositoryError::Serialization(e.to_string()))?;
        config.dir = dir.to_path_buf();
        Ok(config)
    }

    /// Save the config into its repository directory.
    pub fn save(&self) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        let path = Self::config_path(&self.dir);
        let tmp_path = path.with_extension("tmp");
        let data = serde_json::to_string_pretty(self)
            .map_err(|e| crate::error::RepositoryError::Serialization(e.to_string()))?;
        fs::write(&tmp_path, &data)?;
        fs::rename(&tmp_path, &path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_config_defaults_when_missing() {
        let tmp = TempDir::new().unwrap();
        let config = RepositoryConfig::load(tmp.path()).unwrap();
        assert_eq!(config.max_block_file_size, DEFAULT_MAX_BLOCK_FILE_SIZE);
        assert_eq!(config.shrink_percent, 25);
    }

    #[test]
    fn test_config_save_load() {
        let tmp = TempDir::new().unwrap();
        let mut config = RepositoryConfig::new(tmp.path());
        config.shrink_percent = 40;
        config.save().unwrap();

        let loaded = RepositoryConfig::load(tmp.path()).unwrap();
        assert_eq!(loaded.shrink_percent, 40);
        assert_eq!(loaded.dir, tmp.path());
    }
}
