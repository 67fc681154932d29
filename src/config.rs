use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Bytes that must arrive before the partial duplicate check runs.
pub const DEFAULT_PARTIAL_CHECK_BYTES: u64 = 1024 * 1024;

/// Prefix length covered by the partial hash.
pub const DEFAULT_PARTIAL_HASH_BYTES: u64 = 1024 * 1024;

pub const DEFAULT_FUZZY_A_THRESHOLD: u32 = 80;
pub const DEFAULT_FUZZY_B_MAX_DISTANCE: u32 = 30;

const STORE_FILE_NAME: &str = "hashes.json";
const HISTORY_FILE_NAME: &str = "history.json";

/// Matching thresholds and partial-check trigger points.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchPolicy {
    /// Block-hash similarity (0-100) at or above which two files match.
    pub fuzzy_a_threshold: u32,
    /// Locality-sensitive distance strictly below which two files match.
    pub fuzzy_b_max_distance: u32,
    pub partial_check_bytes: u64,
    pub partial_hash_bytes: u64,
    /// Compare the target filename against stored base names before starting.
    pub check_store_filenames: bool,
}

impl Default for MatchPolicy {
    fn default() -> Self {
        Self {
            fuzzy_a_threshold: DEFAULT_FUZZY_A_THRESHOLD,
            fuzzy_b_max_distance: DEFAULT_FUZZY_B_MAX_DISTANCE,
            partial_check_bytes: DEFAULT_PARTIAL_CHECK_BYTES,
            partial_hash_bytes: DEFAULT_PARTIAL_HASH_BYTES,
            check_store_filenames: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub download_dir: PathBuf,
    pub store_path: PathBuf,
    pub history_path: PathBuf,
    pub policy: MatchPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self::in_dir(".", "downloads")
    }
}

impl Config {
    /// Standard layout: fingerprint store and history live in `data_dir`.
    pub fn in_dir(data_dir: impl AsRef<Path>, download_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.as_ref();
        Self {
            download_dir: download_dir.into(),
            store_path: data_dir.join(STORE_FILE_NAME),
            history_path: data_dir.join(HISTORY_FILE_NAME),
            policy: MatchPolicy::default(),
        }
    }

    /// Load a JSON config file; keys that are absent keep their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn with_policy(mut self, policy: MatchPolicy) -> Self {
        self.policy = policy;
        self
    }
}
