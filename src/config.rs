use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::metadata::DEFAULT_SIDECAR_DIR;

/// Configuration keys used by the core (spec §6), generalized from the
/// teacher's `config.rs` persisted-JSON pattern.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ShareConfig {
    /// Root of local cached content.
    pub local_path: PathBuf,
    /// Directory containing the queue database (and, unless
    /// `sidecar_dir_name` says otherwise, the sidecars).
    pub work_path: PathBuf,
    /// Reserved sidecar directory name, beside each directory it describes.
    pub sidecar_dir_name: String,
    /// Tolerance (ms) for the compatibility `canDelete` variant of spec §9.
    pub modified_threshold_millis: u64,
    /// Disables NFKC normalization at the remote boundary.
    pub no_unicode_normalize: bool,
    /// Disables starting the background Processor.
    pub no_processor: bool,
    /// Directory-listing cache TTL, in milliseconds.
    pub list_cache_ttl_millis: u64,
    pub processor: ProcessorConfig,
}

/// Processor tuning (spec §4.7).
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessorConfig {
    /// Age (ms) a record must reach before it is eligible for processing.
    pub expiration_millis: u64,
    pub max_retries: u32,
    pub retry_delay_millis: u64,
    /// Poll interval, in milliseconds.
    pub frequency_millis: u64,
    /// Period between purge sweeps, in milliseconds.
    pub purge_failed_millis: u64,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            expiration_millis: 2_000,
            max_retries: 5,
            retry_delay_millis: 5_000,
            frequency_millis: 1_000,
            purge_failed_millis: 60_000,
        }
    }
}

impl Default for ShareConfig {
    fn default() -> Self {
        Self {
            local_path: PathBuf::from("./cache"),
            work_path: PathBuf::from("./cache/.rqfs"),
            sidecar_dir_name: DEFAULT_SIDECAR_DIR.to_string(),
            modified_threshold_millis: 2_000,
            no_unicode_normalize: false,
            no_processor: false,
            list_cache_ttl_millis: 2_000,
            processor: ProcessorConfig::default(),
        }
    }
}

impl ShareConfig {
    pub fn load(path: &Path) -> Self {
        match fs::read_to_string(path) {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_default(),
            Err(_) => Self::default(),
        }
    }

    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)
            .expect("ShareConfig always serializes: no non-finite floats, no maps with non-string keys");
        fs::write(path, contents)
    }

    pub fn default_config_path(work_path: &Path) -> PathBuf {
        work_path.join("config.json")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        let mut config = ShareConfig::default();
        config.processor.max_retries = 9;
        config.save(&path).unwrap();

        let loaded = ShareConfig::load(&path);
        assert_eq!(loaded.processor.max_retries, 9);
    }

    #[test]
    fn load_missing_file_falls_back_to_default() {
        let dir = tempdir().unwrap();
        let loaded = ShareConfig::load(&dir.path().join("missing.json"));
        assert_eq!(loaded.sidecar_dir_name, DEFAULT_SIDECAR_DIR);
    }
}
