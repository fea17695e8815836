//! Storage configuration, loadable from TOML.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use chanstore_backup::BackupConfig;
use chanstore_file::{DataFileEvaluator, DataFileEvaluatorConfig};
use chanstore_types::ChannelCount;

use crate::error::{EngineError, EngineResult};

/// Idle-time maintenance of channels.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HousekeepingConfig {
    /// How long a channel waits for a task before housekeeping.
    pub interval_ms: u64,
    pub file_check_budget_ms: u64,
    pub gc_budget_ms: u64,
    pub cache_check_budget_ms: u64,
}

impl HousekeepingConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn file_check_budget(&self) -> Duration {
        Duration::from_millis(self.file_check_budget_ms)
    }

    pub fn gc_budget(&self) -> Duration {
        Duration::from_millis(self.gc_budget_ms)
    }

    pub fn cache_check_budget(&self) -> Duration {
        Duration::from_millis(self.cache_check_budget_ms)
    }
}

impl Default for HousekeepingConfig {
    fn default() -> Self {
        Self {
            interval_ms: 1000,
            file_check_budget_ms: 10,
            gc_budget_ms: 10,
            cache_check_budget_ms: 10,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EntityCacheConfig {
    /// Payload bytes each channel keeps in memory before the cache check evicts.
    pub byte_limit: u64,
}

impl Default for EntityCacheConfig {
    fn default() -> Self {
        Self {
            byte_limit: 64 * 1024 * 1024,
        }
    }
}

/// Top-level storage configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root directory holding one subdirectory per channel.
    pub storage_directory: PathBuf,
    /// Number of channels. A power of two, at most 1024.
    pub channel_count: u32,
    pub housekeeping: HousekeepingConfig,
    pub data_files: DataFileEvaluatorConfig,
    pub cache: EntityCacheConfig,
    /// Continuous backup; disabled when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup: Option<BackupConfig>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            storage_directory: PathBuf::from("storage"),
            channel_count: 1,
            housekeeping: HousekeepingConfig::default(),
            data_files: DataFileEvaluatorConfig::default(),
            cache: EntityCacheConfig::default(),
            backup: None,
        }
    }
}

impl StorageConfig {
    /// Parse and validate a TOML document. Missing fields take their defaults.
    pub fn from_toml_str(content: &str) -> EngineResult<Self> {
        let config: Self = toml::from_str(content).map_err(|e| EngineError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> EngineResult<Self> {
        let content = fs::read_to_string(path).map_err(|e| EngineError::io(path, e))?;
        Self::from_toml_str(&content)
    }

    pub fn to_toml_string(&self) -> EngineResult<String> {
        toml::to_string_pretty(self).map_err(|e| EngineError::Config(e.to_string()))
    }

    pub fn channel_count(&self) -> EngineResult<ChannelCount> {
        Ok(ChannelCount::new(self.channel_count)?)
    }

    pub fn validate(&self) -> EngineResult<()> {
        self.channel_count()?;
        DataFileEvaluator::new(self.data_files.clone())?;
        if self.housekeeping.interval_ms == 0 {
            return Err(EngineError::Config(
                "housekeeping interval must be positive".to_string(),
            ));
        }
        if let Some(backup) = &self.backup {
            if backup.directory == self.storage_directory {
                return Err(EngineError::Config(format!(
                    "backup directory {} is the storage directory",
                    backup.directory.display()
                )));
            }
            if backup.poll_timeout_ms == 0 {
                return Err(EngineError::Config(
                    "backup poll timeout must be positive".to_string(),
                ));
            }
        }
        Ok(())
    }
}
