use serde::{Deserialize, Serialize};

use crate::error::{FileError, FileResult};

/// Thresholds of the data file consolidation policy.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataFileEvaluatorConfig {
    /// Files below this size are merged into the head file (unless they are the head file).
    pub minimum_file_size: u64,
    /// The head file is retired once it reaches this size.
    pub maximum_file_size: u64,
    /// Files whose live-data ratio drops below this value are dissolved.
    pub minimum_use_ratio: f64,
    /// Whether the head file itself is subject to dissolving.
    pub clean_up_head_file: bool,
}

impl Default for DataFileEvaluatorConfig {
    fn default() -> Self {
        Self {
            minimum_file_size: 1024 * 1024,
            maximum_file_size: 8 * 1024 * 1024,
            minimum_use_ratio: 0.75,
            clean_up_head_file: true,
        }
    }
}

/// Size and occupancy of one data file, as seen by the evaluator.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DataFileStats {
    /// Physical length of the file in bytes.
    pub total_length: u64,
    /// Bytes of the file still occupied by live records.
    pub data_length: u64,
    /// Whether this is the file currently receiving appends.
    pub is_head_file: bool,
    /// Whether the file holds exactly one live entity.
    pub has_single_entity: bool,
}

impl DataFileStats {
    /// Share of the file occupied by live data. An empty file counts as full.
    pub fn fill_ratio(&self) -> f64 {
        if self.total_length == 0 {
            return 1.0;
        }
        self.data_length as f64 / self.total_length as f64
    }
}

/// Decides when a data file must be dissolved or the head file retired.
///
/// Stateless apart from its thresholds and infallible once constructed: it
/// runs on the channel threads between every task.
#[derive(Clone, Debug, PartialEq)]
pub struct DataFileEvaluator {
    config: DataFileEvaluatorConfig,
}

impl DataFileEvaluator {
    /// Build an evaluator, validating the thresholds.
    pub fn new(config: DataFileEvaluatorConfig) -> FileResult<Self> {
        if config.maximum_file_size <= config.minimum_file_size {
            return Err(FileError::InvalidConfiguration(format!(
                "maximum file size {} must be greater than minimum file size {}",
                config.maximum_file_size, config.minimum_file_size
            )));
        }
        // Also rejects NaN.
        if !(config.minimum_use_ratio > 0.0 && config.minimum_use_ratio <= 1.0) {
            return Err(FileError::InvalidConfiguration(format!(
                "minimum use ratio {} must be in (0, 1]",
                config.minimum_use_ratio
            )));
        }
        Ok(Self { config })
    }

    /// Shorthand for [`new`](Self::new) with head file clean-up enabled.
    pub fn with_sizes(
        minimum_file_size: u64,
        maximum_file_size: u64,
        minimum_use_ratio: f64,
    ) -> FileResult<Self> {
        Self::new(DataFileEvaluatorConfig {
            minimum_file_size,
            maximum_file_size,
            minimum_use_ratio,
            clean_up_head_file: true,
        })
    }

    pub fn config(&self) -> &DataFileEvaluatorConfig {
        &self.config
    }

    pub fn minimum_file_size(&self) -> u64 {
        self.config.minimum_file_size
    }

    pub fn maximum_file_size(&self) -> u64 {
        self.config.maximum_file_size
    }

    /// Whether the live content of `file` should be moved elsewhere and the
    /// file deleted.
    pub fn needs_dissolving(&self, file: &DataFileStats) -> bool {
        // Dissolving the head file only produces a new head file of the same size.
        if !self.config.clean_up_head_file && file.is_head_file {
            return false;
        }

        (self.is_below_minimum_size(file) && !file.is_head_file)
            || self.has_too_many_gaps(file)
            || (self.is_oversized(file) && !Self::is_single_gapless_entity(file))
    }

    /// Whether the head file has grown large enough to be replaced by a new one.
    pub fn needs_retirement(&self, total_length: u64) -> bool {
        total_length >= self.config.maximum_file_size
    }

    fn is_below_minimum_size(&self, file: &DataFileStats) -> bool {
        file.total_length < self.config.minimum_file_size
    }

    fn has_too_many_gaps(&self, file: &DataFileStats) -> bool {
        file.fill_ratio() < self.config.minimum_use_ratio
    }

    fn is_oversized(&self, file: &DataFileStats) -> bool {
        file.total_length > self.config.maximum_file_size
    }

    fn is_single_gapless_entity(file: &DataFileStats) -> bool {
        file.has_single_entity && file.data_length == file.total_length
    }
}

impl Default for DataFileEvaluator {
    fn default() -> Self {
        Self {
            config: DataFileEvaluatorConfig::default(),
        }
    }
}
