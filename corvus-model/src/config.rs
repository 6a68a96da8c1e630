use chrono::{DateTime, Utc};

use crate::error::{ModelError, Result};
use crate::wing::Wing;

/// Tunable parameters of the time-window scanning engine.
///
/// Serialized form is the `TimeWindowScanningConfig` document; the semantic
/// fields and defaults follow the engine's resource caps.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    pub window_size_minutes: i64,
    /// Step between window starts; defaults to the window size, which yields
    /// non-overlapping windows.
    pub scanning_interval_minutes: Option<i64>,
    pub starting_epoch: Option<DateTime<Utc>>,
    pub ending_epoch: Option<DateTime<Utc>>,
    pub auto_detect_time_range: bool,
    pub max_time_range_years: u32,
    pub enable_quick_empty_check: bool,
    pub enable_overlapping_windows: bool,
    pub max_records_per_window: usize,
    pub max_matches_per_anchor: usize,
    pub parallel_window_processing: bool,
    /// Worker count; `None` auto-sizes to `min(2 * cores, 16)`.
    pub max_workers: Option<usize>,
    pub parallel_batch_size: usize,
    pub min_batch_size: usize,
    pub max_batch_size: usize,
    pub memory_limit_mb: u64,
    pub enable_streaming_mode: bool,
    pub debug_mode: bool,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            window_size_minutes: 60,
            scanning_interval_minutes: None,
            starting_epoch: None,
            ending_epoch: None,
            auto_detect_time_range: true,
            max_time_range_years: 10,
            enable_quick_empty_check: true,
            enable_overlapping_windows: false,
            max_records_per_window: 100_000,
            max_matches_per_anchor: 100,
            parallel_window_processing: false,
            max_workers: None,
            parallel_batch_size: 50,
            min_batch_size: 10,
            max_batch_size: 500,
            memory_limit_mb: 500,
            enable_streaming_mode: false,
            debug_mode: false,
        }
    }
}

impl ScanConfig {
    /// Effective step between window starts, in minutes.
    pub fn effective_interval_minutes(&self) -> i64 {
        self.scanning_interval_minutes
            .unwrap_or(self.window_size_minutes)
    }

    pub fn is_overlapping(&self) -> bool {
        self.effective_interval_minutes() < self.window_size_minutes
    }

    /// Worker pool size: explicit override or `min(2 * cores, 16)`.
    pub fn effective_workers(&self, cores: usize) -> usize {
        self.max_workers
            .unwrap_or_else(|| (2 * cores).clamp(1, 16))
            .max(1)
    }

    /// Derive a config from a wing's correlation rules, keeping engine-level
    /// knobs at their current values.
    pub fn adapted_to_wing(mut self, wing: &Wing) -> Self {
        self.window_size_minutes = wing.rules.window_minutes;
        self.max_time_range_years = wing.rules.max_time_range_years;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.window_size_minutes <= 0 {
            return Err(ModelError::InvalidConfig(format!(
                "window_size_minutes must be positive, got {}",
                self.window_size_minutes
            )));
        }
        let interval = self.effective_interval_minutes();
        if interval <= 0 {
            return Err(ModelError::InvalidConfig(format!(
                "scanning_interval_minutes must be positive, got {interval}"
            )));
        }
        if interval < self.window_size_minutes && !self.enable_overlapping_windows {
            return Err(ModelError::InvalidConfig(format!(
                "scanning interval {interval}m is shorter than the {}m window but \
                 overlapping windows are disabled",
                self.window_size_minutes
            )));
        }
        if let (Some(start), Some(end)) = (self.starting_epoch, self.ending_epoch)
            && start >= end
        {
            return Err(ModelError::InvalidConfig(
                "starting_epoch must be before ending_epoch".to_string(),
            ));
        }
        if self.max_time_range_years == 0 {
            return Err(ModelError::InvalidConfig(
                "max_time_range_years must be positive".to_string(),
            ));
        }
        if self.max_records_per_window == 0 {
            return Err(ModelError::InvalidConfig(
                "max_records_per_window must be positive".to_string(),
            ));
        }
        if self.max_matches_per_anchor == 0 {
            return Err(ModelError::InvalidConfig(
                "max_matches_per_anchor must be positive".to_string(),
            ));
        }
        if self.min_batch_size == 0 || self.min_batch_size > self.max_batch_size {
            return Err(ModelError::InvalidConfig(format!(
                "batch bounds [{}, {}] are not a valid range",
                self.min_batch_size, self.max_batch_size
            )));
        }
        if self.memory_limit_mb == 0 {
            return Err(ModelError::InvalidConfig(
                "memory_limit_mb must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
