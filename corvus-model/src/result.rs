use std::collections::BTreeMap;

use crate::ids::{SourceId, WingId};
use crate::matches::CorrelationMatch;

/// How target filters (`apply_to: specific`) shaped the record stream.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct FilterStatistics {
    pub records_considered: u64,
    pub records_filtered_out: u64,
    pub windows_dropped_by_filter: u64,
}

/// Runtime metrics accumulated over a scan.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct PerformanceMetrics {
    pub windows_generated: u64,
    pub windows_with_data: u64,
    pub empty_windows_skipped: u64,
    pub skip_rate_percentage: f64,
    pub empty_check_seconds: f64,
    /// Rough wall time saved by the quick empty check, extrapolated from the
    /// average cost of a fully-queried window.
    pub estimated_seconds_saved: f64,
    pub query_cache_hits: u64,
    pub query_cache_misses: u64,
    pub time_range_detection_seconds: f64,
    pub windows_per_second: f64,
    pub records_per_second: f64,
    pub peak_memory_mb: f64,
    pub streaming_mode_activated: bool,
}

impl PerformanceMetrics {
    pub fn recompute_skip_rate(&mut self) {
        self.skip_rate_percentage = if self.windows_generated > 0 {
            self.empty_windows_skipped as f64 / self.windows_generated as f64 * 100.0
        } else {
            0.0
        };
    }
}

/// Phase-2 replay accounting.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct Phase2Statistics {
    pub windows_replayed: u64,
    pub anchors_enumerated: u64,
    pub combinations_generated: u64,
    pub alternate_limit_hits: u64,
    pub duplicates_flagged: u64,
}

/// The complete outcome of one wing execution.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CorrelationResult {
    pub wing_id: WingId,
    pub wing_name: String,
    pub matches: Vec<CorrelationMatch>,
    /// Number of sources successfully opened and scanned.
    #[serde(rename = "feathers_processed")]
    pub sources_processed: usize,
    pub total_records_scanned: u64,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub filter_statistics: FilterStatistics,
    pub duplicates_prevented: u64,
    pub duplicates_by_source: BTreeMap<SourceId, u64>,
    pub matches_failed_validation: u64,
    pub execution_duration_seconds: f64,
    pub performance_metrics: PerformanceMetrics,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase2_statistics: Option<Phase2Statistics>,
}

impl CorrelationResult {
    pub fn new(wing_id: WingId, wing_name: impl Into<String>) -> Self {
        Self {
            wing_id,
            wing_name: wing_name.into(),
            matches: Vec::new(),
            sources_processed: 0,
            total_records_scanned: 0,
            errors: Vec::new(),
            warnings: Vec::new(),
            filter_statistics: FilterStatistics::default(),
            duplicates_prevented: 0,
            duplicates_by_source: BTreeMap::new(),
            matches_failed_validation: 0,
            execution_duration_seconds: 0.0,
            performance_metrics: PerformanceMetrics::default(),
            phase2_statistics: None,
        }
    }

    /// True when the run finished without fatal conditions.
    pub fn succeeded(&self) -> bool {
        self.errors.is_empty()
    }

    /// Matches that survived deduplication.
    pub fn canonical_matches(&self) -> impl Iterator<Item = &CorrelationMatch> {
        self.matches.iter().filter(|m| !m.is_duplicate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skip_rate_handles_zero_windows() {
        let mut metrics = PerformanceMetrics::default();
        metrics.recompute_skip_rate();
        assert_eq!(metrics.skip_rate_percentage, 0.0);

        metrics.windows_generated = 200;
        metrics.empty_windows_skipped = 150;
        metrics.recompute_skip_rate();
        assert!((metrics.skip_rate_percentage - 75.0).abs() < f64::EPSILON);
    }

    #[test]
    fn result_serializes_sources_under_legacy_name() {
        let result = CorrelationResult::new(WingId::new("w"), "wing");
        let json = serde_json::to_string(&result).unwrap();
        assert!(json.contains("\"feathers_processed\""));
    }
}
