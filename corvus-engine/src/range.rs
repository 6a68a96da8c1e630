//! Global time-range detection with statistical outlier rejection.
//!
//! Artifact databases routinely carry sentinel timestamps (1999/2000 install
//! dates, far-future clock glitches). Scanning from such a value would
//! generate millions of empty windows, so per-source extremes are filtered
//! with an IQR rule plus a 20-year rule before the scan range is fixed.

use std::collections::BTreeMap;
use std::time::Instant;

use chrono::{DateTime, Duration, TimeZone, Utc};
use tracing::{debug, info};

use corvus_model::SourceId;

use crate::error::{EngineError, Result};

const IQR_MULTIPLIER: f64 = 1.5;
const TWENTY_YEARS_SECONDS: f64 = 20.0 * 365.25 * 24.0 * 3600.0;

/// Outcome of range detection, including the evidence it was based on.
#[derive(Debug, Clone)]
pub struct TimeRangeDetectionResult {
    pub earliest: DateTime<Utc>,
    pub latest: DateTime<Utc>,
    pub span_days: f64,
    pub source_ranges: BTreeMap<SourceId, (DateTime<Utc>, DateTime<Utc>)>,
    pub detection_seconds: f64,
    pub warnings: Vec<String>,
}

impl TimeRangeDetectionResult {
    pub fn span_years(&self) -> f64 {
        self.span_days / 365.25
    }
}

/// Computes the `[global_start, global_end]` bounds for a scan.
#[derive(Debug, Clone)]
pub struct TimeRangeDetector {
    max_time_range_years: u32,
}

impl TimeRangeDetector {
    pub fn new(max_time_range_years: u32) -> Self {
        Self {
            max_time_range_years,
        }
    }

    /// Resolve the scan range from per-source extremes and optional caller
    /// bounds. Caller bounds are used verbatim; a missing side is
    /// auto-detected with outlier filtering on that side only.
    pub fn detect(
        &self,
        source_ranges: &BTreeMap<SourceId, (DateTime<Utc>, DateTime<Utc>)>,
        filter_start: Option<DateTime<Utc>>,
        filter_end: Option<DateTime<Utc>>,
    ) -> Result<TimeRangeDetectionResult> {
        let started = Instant::now();
        let mut warnings = Vec::new();

        let mins: Vec<DateTime<Utc>> = source_ranges.values().map(|(min, _)| *min).collect();
        let maxes: Vec<DateTime<Utc>> = source_ranges.values().map(|(_, max)| *max).collect();

        let (earliest, latest) = match (filter_start, filter_end) {
            (Some(start), Some(end)) => {
                if let (Some(data_min), Some(data_max)) =
                    (mins.iter().min().copied(), maxes.iter().max().copied())
                {
                    if start < data_min {
                        warnings.push(format!(
                            "filter start {start} is before the earliest data ({data_min}); \
                             empty windows will be skipped"
                        ));
                    }
                    if end > data_max {
                        warnings.push(format!(
                            "filter end {end} is after the latest data ({data_max}); \
                             empty windows will be skipped"
                        ));
                    }
                }
                (start, end)
            }
            (Some(start), None) => {
                if maxes.is_empty() {
                    return Err(EngineError::EmptyTimeRange);
                }
                let (filtered, removed) = filter_outliers(&maxes, false, true);
                if removed > 0 {
                    warnings.push(format!(
                        "excluded {removed} outlier end timestamps (likely false timestamps)"
                    ));
                }
                let end = filtered
                    .iter()
                    .max()
                    .or(maxes.iter().max())
                    .copied()
                    .ok_or(EngineError::EmptyTimeRange)?;
                (start, end)
            }
            (None, Some(end)) => {
                if mins.is_empty() {
                    return Err(EngineError::EmptyTimeRange);
                }
                let (filtered, removed) = filter_outliers(&mins, true, false);
                if removed > 0 {
                    warnings.push(format!(
                        "excluded {removed} outlier start timestamps (likely false timestamps)"
                    ));
                }
                let start = filtered
                    .iter()
                    .min()
                    .or(mins.iter().min())
                    .copied()
                    .ok_or(EngineError::EmptyTimeRange)?;
                (start, end)
            }
            (None, None) => {
                if source_ranges.is_empty() {
                    return Err(EngineError::EmptyTimeRange);
                }
                let (filtered_min, removed_min) = filter_outliers(&mins, true, false);
                let (filtered_max, removed_max) = filter_outliers(&maxes, false, true);
                let total_removed = removed_min + removed_max;
                if total_removed > 0 {
                    warnings.push(format!(
                        "excluded {total_removed} outlier timestamps ({removed_min} early, \
                         {removed_max} late) - likely false timestamps"
                    ));
                }
                let start = filtered_min
                    .iter()
                    .min()
                    .or(mins.iter().min())
                    .copied()
                    .ok_or(EngineError::EmptyTimeRange)?;
                let end = filtered_max
                    .iter()
                    .max()
                    .or(maxes.iter().max())
                    .copied()
                    .ok_or(EngineError::EmptyTimeRange)?;
                (start, end)
            }
        };

        let (earliest, latest, span_days) = self.cap_span(earliest, latest, &mut warnings);

        info!(
            %earliest,
            %latest,
            span_days,
            warnings = warnings.len(),
            "resolved scan time range"
        );

        Ok(TimeRangeDetectionResult {
            earliest,
            latest,
            span_days,
            source_ranges: source_ranges.clone(),
            detection_seconds: started.elapsed().as_secs_f64(),
            warnings,
        })
    }

    fn cap_span(
        &self,
        earliest: DateTime<Utc>,
        latest: DateTime<Utc>,
        warnings: &mut Vec<String>,
    ) -> (DateTime<Utc>, DateTime<Utc>, f64) {
        let span_days = (latest - earliest).num_seconds() as f64 / 86_400.0;
        let span_years = span_days / 365.25;
        if span_years > self.max_time_range_years as f64 {
            let max_span_secs = (self.max_time_range_years as f64 * 365.25 * 86_400.0) as i64;
            let capped_start = latest - Duration::seconds(max_span_secs);
            warnings.push(format!(
                "time range exceeded {} years ({span_years:.1} years detected); limited to {} \
                 years starting from {}",
                self.max_time_range_years,
                self.max_time_range_years,
                capped_start.format("%Y-%m-%d"),
            ));
            let capped_days = (latest - capped_start).num_seconds() as f64 / 86_400.0;
            (capped_start, latest, capped_days)
        } else {
            (earliest, latest, span_days)
        }
    }
}

/// Drop sentinel timestamps from a set of per-source extremes.
///
/// Two rules run together: values outside `Q1 - 1.5*IQR` (low side) or
/// `Q3 + 1.5*IQR` (high side), and, on the low side only, anything more than
/// twenty years older than the latest value. If filtering would empty the set
/// the original values are returned untouched.
pub fn filter_outliers(
    timestamps: &[DateTime<Utc>],
    filter_low: bool,
    filter_high: bool,
) -> (Vec<DateTime<Utc>>, usize) {
    if timestamps.len() < 4 {
        return (timestamps.to_vec(), 0);
    }

    let mut seconds: Vec<f64> = timestamps.iter().map(|t| t.timestamp() as f64).collect();
    seconds.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let q1 = quantile(&seconds, 0.25);
    let q3 = quantile(&seconds, 0.75);
    let iqr = q3 - q1;
    let low_bound_iqr = q1 - IQR_MULTIPLIER * iqr;
    let high_bound_iqr = q3 + IQR_MULTIPLIER * iqr;

    let latest = *seconds.last().expect("non-empty");
    let low_bound_20yr = latest - TWENTY_YEARS_SECONDS;

    let mut kept = Vec::with_capacity(timestamps.len());
    let mut removed = 0usize;
    for ts in timestamps {
        let value = ts.timestamp() as f64;
        let outlier_iqr = (filter_low && value < low_bound_iqr)
            || (filter_high && value > high_bound_iqr);
        let outlier_20yr = filter_low && value < low_bound_20yr;
        if outlier_iqr || outlier_20yr {
            removed += 1;
            debug!(timestamp = %ts, iqr = outlier_iqr, twenty_year = outlier_20yr, "excluding outlier timestamp");
        } else {
            kept.push(*ts);
        }
    }

    if kept.is_empty() {
        return (timestamps.to_vec(), 0);
    }
    (kept, removed)
}

/// Linearly interpolated quantile over a sorted slice.
fn quantile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let position = p * (sorted.len() - 1) as f64;
    let lower = position.floor() as usize;
    let upper = position.ceil() as usize;
    if lower == upper {
        sorted[lower]
    } else {
        let fraction = position - lower as f64;
        sorted[lower] + (sorted[upper] - sorted[lower]) * fraction
    }
}

/// Convenience used by tests and statistics reporting.
pub fn utc(y: i32, mo: u32, d: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, mo, d, 0, 0, 0).unwrap()
}
