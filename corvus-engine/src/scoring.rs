//! Match scoring and confidence assessment.
//!
//! Every match gets the composite score (`0.4 coverage + 0.3 time proximity +
//! 0.3 field similarity`), which is what `match_score` carries — it is always
//! in `[0, 1]`. When the wing enables weighted scoring the raw weighted sum is
//! reported alongside in `weighted_score` together with its interpretation
//! band; the raw sum may exceed 1.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use tracing::warn;

use corvus_model::{
    ConfidenceBand, CorrelationMatch, ScoreBreakdown, SourceId, SourceRecord, Wing,
};

/// Plurality share a field needs to count as consistent for confidence.
const CONSISTENCY_SHARE: f64 = 0.8;

/// Scoring outcome for one record combination.
#[derive(Debug, Clone)]
pub struct MatchScore {
    pub match_score: f64,
    pub breakdown: ScoreBreakdown,
    /// Raw weighted sum when the wing enables weighted scoring.
    pub weighted_score: Option<f64>,
    pub confidence_score: f64,
    pub confidence_band: ConfidenceBand,
    pub time_spread_seconds: f64,
    pub field_similarity_scores: BTreeMap<String, f64>,
}

/// Score one combination of records against the wing's rules.
pub fn score_match(
    records: &BTreeMap<SourceId, SourceRecord>,
    wing: &Wing,
) -> MatchScore {
    let contributing = records.len();
    let total_sources = wing.sources.len().max(1);
    let window_seconds = (wing.rules.window_minutes * 60).max(1) as f64;

    let time_spread_seconds = time_spread(records.values().map(|r| r.instant));

    let coverage = contributing as f64 / total_sources as f64;
    let time_proximity = (-time_spread_seconds / window_seconds).exp();

    let (app_share, app_matches) = plurality(records.values().map(SourceRecord::application));
    let (path_share, path_matches) = plurality(records.values().map(SourceRecord::file_path));
    let field_similarity = if contributing > 0 {
        (app_matches + path_matches) as f64 / (2 * contributing) as f64
    } else {
        0.0
    };

    let mut field_similarity_scores = BTreeMap::new();
    if contributing > 0 {
        field_similarity_scores.insert(
            "application".to_string(),
            app_matches as f64 / contributing as f64,
        );
        field_similarity_scores.insert(
            "file_path".to_string(),
            path_matches as f64 / contributing as f64,
        );
    }

    let composite = 0.4 * coverage + 0.3 * time_proximity + 0.3 * field_similarity;

    let (weighted_score, label) = if wing.scoring.enabled {
        let raw: f64 = records
            .keys()
            .filter_map(|id| wing.source(id))
            .map(|spec| spec.weight)
            .sum();
        (Some(raw), weighted_label(wing, raw))
    } else {
        (None, simple_label(contributing, total_sources))
    };

    // Confidence blends how tight the cluster is with how consistently its
    // fields agree.
    let time_tightness = (1.0 - time_spread_seconds / window_seconds).clamp(0.0, 1.0);
    let mut comparable = 0u32;
    let mut consistent = 0u32;
    for share in [app_share, path_share].into_iter().flatten() {
        comparable += 1;
        if share >= CONSISTENCY_SHARE {
            consistent += 1;
        }
    }
    let field_consistency = if comparable > 0 {
        f64::from(consistent) / f64::from(comparable)
    } else {
        0.0
    };
    let confidence_score = 0.5 * time_tightness + 0.5 * field_consistency;

    MatchScore {
        match_score: composite.clamp(0.0, 1.0),
        breakdown: ScoreBreakdown {
            coverage,
            time_proximity,
            field_similarity,
            label,
        },
        weighted_score,
        confidence_score,
        confidence_band: ConfidenceBand::from_score(confidence_score),
        time_spread_seconds,
        field_similarity_scores,
    }
}

/// Contributor-fraction labels for simple scoring.
fn simple_label(contributing: usize, total_sources: usize) -> String {
    let fraction = contributing as f64 / total_sources as f64;
    let label = if fraction >= 0.8 {
        "Strong"
    } else if fraction >= 0.5 {
        "Good"
    } else if fraction >= 0.25 {
        "Partial"
    } else {
        "Weak"
    };
    label.to_string()
}

/// First interpretation band (by descending minimum) the raw sum clears.
fn weighted_label(wing: &Wing, raw_score: f64) -> String {
    let total = wing.total_weight();
    if total > 1.0 + f64::EPSILON {
        warn!(
            total_weight = total,
            "configured source weights sum above 1.0"
        );
    }
    wing.scoring
        .sorted_bands()
        .into_iter()
        .find(|band| band.min <= raw_score)
        .map(|band| band.label)
        .unwrap_or_else(|| "Unscored".to_string())
}

/// Normalized weighted score for display: raw divided by the sum of all
/// configured weights.
pub fn normalized_weighted(wing: &Wing, raw_score: f64) -> f64 {
    let total = wing.total_weight();
    if total > 0.0 { raw_score / total } else { 0.0 }
}

fn time_spread(instants: impl Iterator<Item = DateTime<Utc>>) -> f64 {
    let instants: Vec<DateTime<Utc>> = instants.collect();
    match (instants.iter().min(), instants.iter().max()) {
        (Some(min), Some(max)) => (*max - *min).num_milliseconds() as f64 / 1000.0,
        _ => 0.0,
    }
}

/// Plurality share and match count over an optional field. Returns
/// `(None, 0)` when no participant carries the field.
fn plurality(values: impl Iterator<Item = Option<String>>) -> (Option<f64>, usize) {
    let present: Vec<String> = values.flatten().collect();
    if present.is_empty() {
        return (None, 0);
    }
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for value in &present {
        *counts.entry(value.as_str()).or_insert(0) += 1;
    }
    let plurality_count = counts.values().max().copied().unwrap_or(0);
    let share = plurality_count as f64 / present.len() as f64;
    (Some(share), plurality_count)
}

/// Pre-emission integrity validation: anchor present, score in range, and the
/// reported time spread within a hundredth of a second of the recomputed one.
pub fn validate_match(m: &CorrelationMatch, expected_sources: usize) -> std::result::Result<(), String> {
    if m.records.len() != expected_sources {
        return Err(format!(
            "record count {} does not match declared source count {expected_sources}",
            m.records.len()
        ));
    }
    if !m.records.contains_key(&m.anchor_source_id) {
        return Err(format!("anchor source {} missing from records", m.anchor_source_id));
    }
    if !(0.0..=1.0).contains(&m.match_score) {
        return Err(format!("match_score {} outside [0, 1]", m.match_score));
    }
    let computed = m.computed_time_spread_seconds();
    if (computed - m.time_spread_seconds).abs() > 0.01 {
        return Err(format!(
            "time_spread_seconds {} disagrees with computed {computed}",
            m.time_spread_seconds
        ));
    }
    Ok(())
}
