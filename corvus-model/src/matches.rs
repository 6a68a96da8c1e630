use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};

use crate::artifact::ArtifactType;
use crate::ids::{MatchId, SourceId};
use crate::record::SourceRecord;

/// Content-defined identity of a match, used for deduplication.
///
/// Two matches with equal `MatchSet`s describe the same set of records and
/// only one of them may be canonical; any later occurrence is flagged as a
/// duplicate, including repeats produced by overlapping windows.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct MatchSet {
    pub anchor_source_id: SourceId,
    pub anchor_record_key: String,
    /// Every participating (source, record key) pair, anchor included, in
    /// sorted order so identity is independent of construction order.
    pub participants: BTreeSet<(SourceId, String)>,
}

impl MatchSet {
    pub fn new(
        anchor_source_id: SourceId,
        anchor_record_key: String,
        participants: impl IntoIterator<Item = (SourceId, String)>,
    ) -> Self {
        Self {
            anchor_source_id,
            anchor_record_key,
            participants: participants.into_iter().collect(),
        }
    }
}

impl fmt::Display for MatchSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.anchor_source_id, self.anchor_record_key)?;
        for (source, key) in &self.participants {
            write!(f, "|{source}:{key}")?;
        }
        Ok(())
    }
}

/// Qualitative confidence label derived from the confidence score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ConfidenceBand {
    High,
    Medium,
    Low,
}

impl ConfidenceBand {
    /// `>0.8` High, `>=0.5` Medium, else Low.
    pub fn from_score(score: f64) -> Self {
        if score > 0.8 {
            ConfidenceBand::High
        } else if score >= 0.5 {
            ConfidenceBand::Medium
        } else {
            ConfidenceBand::Low
        }
    }
}

impl fmt::Display for ConfidenceBand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConfidenceBand::High => "High",
            ConfidenceBand::Medium => "Medium",
            ConfidenceBand::Low => "Low",
        };
        write!(f, "{label}")
    }
}

/// Components of the composite match score.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct ScoreBreakdown {
    /// `contributing_sources / total_sources`.
    pub coverage: f64,
    /// `exp(-time_spread / window_seconds)`.
    pub time_proximity: f64,
    /// Plurality agreement across application and file-path fields.
    pub field_similarity: f64,
    /// Interpretation label: a scoring band when weighted scoring is on,
    /// otherwise the contributor-fraction label.
    pub label: String,
}

/// Semantic annotations attached to a match by rules and mappings.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct SemanticData {
    /// Tags produced by matching semantic rule trees.
    pub tags: Vec<String>,
    /// `source_id.field` -> substituted semantic value.
    pub substitutions: BTreeMap<String, String>,
}

impl SemanticData {
    pub fn is_empty(&self) -> bool {
        self.tags.is_empty() && self.substitutions.is_empty()
    }
}

/// One correlation match: an anchor record plus the temporally-proximate
/// records drawn from other sources.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CorrelationMatch {
    pub match_id: MatchId,
    pub anchor_source_id: SourceId,
    pub anchor_artifact_type: ArtifactType,
    pub anchor_instant: DateTime<Utc>,
    /// One record per contributing source, anchor included.
    pub records: BTreeMap<SourceId, SourceRecord>,
    /// Normalized score in `[0, 1]`.
    pub match_score: f64,
    pub score_breakdown: ScoreBreakdown,
    pub confidence_score: f64,
    pub confidence_band: ConfidenceBand,
    /// Raw weighted sum when weighted scoring is enabled; may exceed 1.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weighted_score: Option<f64>,
    pub time_spread_seconds: f64,
    /// Per-field plurality agreement, e.g. `application -> 1.0`.
    #[serde(default)]
    pub field_similarity_scores: BTreeMap<String, f64>,
    pub is_duplicate: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duplicate_of: Option<MatchId>,
    #[serde(default)]
    pub semantic_data: SemanticData,
}

impl CorrelationMatch {
    /// The content identity of this match.
    pub fn match_set(&self) -> MatchSet {
        let anchor_key = self
            .records
            .get(&self.anchor_source_id)
            .map(SourceRecord::record_key)
            .unwrap_or_default();
        MatchSet::new(
            self.anchor_source_id.clone(),
            anchor_key,
            self.records
                .iter()
                .map(|(id, record)| (id.clone(), record.record_key())),
        )
    }

    /// Recomputed spread between the earliest and latest contained instant.
    pub fn computed_time_spread_seconds(&self) -> f64 {
        let instants: Vec<DateTime<Utc>> =
            self.records.values().map(|r| r.instant).collect();
        match (instants.iter().min(), instants.iter().max()) {
            (Some(min), Some(max)) => (*max - *min).num_milliseconds() as f64 / 1000.0,
            _ => 0.0,
        }
    }

    /// Number of contributing sources other than the anchor.
    pub fn non_anchor_contributors(&self) -> usize {
        self.records
            .keys()
            .filter(|id| **id != self.anchor_source_id)
            .count()
    }
}
