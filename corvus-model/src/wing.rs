use std::collections::HashSet;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use crate::artifact::ArtifactType;
use crate::error::{ModelError, Result};
use crate::ids::{SourceId, WingId};

/// One artifact database referenced by a wing.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SourceSpec {
    pub source_id: SourceId,
    pub artifact_type: ArtifactType,
    pub database_path: PathBuf,
    /// Contribution weight for weighted scoring. Defaults to 1.0.
    #[serde(default = "default_weight")]
    pub weight: f64,
    #[serde(default)]
    pub tier: u32,
    #[serde(default)]
    pub tier_name: String,
}

fn default_weight() -> f64 {
    1.0
}

/// Whether correlation rules apply to every record or only to targeted ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyTo {
    All,
    Specific,
}

impl Default for ApplyTo {
    fn default() -> Self {
        ApplyTo::All
    }
}

/// The correlation rules block of a wing document.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CorrelationRules {
    /// Width of each scan window in minutes. Must be positive.
    pub window_minutes: i64,
    /// Required number of contributing non-anchor sources per match.
    pub minimum_matches: usize,
    /// Upper bound on the detected scan span, in years.
    #[serde(default = "default_max_time_range_years")]
    pub max_time_range_years: u32,
    #[serde(default)]
    pub apply_to: ApplyTo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_application: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_file_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_event_id: Option<String>,
}

fn default_max_time_range_years() -> u32 {
    10
}

impl CorrelationRules {
    pub fn window_seconds(&self) -> i64 {
        self.window_minutes * 60
    }

    fn has_target(&self) -> bool {
        self.target_application.is_some()
            || self.target_file_path.is_some()
            || self.target_event_id.is_some()
    }
}

/// One interpretation band for weighted scoring, e.g. `{min: 2.5, label: "Strong"}`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ScoreBand {
    pub name: String,
    pub min: f64,
    pub label: String,
}

/// Scoring configuration. Disabled means simple contributor counting.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct ScoringConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Interpretation bands, kept sorted by descending `min`.
    #[serde(default)]
    pub score_interpretation: Vec<ScoreBand>,
}

impl ScoringConfig {
    /// Bands sorted by descending minimum, the order band lookup walks them.
    pub fn sorted_bands(&self) -> Vec<ScoreBand> {
        let mut bands = self.score_interpretation.clone();
        bands.sort_by(|a, b| b.min.partial_cmp(&a.min).unwrap_or(std::cmp::Ordering::Equal));
        bands
    }
}

/// A single wildcard condition inside a semantic rule.
///
/// `pattern` uses `*` (any run) and `?` (any single character); matching is
/// case-insensitive against the named record field.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SemanticCondition {
    pub field: String,
    pub pattern: String,
}

/// AND/OR tree node of a semantic rule.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SemanticNode {
    All(Vec<SemanticNode>),
    Any(Vec<SemanticNode>),
    Condition(SemanticCondition),
}

/// A semantic rule: when its tree matches a record, the tag is attached to the
/// match's semantic data.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SemanticRule {
    pub name: String,
    pub tag: String,
    pub root: SemanticNode,
}

/// Direct value substitution: (source, field, technical value) -> semantic value.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SemanticMapping {
    pub source_id: SourceId,
    pub field: String,
    pub technical_value: String,
    pub semantic_value: String,
}

/// A correlation recipe: which sources to join, under which rules, and how to
/// score and label the results.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Wing {
    pub wing_id: WingId,
    pub wing_name: String,
    #[serde(default)]
    pub author: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub description: String,
    /// What the wing is meant to demonstrate, e.g. "program execution".
    #[serde(default)]
    pub proves: String,
    pub sources: Vec<SourceSpec>,
    pub rules: CorrelationRules,
    /// Artifact types ranked from most to least preferred anchor.
    #[serde(default)]
    pub anchor_priority: Vec<ArtifactType>,
    #[serde(default)]
    pub scoring: ScoringConfig,
    #[serde(default)]
    pub semantic_rules: Vec<SemanticRule>,
    #[serde(default)]
    pub semantic_mappings: Vec<SemanticMapping>,
}

impl Wing {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }

    pub fn source(&self, id: &SourceId) -> Option<&SourceSpec> {
        self.sources.iter().find(|s| &s.source_id == id)
    }

    /// Position of an artifact type in the anchor priority list, lower is
    /// preferred. Types not listed rank after every listed type.
    pub fn anchor_rank(&self, artifact_type: &ArtifactType) -> usize {
        self.anchor_priority
            .iter()
            .position(|t| t == artifact_type)
            .unwrap_or(self.anchor_priority.len())
    }

    /// Sum of all configured source weights, used for score normalization.
    pub fn total_weight(&self) -> f64 {
        self.sources.iter().map(|s| s.weight).sum()
    }

    /// Validate the wing, collecting every problem rather than stopping at the
    /// first. An empty list means the wing is runnable.
    pub fn validation_problems(&self) -> Vec<String> {
        let mut problems = Vec::new();

        if self.wing_id.as_str().trim().is_empty() {
            problems.push("wing_id must not be empty".to_string());
        }
        if self.wing_name.trim().is_empty() {
            problems.push("wing_name must not be empty".to_string());
        }
        if self.sources.is_empty() {
            problems.push("wing must reference at least one source".to_string());
        }
        if self.rules.window_minutes <= 0 {
            problems.push(format!(
                "window_minutes must be positive, got {}",
                self.rules.window_minutes
            ));
        }
        if self.rules.minimum_matches == 0 {
            problems.push("minimum_matches must be at least 1".to_string());
        }
        if !self.sources.is_empty() && self.rules.minimum_matches > self.sources.len() - 1 {
            problems.push(format!(
                "minimum_matches ({}) exceeds the number of non-anchor sources ({})",
                self.rules.minimum_matches,
                self.sources.len().saturating_sub(1)
            ));
        }
        if self.rules.max_time_range_years == 0 {
            problems.push("max_time_range_years must be positive".to_string());
        }
        if self.rules.apply_to == ApplyTo::Specific && !self.rules.has_target() {
            problems.push(
                "apply_to is 'specific' but no target application, file path, or event id is set"
                    .to_string(),
            );
        }

        let mut seen = HashSet::new();
        for spec in &self.sources {
            if !seen.insert(&spec.source_id) {
                problems.push(format!("duplicate source id: {}", spec.source_id));
            }
            if spec.database_path.as_os_str().is_empty() {
                problems.push(format!("source {} has an empty database path", spec.source_id));
            }
            if !(0.0..=1.0).contains(&spec.weight) {
                problems.push(format!(
                    "source {} weight {} is outside [0, 1]",
                    spec.source_id, spec.weight
                ));
            }
        }

        problems
    }

    /// Validate, turning any problems into an error.
    pub fn validate(&self) -> Result<()> {
        let problems = self.validation_problems();
        if problems.is_empty() {
            Ok(())
        } else {
            Err(ModelError::InvalidWing(problems))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(id: &str, artifact: ArtifactType) -> SourceSpec {
        SourceSpec {
            source_id: SourceId::from(id),
            artifact_type: artifact,
            database_path: PathBuf::from(format!("/tmp/{id}.db")),
            weight: 1.0,
            tier: 0,
            tier_name: String::new(),
        }
    }

    fn minimal_wing() -> Wing {
        Wing {
            wing_id: WingId::new("w-exec"),
            wing_name: "Execution proof".to_string(),
            author: String::new(),
            created_at: None,
            description: String::new(),
            proves: String::new(),
            sources: vec![
                source("prefetch", ArtifactType::Prefetch),
                source("shimcache", ArtifactType::ShimCache),
            ],
            rules: CorrelationRules {
                window_minutes: 5,
                minimum_matches: 1,
                max_time_range_years: 10,
                apply_to: ApplyTo::All,
                target_application: None,
                target_file_path: None,
                target_event_id: None,
            },
            anchor_priority: vec![ArtifactType::Prefetch, ArtifactType::ShimCache],
            scoring: ScoringConfig::default(),
            semantic_rules: Vec::new(),
            semantic_mappings: Vec::new(),
        }
    }

    #[test]
    fn valid_wing_passes() {
        assert!(minimal_wing().validation_problems().is_empty());
    }

    #[test]
    fn zero_window_and_high_threshold_are_reported_together() {
        let mut wing = minimal_wing();
        wing.rules.window_minutes = 0;
        wing.rules.minimum_matches = 5;
        let problems = wing.validation_problems();
        assert_eq!(problems.len(), 2, "{problems:?}");
    }

    #[test]
    fn duplicate_source_ids_are_rejected() {
        let mut wing = minimal_wing();
        wing.sources.push(source("prefetch", ArtifactType::Prefetch));
        let problems = wing.validation_problems();
        assert!(problems.iter().any(|p| p.contains("duplicate source id")));
    }

    #[test]
    fn anchor_rank_prefers_listed_types() {
        let wing = minimal_wing();
        assert_eq!(wing.anchor_rank(&ArtifactType::Prefetch), 0);
        assert_eq!(wing.anchor_rank(&ArtifactType::ShimCache), 1);
        assert_eq!(wing.anchor_rank(&ArtifactType::Mft), 2);
    }

    #[test]
    fn json_round_trip_preserves_rules() {
        let wing = minimal_wing();
        let json = wing.to_json().unwrap();
        let back = Wing::from_json(&json).unwrap();
        assert_eq!(back.wing_id, wing.wing_id);
        assert_eq!(back.rules.window_minutes, 5);
        assert_eq!(back.sources.len(), 2);
    }

    #[test]
    fn sorted_bands_descend_by_min() {
        let scoring = ScoringConfig {
            enabled: true,
            score_interpretation: vec![
                ScoreBand {
                    name: "weak".into(),
                    min: 0.5,
                    label: "Weak".into(),
                },
                ScoreBand {
                    name: "strong".into(),
                    min: 2.0,
                    label: "Strong".into(),
                },
            ],
        };
        let bands = scoring.sorted_bands();
        assert_eq!(bands[0].label, "Strong");
        assert_eq!(bands[1].label, "Weak");
    }
}
