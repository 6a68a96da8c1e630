//! Core data model definitions shared across Corvus crates.
#![allow(missing_docs)]

pub mod artifact;
pub mod config;
pub mod error;
pub mod ids;
pub mod matches;
pub mod record;
pub mod result;
pub mod window;
pub mod wing;

// Intentionally curated re-exports for downstream consumers.
pub use artifact::ArtifactType;
pub use config::ScanConfig;
pub use error::{ModelError, Result as ModelResult};
pub use ids::{MatchId, SourceId, WindowId, WingId};
pub use matches::{
    ConfidenceBand, CorrelationMatch, MatchSet, ScoreBreakdown, SemanticData,
};
pub use record::SourceRecord;
pub use result::{
    CorrelationResult, FilterStatistics, PerformanceMetrics, Phase2Statistics,
};
pub use window::TimeWindow;
pub use wing::{
    ApplyTo, CorrelationRules, ScoreBand, ScoringConfig, SemanticCondition,
    SemanticMapping, SemanticNode, SemanticRule, SourceSpec, Wing,
};
