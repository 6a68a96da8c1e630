//! Shared fixtures for unit tests.

use std::path::PathBuf;

use corvus_model::{
    ApplyTo, ArtifactType, CorrelationRules, ScoringConfig, SourceId, SourceSpec, Wing, WingId,
};

/// A two-source wing with permissive defaults.
pub fn minimal_wing() -> Wing {
    Wing {
        wing_id: WingId::new("w-test"),
        wing_name: "test wing".to_string(),
        author: String::new(),
        created_at: None,
        description: String::new(),
        proves: String::new(),
        sources: vec![source_spec("a"), source_spec("b")],
        rules: CorrelationRules {
            window_minutes: 5,
            minimum_matches: 1,
            max_time_range_years: 10,
            apply_to: ApplyTo::All,
            target_application: None,
            target_file_path: None,
            target_event_id: None,
        },
        anchor_priority: Vec::new(),
        scoring: ScoringConfig::default(),
        semantic_rules: Vec::new(),
        semantic_mappings: Vec::new(),
    }
}

pub fn source_spec(id: &str) -> SourceSpec {
    SourceSpec {
        source_id: SourceId::from(id),
        artifact_type: ArtifactType::Prefetch,
        database_path: PathBuf::from(format!("/tmp/{id}.db")),
        weight: 1.0,
        tier: 0,
        tier_name: String::new(),
    }
}
