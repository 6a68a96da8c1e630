//! Fixture helpers shared by the integration tests.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};

use corvus_model::{
    ApplyTo, ArtifactType, CorrelationRules, ScanConfig, ScoringConfig, SourceId, SourceSpec,
    Wing, WingId,
};

/// Create an artifact database with `(application, timestamp)` rows.
pub async fn source_db(path: &Path, timestamp_column: &str, rows: &[(&str, &str)]) {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .expect("fixture pool");
    sqlx::query(&format!(
        "CREATE TABLE artifacts (application TEXT, {timestamp_column} TEXT)"
    ))
    .execute(&pool)
    .await
    .expect("create table");
    for (application, timestamp) in rows {
        sqlx::query("INSERT INTO artifacts VALUES (?, ?)")
            .bind(application)
            .bind(timestamp)
            .execute(&pool)
            .await
            .expect("insert row");
    }
    pool.close().await;
}

/// Build a wing over sources already created under `dir` as `<id>.db`.
pub fn wing_for(
    dir: &Path,
    source_ids: &[&str],
    window_minutes: i64,
    minimum_matches: usize,
) -> Wing {
    Wing {
        wing_id: WingId::new("w-test"),
        wing_name: "integration test wing".to_string(),
        author: "tests".to_string(),
        created_at: None,
        description: String::new(),
        proves: "temporal proximity".to_string(),
        sources: source_ids
            .iter()
            .map(|id| SourceSpec {
                source_id: SourceId::from(*id),
                artifact_type: ArtifactType::Prefetch,
                database_path: dir.join(format!("{id}.db")),
                weight: 1.0,
                tier: 0,
                tier_name: String::new(),
            })
            .collect(),
        rules: CorrelationRules {
            window_minutes,
            minimum_matches,
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

/// Sequential-mode scan config matched to the wing's rules.
pub fn config_for(wing: &Wing) -> ScanConfig {
    ScanConfig::default().adapted_to_wing(wing)
}

/// No path overrides: wings in these tests carry real paths.
pub fn no_overrides() -> BTreeMap<SourceId, PathBuf> {
    BTreeMap::new()
}
