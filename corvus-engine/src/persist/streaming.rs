//! Streaming match store, activated under memory pressure.
//!
//! An append-only batched writer keeps full match records on disk instead of
//! in memory. Writes are idempotent per match id, so a rerun only restarts
//! whatever batch had not committed.

use std::path::Path;

use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use tokio::sync::Mutex;
use tracing::{debug, info};

use corvus_model::{ConfidenceBand, CorrelationMatch, CorrelationResult, Wing};

use crate::error::{EngineError, Result};

/// Matches buffered before a flush.
const BATCH_SIZE: usize = 1000;

/// Disk-backed match persistence with batched writes.
pub struct StreamingMatchStore {
    pool: SqlitePool,
    result_id: i64,
    execution_id: String,
    batch: Mutex<Vec<CorrelationMatch>>,
    batch_size: usize,
}

impl std::fmt::Debug for StreamingMatchStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingMatchStore")
            .field("result_id", &self.result_id)
            .field("execution_id", &self.execution_id)
            .finish()
    }
}

impl StreamingMatchStore {
    /// Open the store and register an execution header for this run.
    pub async fn open(path: &Path, wing: &Wing) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new()
            .max_connections(2)
            .connect_with(options)
            .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS result (
                result_id INTEGER PRIMARY KEY AUTOINCREMENT,
                execution_id TEXT NOT NULL,
                wing_id TEXT NOT NULL,
                wing_name TEXT NOT NULL,
                feathers_processed INTEGER NOT NULL DEFAULT 0,
                total_records_scanned INTEGER NOT NULL DEFAULT 0,
                duplicates_prevented INTEGER NOT NULL DEFAULT 0,
                execution_duration_seconds REAL NOT NULL DEFAULT 0,
                completed_at TEXT
            )",
        )
        .execute(&pool)
        .await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS \"match\" (
                match_id TEXT PRIMARY KEY,
                result_id INTEGER NOT NULL,
                anchor_source_id TEXT NOT NULL,
                anchor_instant TEXT NOT NULL,
                match_score REAL NOT NULL,
                confidence_score REAL NOT NULL,
                confidence_band TEXT NOT NULL,
                is_duplicate INTEGER NOT NULL,
                duplicate_of TEXT,
                payload_blob TEXT NOT NULL
            )",
        )
        .execute(&pool)
        .await?;

        let execution_id = uuid::Uuid::new_v4().to_string();
        let result_id: i64 = sqlx::query_scalar(
            "INSERT INTO result (execution_id, wing_id, wing_name) VALUES (?, ?, ?)
             RETURNING result_id",
        )
        .bind(&execution_id)
        .bind(wing.wing_id.as_str())
        .bind(&wing.wing_name)
        .fetch_one(&pool)
        .await?;

        info!(result_id, execution_id = %execution_id, "streaming match store opened");
        Ok(Self {
            pool,
            result_id,
            execution_id,
            batch: Mutex::new(Vec::new()),
            batch_size: BATCH_SIZE,
        })
    }

    pub fn result_id(&self) -> i64 {
        self.result_id
    }

    /// Buffer a match; flushes automatically when the batch fills.
    pub async fn write_match(&self, m: &CorrelationMatch) -> Result<()> {
        let should_flush = {
            let mut batch = self.batch.lock().await;
            batch.push(m.clone());
            batch.len() >= self.batch_size
        };
        if should_flush {
            self.flush().await?;
        }
        Ok(())
    }

    /// Commit the buffered batch. Idempotent per match id.
    pub async fn flush(&self) -> Result<()> {
        let drained: Vec<CorrelationMatch> = {
            let mut batch = self.batch.lock().await;
            std::mem::take(&mut *batch)
        };
        if drained.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for m in &drained {
            let payload = serde_json::to_string(&m.records)?;
            sqlx::query(
                "INSERT OR REPLACE INTO \"match\" (
                    match_id, result_id, anchor_source_id, anchor_instant, match_score,
                    confidence_score, confidence_band, is_duplicate, duplicate_of, payload_blob
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(m.match_id.to_string())
            .bind(self.result_id)
            .bind(m.anchor_source_id.as_str())
            .bind(m.anchor_instant.to_rfc3339())
            .bind(m.match_score)
            .bind(m.confidence_score)
            .bind(m.confidence_band.to_string())
            .bind(m.is_duplicate)
            .bind(m.duplicate_of.map(|id| id.to_string()))
            .bind(payload)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        debug!(matches = drained.len(), "flushed streaming match batch");
        Ok(())
    }

    /// Flush outstanding matches and stamp the execution header.
    pub async fn finalize(&self, result: &CorrelationResult) -> Result<()> {
        self.flush().await?;
        sqlx::query(
            "UPDATE result SET feathers_processed = ?, total_records_scanned = ?,
                 duplicates_prevented = ?, execution_duration_seconds = ?, completed_at = ?
             WHERE result_id = ?",
        )
        .bind(result.sources_processed as i64)
        .bind(result.total_records_scanned as i64)
        .bind(result.duplicates_prevented as i64)
        .bind(result.execution_duration_seconds)
        .bind(Utc::now().to_rfc3339())
        .bind(self.result_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Count of persisted matches for this execution.
    pub async fn match_count(&self) -> Result<u64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM \"match\" WHERE result_id = ?")
                .bind(self.result_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count.max(0) as u64)
    }

    /// Reload persisted matches (id, score, band, duplicate flag, records).
    /// Used for verification and result assembly after a streamed run.
    pub async fn load_matches(&self) -> Result<Vec<StoredMatch>> {
        let rows = sqlx::query(
            "SELECT match_id, anchor_source_id, anchor_instant, match_score, confidence_score,
                    confidence_band, is_duplicate, duplicate_of, payload_blob
             FROM \"match\" WHERE result_id = ? ORDER BY anchor_instant",
        )
        .bind(self.result_id)
        .fetch_all(&self.pool)
        .await?;

        let mut matches = Vec::with_capacity(rows.len());
        for row in rows {
            let band: String = row.try_get("confidence_band")?;
            matches.push(StoredMatch {
                match_id: row.try_get("match_id")?,
                anchor_source_id: row.try_get("anchor_source_id")?,
                anchor_instant: row.try_get("anchor_instant")?,
                match_score: row.try_get("match_score")?,
                confidence_score: row.try_get("confidence_score")?,
                confidence_band: parse_band(&band)?,
                is_duplicate: row.try_get("is_duplicate")?,
                duplicate_of: row.try_get("duplicate_of")?,
                payload_blob: row.try_get("payload_blob")?,
            });
        }
        Ok(matches)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// One match row as stored on disk.
#[derive(Debug, Clone)]
pub struct StoredMatch {
    pub match_id: String,
    pub anchor_source_id: String,
    pub anchor_instant: String,
    pub match_score: f64,
    pub confidence_score: f64,
    pub confidence_band: ConfidenceBand,
    pub is_duplicate: bool,
    pub duplicate_of: Option<String>,
    pub payload_blob: String,
}

fn parse_band(raw: &str) -> Result<ConfidenceBand> {
    match raw {
        "High" => Ok(ConfidenceBand::High),
        "Medium" => Ok(ConfidenceBand::Medium),
        "Low" => Ok(ConfidenceBand::Low),
        other => Err(EngineError::Internal(format!(
            "unknown confidence band in store: {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use corvus_model::{
        ArtifactType, CorrelationRules, MatchId, ScoringConfig, SourceId, SourceRecord, WingId,
    };
    use std::collections::BTreeMap;

    fn test_wing() -> Wing {
        Wing {
            wing_id: WingId::new("w-test"),
            wing_name: "test".to_string(),
            author: String::new(),
            created_at: None,
            description: String::new(),
            proves: String::new(),
            sources: Vec::new(),
            rules: CorrelationRules {
                window_minutes: 5,
                minimum_matches: 1,
                max_time_range_years: 10,
                apply_to: corvus_model::ApplyTo::All,
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

    fn test_match(score: f64) -> CorrelationMatch {
        let instant = Utc.with_ymd_and_hms(2024, 10, 1, 10, 0, 0).unwrap();
        let mut records = BTreeMap::new();
        records.insert(
            SourceId::from("prefetch"),
            SourceRecord {
                source_id: SourceId::from("prefetch"),
                rowid: Some(1),
                fields: serde_json::Map::new(),
                instant,
                raw_timestamp: serde_json::Value::Null,
            },
        );
        CorrelationMatch {
            match_id: MatchId::new(),
            anchor_source_id: SourceId::from("prefetch"),
            anchor_artifact_type: ArtifactType::Prefetch,
            anchor_instant: instant,
            records,
            match_score: score,
            score_breakdown: Default::default(),
            confidence_score: 0.9,
            confidence_band: ConfidenceBand::High,
            weighted_score: None,
            time_spread_seconds: 0.0,
            field_similarity_scores: BTreeMap::new(),
            is_duplicate: false,
            duplicate_of: None,
            semantic_data: Default::default(),
        }
    }

    #[tokio::test]
    async fn matches_survive_write_flush_reload() {
        let dir = tempfile::tempdir().unwrap();
        let store = StreamingMatchStore::open(&dir.path().join("matches.db"), &test_wing())
            .await
            .unwrap();

        let a = test_match(0.8);
        let b = test_match(0.6);
        store.write_match(&a).await.unwrap();
        store.write_match(&b).await.unwrap();
        assert_eq!(store.match_count().await.unwrap(), 0, "not yet flushed");

        store.flush().await.unwrap();
        assert_eq!(store.match_count().await.unwrap(), 2);

        let loaded = store.load_matches().await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert!(loaded.iter().any(|m| m.match_id == a.match_id.to_string()));
        store.close().await;
    }

    #[tokio::test]
    async fn rewrites_are_idempotent_per_match_id() {
        let dir = tempfile::tempdir().unwrap();
        let store = StreamingMatchStore::open(&dir.path().join("matches.db"), &test_wing())
            .await
            .unwrap();

        let m = test_match(0.8);
        store.write_match(&m).await.unwrap();
        store.flush().await.unwrap();
        store.write_match(&m).await.unwrap();
        store.flush().await.unwrap();

        assert_eq!(store.match_count().await.unwrap(), 1);
        store.close().await;
    }

    #[tokio::test]
    async fn finalize_stamps_the_execution_header() {
        let dir = tempfile::tempdir().unwrap();
        let store = StreamingMatchStore::open(&dir.path().join("matches.db"), &test_wing())
            .await
            .unwrap();

        let mut result = CorrelationResult::new(WingId::new("w-test"), "test");
        result.sources_processed = 2;
        result.total_records_scanned = 500;
        result.duplicates_prevented = 3;
        result.execution_duration_seconds = 1.25;
        store.finalize(&result).await.unwrap();

        let completed: Option<String> =
            sqlx::query_scalar("SELECT completed_at FROM result WHERE result_id = ?")
                .bind(store.result_id())
                .fetch_one(&store.pool)
                .await
                .unwrap();
        assert!(completed.is_some());
        store.close().await;
    }
}
