//! Run-scoped persistence.
//!
//! Phase 1 preserves every sufficient window's organized record lists in a
//! correlation database created beside the case; Phase 2 replays them from
//! there. Matches only hit disk through the streaming store when memory
//! pressure demands it.

pub mod streaming;

use std::path::Path;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use tracing::debug;

use corvus_model::{SourceId, SourceRecord, TimeWindow, WindowId};

use crate::error::Result;

/// Phase-1 window persistence: one row per (window, source, record).
#[derive(Debug, Clone)]
pub struct WindowStore {
    pool: SqlitePool,
}

impl WindowStore {
    /// Open (or create) the correlation database at `path`.
    pub async fn open(path: &Path) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS window_records (
                window_id INTEGER NOT NULL,
                start_ts TEXT NOT NULL,
                end_ts TEXT NOT NULL,
                source_id TEXT NOT NULL,
                payload TEXT NOT NULL
            )",
        )
        .execute(&pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_window_records_window
             ON window_records (window_id)",
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }

    /// Bulk-write a populated window. One transaction per window keeps the
    /// write path cheap at window completion.
    pub async fn save_window(&self, window: &TimeWindow) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let start = window.start.to_rfc3339();
        let end = window.end.to_rfc3339();
        for (source_id, records) in &window.records_by_source {
            for record in records {
                let payload = serde_json::to_string(record)?;
                sqlx::query(
                    "INSERT INTO window_records (window_id, start_ts, end_ts, source_id, payload)
                     VALUES (?, ?, ?, ?, ?)",
                )
                .bind(window.window_id.as_i64())
                .bind(&start)
                .bind(&end)
                .bind(source_id.as_str())
                .bind(payload)
                .execute(&mut *tx)
                .await?;
            }
        }
        tx.commit().await?;
        debug!(
            window = %window.window_id,
            records = window.total_records(),
            "persisted window records"
        );
        Ok(())
    }

    /// Distinct persisted window ids in ascending order.
    pub async fn window_ids(&self) -> Result<Vec<WindowId>> {
        let ids: Vec<i64> = sqlx::query_scalar(
            "SELECT DISTINCT window_id FROM window_records ORDER BY window_id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(ids.into_iter().map(|id| WindowId(id as u64)).collect())
    }

    /// Reload one persisted window, or `None` when it was never saved.
    pub async fn load_window(&self, window_id: WindowId) -> Result<Option<TimeWindow>> {
        let rows = sqlx::query(
            "SELECT start_ts, end_ts, source_id, payload
             FROM window_records WHERE window_id = ?",
        )
        .bind(window_id.as_i64())
        .fetch_all(&self.pool)
        .await?;

        let Some(first) = rows.first() else {
            return Ok(None);
        };
        let start: String = first.try_get("start_ts")?;
        let end: String = first.try_get("end_ts")?;
        let start = parse_rfc3339(&start)?;
        let end = parse_rfc3339(&end)?;

        let mut window = TimeWindow::new(window_id, start, end);
        for row in &rows {
            let source_id: String = row.try_get("source_id")?;
            let payload: String = row.try_get("payload")?;
            let record: SourceRecord = serde_json::from_str(&payload)?;
            window
                .records_by_source
                .entry(SourceId::from(source_id))
                .or_default()
                .push(record);
        }
        Ok(Some(window))
    }

    pub async fn window_count(&self) -> Result<u64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(DISTINCT window_id) FROM window_records")
                .fetch_one(&self.pool)
                .await?;
        Ok(count.max(0) as u64)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn parse_rfc3339(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| crate::error::EngineError::Internal(format!("bad stored timestamp: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::Map;

    fn record(source: &str, rowid: i64, instant: DateTime<Utc>) -> SourceRecord {
        SourceRecord {
            source_id: SourceId::from(source),
            rowid: Some(rowid),
            fields: Map::new(),
            instant,
            raw_timestamp: serde_json::Value::String(instant.to_rfc3339()),
        }
    }

    #[tokio::test]
    async fn windows_round_trip_through_the_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = WindowStore::open(&dir.path().join("correlation.db"))
            .await
            .unwrap();

        let start = Utc.with_ymd_and_hms(2024, 10, 1, 10, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2024, 10, 1, 10, 5, 0).unwrap();
        let mut window = TimeWindow::new(WindowId(7), start, end);
        window.records_by_source.insert(
            SourceId::from("prefetch"),
            vec![record("prefetch", 1, start)],
        );
        window.records_by_source.insert(
            SourceId::from("logs"),
            vec![record("logs", 9, end), record("logs", 10, end)],
        );

        store.save_window(&window).await.unwrap();

        assert_eq!(store.window_ids().await.unwrap(), vec![WindowId(7)]);
        assert_eq!(store.window_count().await.unwrap(), 1);

        let loaded = store.load_window(WindowId(7)).await.unwrap().unwrap();
        assert_eq!(loaded.start, start);
        assert_eq!(loaded.end, end);
        assert_eq!(loaded.total_records(), 3);
        assert_eq!(
            loaded.records_by_source[&SourceId::from("logs")].len(),
            2
        );

        assert!(store.load_window(WindowId(99)).await.unwrap().is_none());
        store.close().await;
    }
}
