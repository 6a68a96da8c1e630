//! Per-source query layer over sealed artifact databases.
//!
//! One [`SourceQuery`] is constructed per source referenced by a wing. On open
//! it applies read-tuning pragmas, picks the primary table, detects the
//! timestamp column and its encoding, and makes sure that column is indexed.
//! All range operations run through the retry shell and degrade to empty
//! results (marking the source unhealthy) once retries are exhausted.

pub mod retry;

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Column, Row, SqlitePool, TypeInfo, ValueRef};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use corvus_model::record::EXPANDED_ARRAY_FIELD;
use corvus_model::{ArtifactType, SourceId, SourceRecord, SourceSpec};

use crate::error::{EngineError, Result};
use crate::timestamp::{TimestampFormat, TimestampParser};
use retry::{RetryPolicy, with_retry};

/// Sidecar table a source may carry to declare its artifact type.
const METADATA_TABLE: &str = "feather_metadata";
/// Cached `(start, end)` range queries per source.
const QUERY_CACHE_CAPACITY: usize = 100;
/// Rows sampled for timestamp detection.
const DETECTION_SAMPLE_ROWS: u32 = 100;
/// Ranges whose gap is at most this many seconds batch into one query.
const BATCH_GAP_SECONDS: i64 = 1;

/// Bind a range bound in its native storage class. Text bounds must reach
/// SQLite as TEXT and numeric bounds as INTEGER, or the comparison against
/// the indexed column silently matches nothing.
macro_rules! bind_json_value {
    ($query:expr, $value:expr) => {
        match $value {
            Value::Number(n) if n.is_i64() => $query.bind(n.as_i64()),
            Value::Number(n) => $query.bind(n.as_f64()),
            Value::String(s) => $query.bind(s.as_str()),
            other => $query.bind(other.to_string()),
        }
    };
}

/// Hit/miss counters for the per-source range-query cache.
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct QueryCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

/// Health snapshot of a source.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SourceHealth {
    pub source_id: SourceId,
    pub healthy: bool,
    pub error_count: u64,
}

struct RangeQueryCache {
    entries: HashMap<(i64, i64), Vec<SourceRecord>>,
    order: VecDeque<(i64, i64)>,
    capacity: usize,
    hits: u64,
    misses: u64,
}

impl RangeQueryCache {
    fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            capacity,
            hits: 0,
            misses: 0,
        }
    }

    fn get(&mut self, key: (i64, i64)) -> Option<Vec<SourceRecord>> {
        match self.entries.get(&key) {
            Some(records) => {
                self.hits += 1;
                self.order.retain(|k| *k != key);
                self.order.push_back(key);
                Some(records.clone())
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    fn insert(&mut self, key: (i64, i64), records: Vec<SourceRecord>) {
        if self.entries.contains_key(&key) {
            self.order.retain(|k| *k != key);
        } else if self.entries.len() >= self.capacity
            && let Some(evicted) = self.order.pop_front()
        {
            self.entries.remove(&evicted);
        }
        self.entries.insert(key, records);
        self.order.push_back(key);
    }

    fn stats(&self) -> QueryCacheStats {
        QueryCacheStats {
            hits: self.hits,
            misses: self.misses,
            entries: self.entries.len(),
        }
    }
}

/// Indexed time-range access to one artifact database.
pub struct SourceQuery {
    spec: SourceSpec,
    pool: SqlitePool,
    parser: TimestampParser,
    policy: RetryPolicy,
    table: String,
    timestamp_column: String,
    format: TimestampFormat,
    has_rowid: bool,
    has_arrays: bool,
    artifact_type: ArtifactType,
    range_cache: Mutex<Option<Option<(DateTime<Utc>, DateTime<Utc>)>>>,
    query_cache: Mutex<RangeQueryCache>,
    healthy: AtomicBool,
    error_count: AtomicU64,
}

impl std::fmt::Debug for SourceQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceQuery")
            .field("source_id", &self.spec.source_id)
            .field("table", &self.table)
            .field("timestamp_column", &self.timestamp_column)
            .field("format", &self.format)
            .field("healthy", &self.healthy.load(Ordering::Relaxed))
            .finish()
    }
}

impl SourceQuery {
    /// Open a source database and prepare it for range queries.
    pub async fn open(spec: SourceSpec) -> Result<Self> {
        let path = spec.database_path.clone();
        if !path.exists() {
            return Err(EngineError::SourceUnavailable {
                source_id: spec.source_id.to_string(),
                reason: format!("database file {} does not exist", path.display()),
            });
        }

        let options = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(false)
            .journal_mode(SqliteJournalMode::Wal)
            .pragma("cache_size", "-65536")
            .pragma("temp_store", "MEMORY");
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        let table = primary_table(&pool).await?.ok_or_else(|| {
            EngineError::SourceUnavailable {
                source_id: spec.source_id.to_string(),
                reason: "no data table found".to_string(),
            }
        })?;

        let artifact_type = sidecar_artifact_type(&pool)
            .await
            .unwrap_or_else(|| spec.artifact_type.clone());

        let parser = TimestampParser::new();
        let sample = sample_rows(&pool, &table, DETECTION_SAMPLE_ROWS).await?;
        let candidates = parser.find_timestamp_columns(&sample);
        let Some(best) = candidates.first() else {
            return Err(EngineError::NoTimestampColumn(spec.source_id.to_string()));
        };
        info!(
            source = %spec.source_id,
            table = %table,
            column = %best.column,
            format = ?best.format,
            success_rate = best.success_rate,
            "detected timestamp column"
        );

        let timestamp_column = best.column.clone();
        let format = best.format;

        // Multi-timestamp columns (Prefetch run-time arrays) defeat plain
        // range comparison; remember whether the sample carried any so the
        // query predicate can sweep them in for post-filtering.
        let has_arrays = sample.iter().any(|row| {
            row.get(&timestamp_column).is_some_and(|value| {
                value.is_array()
                    || matches!(value, Value::String(s) if s.trim_start().starts_with('['))
            })
        });

        ensure_timestamp_index(&pool, &table, &timestamp_column).await;
        let has_rowid = table_has_rowid(&pool, &table).await;

        Ok(Self {
            spec,
            pool,
            parser,
            policy: RetryPolicy::default(),
            table,
            timestamp_column,
            format,
            has_rowid,
            has_arrays,
            artifact_type,
            range_cache: Mutex::new(None),
            query_cache: Mutex::new(RangeQueryCache::new(QUERY_CACHE_CAPACITY)),
            healthy: AtomicBool::new(true),
            error_count: AtomicU64::new(0),
        })
    }

    pub fn source_id(&self) -> &SourceId {
        &self.spec.source_id
    }

    pub fn spec(&self) -> &SourceSpec {
        &self.spec
    }

    pub fn artifact_type(&self) -> &ArtifactType {
        &self.artifact_type
    }

    pub fn timestamp_column(&self) -> &str {
        &self.timestamp_column
    }

    pub fn health(&self) -> SourceHealth {
        SourceHealth {
            source_id: self.spec.source_id.clone(),
            healthy: self.healthy.load(Ordering::Relaxed),
            error_count: self.error_count.load(Ordering::Relaxed),
        }
    }

    pub async fn cache_stats(&self) -> QueryCacheStats {
        self.query_cache.lock().await.stats()
    }

    /// Smallest and largest timestamp in the source, cached for the lifetime
    /// of the query object. `None` when the table has no parseable instants.
    pub async fn timestamp_range(&self) -> Result<Option<(DateTime<Utc>, DateTime<Utc>)>> {
        {
            let cache = self.range_cache.lock().await;
            if let Some(cached) = *cache {
                return Ok(cached);
            }
        }

        let sql = format!(
            "SELECT MIN({col}) AS min_ts, MAX({col}) AS max_ts FROM {table}",
            col = quote_ident(&self.timestamp_column),
            table = quote_ident(&self.table),
        );
        let row = with_retry(
            &self.policy,
            self.spec.source_id.as_str(),
            "timestamp_range",
            || async {
                sqlx::query(&sql)
                    .fetch_one(&self.pool)
                    .await
                    .map_err(EngineError::from)
            },
        )
        .await
        .inspect_err(|_| self.mark_unhealthy())?;

        let min_value = raw_column_value(&row, 0);
        let max_value = raw_column_value(&row, 1);
        let min = self.parser.parse_all(&min_value).into_iter().min();
        let max = self.parser.parse_all(&max_value).into_iter().max();

        let range = match (min, max) {
            (Some(min), Some(max)) => Some((min, max)),
            _ => None,
        };
        *self.range_cache.lock().await = Some(range);
        Ok(range)
    }

    /// Indexed range scan over `[start, end]`, both ends inclusive. Records
    /// come back ordered by timestamp and already array-expanded; each logical
    /// record's instant is guaranteed to fall inside the range. Failures after
    /// retries degrade to an empty list and mark the source unhealthy.
    pub async fn query_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Vec<SourceRecord> {
        let key = cache_key(start, end);
        if let Some(cached) = self.query_cache.lock().await.get(key) {
            return cached;
        }

        match self.query_range_uncached(start, end).await {
            Ok(records) => {
                self.query_cache.lock().await.insert(key, records.clone());
                records
            }
            Err(err) => {
                warn!(
                    source = %self.spec.source_id,
                    error = %err,
                    "range query failed, returning empty result"
                );
                self.mark_unhealthy();
                Vec::new()
            }
        }
    }

    async fn query_range_uncached(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<SourceRecord>> {
        let projection = if self.has_rowid {
            "rowid AS __corvus_rowid, *"
        } else {
            "*"
        };
        let select = format!(
            "SELECT {projection} FROM {table} WHERE {predicate} ORDER BY {col}",
            table = quote_ident(&self.table),
            predicate = self.range_predicate(),
            col = quote_ident(&self.timestamp_column),
        );

        let low = self.format.encode_bound(start);
        let high = self.format.encode_bound(end);

        let rows = with_retry(
            &self.policy,
            self.spec.source_id.as_str(),
            "query_range",
            || async {
                let query = sqlx::query(&select);
                let query = bind_json_value!(query, &low);
                let query = bind_json_value!(query, &high);
                query
                    .fetch_all(&self.pool)
                    .await
                    .map_err(EngineError::from)
            },
        )
        .await?;

        let mut records = Vec::new();
        for row in &rows {
            self.expand_row(row, start, end, &mut records);
        }
        // Array expansion can interleave instants across rows; keep the
        // ordered-by-timestamp contract after the fact.
        records.sort_by(|a, b| {
            a.instant
                .cmp(&b.instant)
                .then_with(|| a.rowid.cmp(&b.rowid))
        });
        Ok(records)
    }

    /// Range predicate for the timestamp column. Array-bearing columns sweep
    /// in every array row; expansion post-filters to the exact range.
    fn range_predicate(&self) -> String {
        let col = quote_ident(&self.timestamp_column);
        if self.has_arrays {
            format!("(({col} >= ? AND {col} <= ?) OR substr({col}, 1, 1) = '[')")
        } else {
            format!("{col} >= ? AND {col} <= ?")
        }
    }

    /// Indexed `COUNT(*)` over `[start, end]`, used by the quick empty check.
    pub async fn count_in_range(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<u64> {
        let sql = format!(
            "SELECT COUNT(*) FROM {table} WHERE {predicate}",
            table = quote_ident(&self.table),
            predicate = self.range_predicate(),
        );
        let low = self.format.encode_bound(start);
        let high = self.format.encode_bound(end);

        let count: i64 = with_retry(
            &self.policy,
            self.spec.source_id.as_str(),
            "count_in_range",
            || async {
                let query = sqlx::query_scalar(&sql);
                let query = bind_json_value!(query, &low);
                let query = bind_json_value!(query, &high);
                query
                    .fetch_one(&self.pool)
                    .await
                    .map_err(EngineError::from)
            },
        )
        .await
        .inspect_err(|_| self.mark_unhealthy())?;

        Ok(count.max(0) as u64)
    }

    /// Query several ranges at once. Consecutive ranges (gap at most one
    /// second) are fetched with a single spanning query and partitioned
    /// locally; anything else falls back to per-range queries.
    pub async fn batch_query(
        &self,
        ranges: &[(DateTime<Utc>, DateTime<Utc>)],
    ) -> Vec<Vec<SourceRecord>> {
        if ranges.len() > 1 && ranges_are_consecutive(ranges) {
            let span_start = ranges[0].0;
            let span_end = ranges[ranges.len() - 1].1;
            debug!(
                source = %self.spec.source_id,
                ranges = ranges.len(),
                "batching consecutive ranges into one spanning query"
            );
            let all = self.query_range(span_start, span_end).await;
            return ranges
                .iter()
                .map(|(start, end)| {
                    all.iter()
                        .filter(|r| r.instant >= *start && r.instant <= *end)
                        .cloned()
                        .collect()
                })
                .collect();
        }

        let mut results = Vec::with_capacity(ranges.len());
        for (start, end) in ranges {
            results.push(self.query_range(*start, *end).await);
        }
        results
    }

    /// Drop cached query results, e.g. as a memory-recovery action.
    pub async fn clear_query_cache(&self) {
        let mut cache = self.query_cache.lock().await;
        let stats = cache.stats();
        *cache = RangeQueryCache::new(QUERY_CACHE_CAPACITY);
        cache.hits = stats.hits;
        cache.misses = stats.misses;
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    fn mark_unhealthy(&self) {
        self.error_count.fetch_add(1, Ordering::Relaxed);
        self.healthy.store(false, Ordering::Relaxed);
    }

    /// Turn one physical row into logical records, one per timestamp array
    /// element, keeping only instants inside `[start, end]`.
    fn expand_row(
        &self,
        row: &SqliteRow,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        out: &mut Vec<SourceRecord>,
    ) {
        let mut fields = row_to_map(row);
        let rowid = fields
            .remove("__corvus_rowid")
            .and_then(|v| v.as_i64());

        let Some(raw_timestamp) = fields.get(&self.timestamp_column).cloned() else {
            return;
        };
        let instants = self.parser.parse_all(&raw_timestamp);
        if instants.is_empty() {
            debug!(
                source = %self.spec.source_id,
                value = %raw_timestamp,
                "skipping record with unparseable timestamp"
            );
            return;
        }

        let is_array = raw_timestamp.is_array()
            || matches!(&raw_timestamp, Value::String(s) if s.trim_start().starts_with('['));
        if is_array {
            fields.insert(EXPANDED_ARRAY_FIELD.to_string(), raw_timestamp.clone());
        }

        for instant in instants {
            if instant < start || instant > end {
                continue;
            }
            out.push(SourceRecord {
                source_id: self.spec.source_id.clone(),
                rowid,
                fields: fields.clone(),
                instant,
                raw_timestamp: raw_timestamp.clone(),
            });
        }
    }
}

fn cache_key(start: DateTime<Utc>, end: DateTime<Utc>) -> (i64, i64) {
    (start.timestamp_millis(), end.timestamp_millis())
}

fn ranges_are_consecutive(ranges: &[(DateTime<Utc>, DateTime<Utc>)]) -> bool {
    ranges.windows(2).all(|pair| {
        let gap = pair[1].0 - pair[0].1;
        gap >= chrono::Duration::zero() && gap <= chrono::Duration::seconds(BATCH_GAP_SECONDS)
    })
}

fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

async fn primary_table(pool: &SqlitePool) -> Result<Option<String>> {
    let tables: Vec<String> = sqlx::query_scalar(
        "SELECT name FROM sqlite_master \
         WHERE type = 'table' AND name NOT LIKE 'sqlite_%' AND name != ? \
         ORDER BY rowid",
    )
    .bind(METADATA_TABLE)
    .fetch_all(pool)
    .await?;
    Ok(tables.into_iter().next())
}

async fn sidecar_artifact_type(pool: &SqlitePool) -> Option<ArtifactType> {
    let declared: Option<String> =
        sqlx::query_scalar("SELECT value FROM feather_metadata WHERE key = 'artifact_type'")
            .fetch_optional(pool)
            .await
            .ok()
            .flatten();
    declared.map(|name| ArtifactType::parse(&name))
}

async fn sample_rows(
    pool: &SqlitePool,
    table: &str,
    limit: u32,
) -> Result<Vec<Map<String, Value>>> {
    let sql = format!("SELECT * FROM {} LIMIT ?", quote_ident(table));
    let rows = sqlx::query(&sql).bind(limit).fetch_all(pool).await?;
    Ok(rows.iter().map(row_to_map).collect())
}

async fn ensure_timestamp_index(pool: &SqlitePool, table: &str, column: &str) {
    let index_name = format!("idx_timewindow_{}", column.to_ascii_lowercase());
    let sql = format!(
        "CREATE INDEX IF NOT EXISTS {} ON {} ({})",
        quote_ident(&index_name),
        quote_ident(table),
        quote_ident(column),
    );
    // A read-only artifact copy cannot take an index; range queries still
    // work, just slower.
    if let Err(err) = sqlx::query(&sql).execute(pool).await {
        warn!(table, column, error = %err, "could not create timestamp index");
    }
}

async fn table_has_rowid(pool: &SqlitePool, table: &str) -> bool {
    let sql = format!("SELECT rowid FROM {} LIMIT 1", quote_ident(table));
    sqlx::query(&sql).fetch_optional(pool).await.is_ok()
}

/// Decode every column of a row into a JSON map using SQLite's storage class.
fn row_to_map(row: &SqliteRow) -> Map<String, Value> {
    let mut map = Map::new();
    for (index, column) in row.columns().iter().enumerate() {
        let value = raw_column_value(row, index);
        map.insert(column.name().to_string(), value);
    }
    map
}

fn raw_column_value(row: &SqliteRow, index: usize) -> Value {
    let Ok(raw) = row.try_get_raw(index) else {
        return Value::Null;
    };
    if raw.is_null() {
        return Value::Null;
    }
    match raw.type_info().name() {
        "INTEGER" => row
            .try_get::<i64, _>(index)
            .map(Value::from)
            .unwrap_or(Value::Null),
        "REAL" => row
            .try_get::<f64, _>(index)
            .map(Value::from)
            .unwrap_or(Value::Null),
        "BLOB" => row
            .try_get::<Vec<u8>, _>(index)
            .map(|bytes| Value::from(String::from_utf8_lossy(&bytes).into_owned()))
            .unwrap_or(Value::Null),
        _ => row
            .try_get::<String, _>(index)
            .map(Value::from)
            .unwrap_or(Value::Null),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::path::Path;

    fn spec_for(id: &str, path: &Path) -> SourceSpec {
        SourceSpec {
            source_id: SourceId::from(id),
            artifact_type: ArtifactType::Prefetch,
            database_path: path.to_path_buf(),
            weight: 1.0,
            tier: 0,
            tier_name: String::new(),
        }
    }

    async fn writer_pool(path: &Path) -> SqlitePool {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .expect("fixture pool")
    }

    async fn prefetch_fixture(path: &Path, rows: &[(&str, &str)]) {
        let pool = writer_pool(path).await;
        sqlx::query("CREATE TABLE prefetch (application TEXT, last_run_time TEXT)")
            .execute(&pool)
            .await
            .expect("create table");
        for (app, ts) in rows {
            sqlx::query("INSERT INTO prefetch (application, last_run_time) VALUES (?, ?)")
                .bind(app)
                .bind(ts)
                .execute(&pool)
                .await
                .expect("insert row");
        }
        pool.close().await;
    }

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 10, 1, h, m, s).unwrap()
    }

    #[tokio::test]
    async fn open_detects_timestamp_column_and_creates_index() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prefetch.db");
        prefetch_fixture(&path, &[("calc.exe", "2024-10-01 10:00:00")]).await;

        let source = SourceQuery::open(spec_for("prefetch", &path)).await.unwrap();
        assert_eq!(source.timestamp_column(), "last_run_time");

        let indexes: Vec<String> = sqlx::query_scalar(
            "SELECT name FROM sqlite_master WHERE type = 'index'",
        )
        .fetch_all(&source.pool)
        .await
        .unwrap();
        assert!(
            indexes.iter().any(|n| n == "idx_timewindow_last_run_time"),
            "{indexes:?}"
        );
        source.close().await;
    }

    #[tokio::test]
    async fn missing_database_is_a_hard_error() {
        let err = SourceQuery::open(spec_for("gone", Path::new("/nonexistent/x.db")))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::SourceUnavailable { .. }));
    }

    #[tokio::test]
    async fn query_range_orders_filters_and_caches() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prefetch.db");
        prefetch_fixture(
            &path,
            &[
                ("b.exe", "2024-10-01 10:04:00"),
                ("a.exe", "2024-10-01 10:01:00"),
                ("c.exe", "2024-10-01 11:30:00"),
            ],
        )
        .await;

        let source = SourceQuery::open(spec_for("prefetch", &path)).await.unwrap();
        let records = source.query_range(at(10, 0, 0), at(10, 5, 0)).await;
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].application().as_deref(), Some("a.exe"));
        assert_eq!(records[1].application().as_deref(), Some("b.exe"));
        assert!(records[0].rowid.is_some());

        let stats = source.cache_stats().await;
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 0);

        let again = source.query_range(at(10, 0, 0), at(10, 5, 0)).await;
        assert_eq!(again.len(), 2);
        let stats = source.cache_stats().await;
        assert_eq!(stats.hits, 1);
        source.close().await;
    }

    #[tokio::test]
    async fn count_in_range_sees_only_the_window() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prefetch.db");
        prefetch_fixture(
            &path,
            &[
                ("a.exe", "2024-10-01 10:01:00"),
                ("b.exe", "2024-10-01 12:00:00"),
            ],
        )
        .await;

        let source = SourceQuery::open(spec_for("prefetch", &path)).await.unwrap();
        assert_eq!(source.count_in_range(at(10, 0, 0), at(10, 5, 0)).await.unwrap(), 1);
        assert_eq!(source.count_in_range(at(9, 0, 0), at(9, 30, 0)).await.unwrap(), 0);
        source.close().await;
    }

    #[tokio::test]
    async fn timestamp_range_is_cached_forever() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prefetch.db");
        prefetch_fixture(
            &path,
            &[
                ("a.exe", "2024-10-01 10:00:00"),
                ("b.exe", "2024-10-02 18:30:00"),
            ],
        )
        .await;

        let source = SourceQuery::open(spec_for("prefetch", &path)).await.unwrap();
        let (min, max) = source.timestamp_range().await.unwrap().unwrap();
        assert_eq!(min, at(10, 0, 0));
        assert_eq!(max, Utc.with_ymd_and_hms(2024, 10, 2, 18, 30, 0).unwrap());

        // Second call is served from cache; equality is the observable bit.
        let cached = source.timestamp_range().await.unwrap().unwrap();
        assert_eq!(cached, (min, max));
        source.close().await;
    }

    #[tokio::test]
    async fn multi_timestamp_rows_expand_per_element() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prefetch.db");
        let pool = writer_pool(&path).await;
        sqlx::query("CREATE TABLE prefetch (application TEXT, run_times TEXT)")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("INSERT INTO prefetch (application, run_times) VALUES (?, ?)")
            .bind("calc.exe")
            .bind(r#"["2024-10-01 10:00:00", "2024-10-01 11:00:00", "2024-10-01 12:00:00"]"#)
            .execute(&pool)
            .await
            .unwrap();
        pool.close().await;

        let source = SourceQuery::open(spec_for("prefetch", &path)).await.unwrap();
        let records = source.query_range(at(9, 0, 0), at(13, 0, 0)).await;
        assert_eq!(records.len(), 3);
        assert!(records.iter().all(|r| r.is_array_expanded()));
        assert_eq!(records.iter().filter(|r| r.instant == at(11, 0, 0)).count(), 1);

        // Keys stay distinct even though all three share one physical row.
        let keys: std::collections::HashSet<String> =
            records.iter().map(|r| r.record_key()).collect();
        assert_eq!(keys.len(), 3);

        // Only the element near 10:00 joins a narrow window.
        let narrow = source.query_range(at(9, 58, 0), at(10, 2, 0)).await;
        assert_eq!(narrow.len(), 1);
        source.close().await;
    }

    #[tokio::test]
    async fn batch_query_partitions_consecutive_ranges() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prefetch.db");
        prefetch_fixture(
            &path,
            &[
                ("a.exe", "2024-10-01 10:01:00"),
                ("b.exe", "2024-10-01 10:07:00"),
                ("c.exe", "2024-10-01 10:13:00"),
            ],
        )
        .await;

        let source = SourceQuery::open(spec_for("prefetch", &path)).await.unwrap();
        let ranges = vec![
            (at(10, 0, 0), at(10, 5, 0)),
            (at(10, 5, 0), at(10, 10, 0)),
            (at(10, 10, 0), at(10, 15, 0)),
        ];
        let results = source.batch_query(&ranges).await;
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].len(), 1);
        assert_eq!(results[1].len(), 1);
        assert_eq!(results[2].len(), 1);

        // One spanning query, not three.
        let stats = source.cache_stats().await;
        assert_eq!(stats.misses, 1);
        source.close().await;
    }

    #[tokio::test]
    async fn sidecar_metadata_overrides_artifact_type() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("artifact.db");
        let pool = writer_pool(&path).await;
        sqlx::query("CREATE TABLE events (message TEXT, event_time TEXT)")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("INSERT INTO events VALUES ('logon', '2024-10-01 10:00:00')")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("CREATE TABLE feather_metadata (key TEXT, value TEXT)")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("INSERT INTO feather_metadata VALUES ('artifact_type', 'EventLogs')")
            .execute(&pool)
            .await
            .unwrap();
        pool.close().await;

        let source = SourceQuery::open(spec_for("events", &path)).await.unwrap();
        assert_eq!(source.artifact_type(), &ArtifactType::EventLogs);
        assert_eq!(source.timestamp_column(), "event_time");
        source.close().await;
    }

    #[tokio::test]
    async fn source_without_timestamps_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("no_ts.db");
        let pool = writer_pool(&path).await;
        sqlx::query("CREATE TABLE things (name TEXT, flags INTEGER)")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("INSERT INTO things VALUES ('calc.exe', 3)")
            .execute(&pool)
            .await
            .unwrap();
        pool.close().await;

        let err = SourceQuery::open(spec_for("things", &path)).await.unwrap_err();
        assert!(matches!(err, EngineError::NoTimestampColumn(_)));
    }
}
