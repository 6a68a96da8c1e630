//! Per-window query fan-out across sources.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::json;
use tracing::warn;

use corvus_model::{SourceId, TimeWindow};

use crate::progress::{ProgressEventKind, ProgressTracker};
use crate::source::SourceQuery;

/// Fans one window's range out to every source and collects the results.
pub struct WindowQueryManager {
    sources: BTreeMap<SourceId, Arc<SourceQuery>>,
    max_records_per_window: usize,
}

impl std::fmt::Debug for WindowQueryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WindowQueryManager")
            .field("sources", &self.sources.len())
            .field("max_records_per_window", &self.max_records_per_window)
            .finish()
    }
}

impl WindowQueryManager {
    pub fn new(
        sources: BTreeMap<SourceId, Arc<SourceQuery>>,
        max_records_per_window: usize,
    ) -> Self {
        Self {
            sources,
            max_records_per_window,
        }
    }

    pub fn source_count(&self) -> usize {
        self.sources.len()
    }

    pub fn sources(&self) -> &BTreeMap<SourceId, Arc<SourceQuery>> {
        &self.sources
    }

    /// Quick empty check: indexed counts, short-circuiting to `true` on the
    /// first source with data. The full query path is never touched here,
    /// which keeps the per-source query caches cold for empty stretches.
    pub async fn has_any_records(&self, window: &TimeWindow) -> bool {
        for source in self.sources.values() {
            match source.count_in_range(window.start, window.end).await {
                Ok(0) => {}
                Ok(_) => return true,
                Err(err) => {
                    // An unanswerable count cannot prove emptiness; fall
                    // through to the full query path.
                    warn!(
                        source = %source.source_id(),
                        error = %err,
                        "empty check failed, treating window as non-empty"
                    );
                    return true;
                }
            }
        }
        false
    }

    /// Populate the window with each source's records, emitting a per-source
    /// query-progress event as results arrive.
    pub async fn query_window(
        &self,
        mut window: TimeWindow,
        tracker: &ProgressTracker,
    ) -> TimeWindow {
        let futures = self.sources.values().map(|source| {
            let source = Arc::clone(source);
            let start = window.start;
            let end = window.end;
            async move {
                let records = source.query_range(start, end).await;
                (source.source_id().clone(), records)
            }
        });

        for (source_id, mut records) in futures::future::join_all(futures).await {
            if records.len() > self.max_records_per_window {
                warn!(
                    source = %source_id,
                    records = records.len(),
                    cap = self.max_records_per_window,
                    "window record cap hit, truncating"
                );
                records.truncate(self.max_records_per_window);
            }
            tracker.emit(
                ProgressEventKind::WindowProgress,
                json!({
                    "phase": "source_query",
                    "window_id": window.window_id.as_u64(),
                    "source_id": source_id.as_str(),
                    "records": records.len(),
                }),
            );
            if !records.is_empty() {
                window.records_by_source.insert(source_id, records);
            }
        }
        window
    }

    /// Union of all sources' cache statistics.
    pub async fn cache_stats(&self) -> (u64, u64) {
        let mut hits = 0;
        let mut misses = 0;
        for source in self.sources.values() {
            let stats = source.cache_stats().await;
            hits += stats.hits;
            misses += stats.misses;
        }
        (hits, misses)
    }
}
