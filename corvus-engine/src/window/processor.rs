//! Phase-1 per-window pipeline: query, threshold, persist.
//!
//! Phase 1 emits no matches. A window that survives the sufficiency rule has
//! its organized record lists written to the correlation database; everything
//! else is dropped on the spot and only counted.

use std::sync::Arc;
use std::time::Instant;

use serde_json::json;
use tracing::debug;

use corvus_model::{TimeWindow, WindowId};

use crate::error::Result;
use crate::memory::MemoryManager;
use crate::persist::WindowStore;
use crate::progress::{ProgressEventKind, ProgressTracker};
use crate::window::query::WindowQueryManager;

/// What happened to one window in Phase 1.
#[derive(Debug, Clone)]
pub struct WindowOutcome {
    pub window_id: WindowId,
    pub records_found: u64,
    pub sources_with_data: usize,
    pub is_empty: bool,
    /// True when the window met the sufficiency threshold and was persisted.
    pub persisted: bool,
    pub duration_seconds: f64,
    pub empty_check_seconds: f64,
}

/// Runs the Phase-1 pipeline for individual windows.
pub struct WindowProcessor {
    query_manager: Arc<WindowQueryManager>,
    store: Arc<WindowStore>,
    tracker: Arc<ProgressTracker>,
    memory: Arc<MemoryManager>,
    minimum_matches: usize,
    enable_quick_empty_check: bool,
}

impl std::fmt::Debug for WindowProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WindowProcessor")
            .field("minimum_matches", &self.minimum_matches)
            .field("enable_quick_empty_check", &self.enable_quick_empty_check)
            .finish()
    }
}

impl WindowProcessor {
    pub fn new(
        query_manager: Arc<WindowQueryManager>,
        store: Arc<WindowStore>,
        tracker: Arc<ProgressTracker>,
        memory: Arc<MemoryManager>,
        minimum_matches: usize,
        enable_quick_empty_check: bool,
    ) -> Self {
        Self {
            query_manager,
            store,
            tracker,
            memory,
            minimum_matches,
            enable_quick_empty_check,
        }
    }

    pub async fn process(&self, window: TimeWindow) -> Result<WindowOutcome> {
        let started = Instant::now();
        let window_id = window.window_id;

        // Pressure check before any querying. A refusal does not drop the
        // window; it warns and pushes the run toward streaming persistence.
        if !self.memory.can_process_window(0) {
            self.tracker.emit(
                ProgressEventKind::MemoryWarning,
                json!({
                    "window_id": window_id.as_u64(),
                    "memory_mb": self.memory.check_pressure().current_mb,
                }),
            );
        }
        if let Some(reason) = self.memory.maybe_enable_streaming() {
            self.tracker.emit(
                ProgressEventKind::StreamingEnabled,
                json!({ "reason": reason }),
            );
        }

        // Quick empty check spares the full query path for dead stretches.
        let mut empty_check_seconds = 0.0;
        if self.enable_quick_empty_check {
            let check_started = Instant::now();
            let has_records = self.query_manager.has_any_records(&window).await;
            empty_check_seconds = check_started.elapsed().as_secs_f64();
            if !has_records {
                self.tracker.record_window(0, true);
                return Ok(WindowOutcome {
                    window_id,
                    records_found: 0,
                    sources_with_data: 0,
                    is_empty: true,
                    persisted: false,
                    duration_seconds: started.elapsed().as_secs_f64(),
                    empty_check_seconds,
                });
            }
        }

        let populated = self
            .query_manager
            .query_window(window, &self.tracker)
            .await;
        let records_found = populated.total_records() as u64;
        let sources_with_data = populated.contributing_sources().len();
        let is_empty = records_found == 0;

        let persisted = if !is_empty && populated.meets_threshold(self.minimum_matches) {
            self.store.save_window(&populated).await?;
            true
        } else {
            if !is_empty {
                debug!(
                    window = %window_id,
                    sources_with_data,
                    minimum = self.minimum_matches,
                    "window below sufficiency threshold, dropped"
                );
            }
            false
        };

        self.memory.record_processed(records_found);
        self.tracker.record_window(records_found, is_empty);
        let memory_mb = self.memory.check_pressure().current_mb;
        self.tracker.update_memory(memory_mb);
        self.tracker.emit(
            ProgressEventKind::WindowProgress,
            json!({
                "phase": "window_complete",
                "window_id": window_id.as_u64(),
                "records": records_found,
                "sources_with_data": sources_with_data,
                "is_empty": is_empty,
                "persisted": persisted,
                "memory_mb": memory_mb,
                "duration_seconds": started.elapsed().as_secs_f64(),
            }),
        );

        Ok(WindowOutcome {
            window_id,
            records_found,
            sources_with_data,
            is_empty,
            persisted,
            duration_seconds: started.elapsed().as_secs_f64(),
            empty_check_seconds,
        })
    }
}
