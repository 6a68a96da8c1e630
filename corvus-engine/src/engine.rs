//! The correlation engine driver.
//!
//! One engine instance runs one wing: load sources, resolve the scan range,
//! sweep Phase-1 windows through the scheduler, replay them in Phase 2, and
//! assemble the final [`CorrelationResult`]. The driver never panics its way
//! out and never returns an error: every failure lands in the result's
//! `errors` or `warnings` lists.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use serde_json::json;
use tracing::{error, info, warn};

use corvus_model::{CorrelationResult, ScanConfig, SourceId, Wing};

use crate::cancel::CancellationManager;
use crate::coordinator::ErrorCoordinator;
use crate::error::{EngineError, ErrorSeverity, Result};
use crate::estimate::AdaptiveTimeEstimator;
use crate::memory::MemoryManager;
use crate::persist::WindowStore;
use crate::persist::streaming::StreamingMatchStore;
use crate::progress::{ProgressEventKind, ProgressListener, ProgressTracker};
use crate::range::TimeRangeDetector;
use crate::schedule::balancer::BalancingAlgorithm;
use crate::schedule::{Scheduler, SchedulerConfig};
use crate::source::SourceQuery;
use crate::window::WindowGenerator;
use crate::window::processor::WindowProcessor;
use crate::window::query::WindowQueryManager;

/// Window-count estimate beyond which the engine recommends retuning.
const WINDOW_COUNT_RECOMMENDATION_THRESHOLD: u64 = 100_000;

/// Identity and capability description of the engine.
#[derive(Debug, Clone, serde::Serialize)]
pub struct EngineMetadata {
    pub name: &'static str,
    pub version: &'static str,
    pub capabilities: Vec<&'static str>,
}

/// Two-phase time-window correlation engine.
pub struct CorrelationEngine {
    config: ScanConfig,
    tracker: Arc<ProgressTracker>,
    cancellation: Arc<CancellationManager>,
    coordinator: Arc<ErrorCoordinator>,
    estimator: Arc<AdaptiveTimeEstimator>,
}

impl std::fmt::Debug for CorrelationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CorrelationEngine")
            .field("config", &self.config)
            .finish()
    }
}

impl CorrelationEngine {
    pub fn new(config: ScanConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            tracker: Arc::new(ProgressTracker::new()),
            cancellation: Arc::new(CancellationManager::new()),
            coordinator: Arc::new(ErrorCoordinator::new()),
            estimator: Arc::new(AdaptiveTimeEstimator::new()),
        })
    }

    pub fn metadata() -> EngineMetadata {
        EngineMetadata {
            name: "corvus-time-window-engine",
            version: env!("CARGO_PKG_VERSION"),
            capabilities: vec![
                "two_phase_correlation",
                "time_range_auto_detection",
                "quick_empty_check",
                "parallel_window_processing",
                "streaming_persistence",
                "weighted_scoring",
                "semantic_rules",
            ],
        }
    }

    pub fn register_progress_listener(&self, listener: impl ProgressListener + 'static) {
        self.tracker.register_listener(listener);
    }

    pub fn request_cancellation(&self, reason: impl Into<String>) {
        self.cancellation.request(reason);
    }

    pub fn cancellation(&self) -> &CancellationManager {
        &self.cancellation
    }

    pub fn coordinator(&self) -> &ErrorCoordinator {
        &self.coordinator
    }

    /// Execute a wing against its sources. `database_paths` overrides the
    /// paths declared in the wing per source id; `case_dir` receives the
    /// correlation database and, under memory pressure, the streaming match
    /// database.
    pub async fn execute_wing(
        &self,
        wing: &Wing,
        database_paths: &BTreeMap<SourceId, PathBuf>,
        case_dir: &Path,
    ) -> CorrelationResult {
        let started = Instant::now();
        let mut result = CorrelationResult::new(wing.wing_id.clone(), wing.wing_name.clone());
        self.tracker.emit(
            ProgressEventKind::WingStart,
            json!({
                "wing_id": wing.wing_id.as_str(),
                "wing_name": wing.wing_name,
                "sources": wing.sources.len(),
            }),
        );

        if let Err(err) = self.run(wing, database_paths, case_dir, &mut result).await {
            match &err {
                EngineError::Cancelled(reason) => {
                    result.errors.push(format!("execution cancelled: {reason}"));
                    self.tracker
                        .emit(ProgressEventKind::Cancelled, json!({ "reason": reason }));
                }
                other => {
                    error!(error = %other, "wing execution failed");
                    result.errors.push(other.to_string());
                    self.tracker.emit(
                        ProgressEventKind::Error,
                        json!({ "error": other.to_string() }),
                    );
                }
            }
        }

        self.cancellation.run_cleanup();

        result.execution_duration_seconds = started.elapsed().as_secs_f64();
        let duration = result.execution_duration_seconds.max(f64::EPSILON);
        result.performance_metrics.windows_per_second =
            (result.performance_metrics.windows_generated as f64) / duration;
        result.performance_metrics.records_per_second =
            result.total_records_scanned as f64 / duration;

        if result.succeeded() {
            self.tracker.emit(
                ProgressEventKind::Complete,
                json!({
                    "matches": result.matches.len(),
                    "duration_seconds": result.execution_duration_seconds,
                }),
            );
        }
        result
    }

    async fn run(
        &self,
        wing: &Wing,
        database_paths: &BTreeMap<SourceId, PathBuf>,
        case_dir: &Path,
        result: &mut CorrelationResult,
    ) -> Result<()> {
        // Configuration problems abort before anything is loaded.
        wing.validate()?;

        let sources = self.load_sources(wing, database_paths, result).await;
        if sources.len() < wing.rules.minimum_matches + 1 {
            return Err(EngineError::Configuration(format!(
                "only {} of {} sources loaded; minimum_matches {} requires at least {}",
                sources.len(),
                wing.sources.len(),
                wing.rules.minimum_matches,
                wing.rules.minimum_matches + 1,
            )));
        }
        result.sources_processed = sources.len();

        let memory = MemoryManager::start(self.config.memory_limit_mb);
        memory.sample().await;
        if self.config.enable_streaming_mode {
            memory.force_streaming();
        }

        // Resolve the scan range.
        let mut source_ranges = BTreeMap::new();
        for (source_id, source) in &sources {
            match source.timestamp_range().await {
                Ok(Some(range)) => {
                    source_ranges.insert(source_id.clone(), range);
                }
                Ok(None) => {
                    result
                        .warnings
                        .push(format!("source {source_id} holds no parseable timestamps"));
                }
                Err(err) => {
                    result.warnings.push(format!(
                        "source {source_id} excluded from range detection: {err}"
                    ));
                    self.coordinator.handle_error(
                        err.category(),
                        ErrorSeverity::Medium,
                        "range_detection",
                        err.to_string(),
                        json!({ "source_id": source_id.as_str() }),
                    );
                }
            }
        }

        let (filter_start, filter_end) = if self.config.auto_detect_time_range {
            (self.config.starting_epoch, self.config.ending_epoch)
        } else {
            match (self.config.starting_epoch, self.config.ending_epoch) {
                (Some(start), Some(end)) => (Some(start), Some(end)),
                _ => {
                    return Err(EngineError::Configuration(
                        "auto_detect_time_range is disabled but starting_epoch/ending_epoch \
                         are not both set"
                            .to_string(),
                    ));
                }
            }
        };
        let detector = TimeRangeDetector::new(self.config.max_time_range_years);
        let detection = detector.detect(&source_ranges, filter_start, filter_end)?;
        result
            .warnings
            .extend(detection.warnings.iter().map(|w| format!("time range: {w}")));
        result.performance_metrics.time_range_detection_seconds = detection.detection_seconds;

        let generator = WindowGenerator::new(
            detection.earliest,
            detection.latest,
            self.config.window_size_minutes,
            self.config.effective_interval_minutes(),
        );
        let total_windows = generator.total_windows();
        if total_windows > WINDOW_COUNT_RECOMMENDATION_THRESHOLD {
            result.warnings.push(format!(
                "{total_windows} windows will be scanned; consider a larger window size or \
                 scanning interval for this time span"
            ));
        }
        self.tracker.emit(
            ProgressEventKind::ScanningStart,
            json!({
                "total_windows": total_windows,
                "start": detection.earliest.to_rfc3339(),
                "end": detection.latest.to_rfc3339(),
            }),
        );
        info!(
            wing = wing.wing_id.as_str(),
            total_windows,
            parallel = self.config.parallel_window_processing,
            "starting phase 1 window scan"
        );

        // Phase 1: sweep windows into the correlation database.
        let window_store = Arc::new(
            WindowStore::open(&case_dir.join(format!("{}_correlation.db", wing.wing_id))).await?,
        );
        let query_manager = Arc::new(WindowQueryManager::new(
            sources.clone(),
            self.config.max_records_per_window,
        ));
        let processor = Arc::new(WindowProcessor::new(
            Arc::clone(&query_manager),
            Arc::clone(&window_store),
            Arc::clone(&self.tracker),
            Arc::clone(&memory),
            wing.rules.minimum_matches,
            self.config.enable_quick_empty_check,
        ));
        let scheduler = Scheduler::new(
            Arc::clone(&processor),
            Arc::clone(&self.cancellation),
            Arc::clone(&memory),
            Arc::clone(&self.estimator),
            Arc::clone(&self.tracker),
            SchedulerConfig {
                parallel: self.config.parallel_window_processing,
                workers: self.config.effective_workers(num_cpus::get()),
                batch_size: self.config.parallel_batch_size,
                min_batch_size: self.config.min_batch_size,
                max_batch_size: self.config.max_batch_size,
                algorithm: BalancingAlgorithm::Adaptive,
            },
        );
        let scan = scheduler.run(&generator).await?;

        result.total_records_scanned = scan.records_scanned;
        result.performance_metrics.windows_generated = total_windows;
        result.performance_metrics.windows_with_data =
            scan.windows_processed - scan.empty_windows;
        result.performance_metrics.empty_windows_skipped = scan.empty_windows;
        result.performance_metrics.empty_check_seconds = scan.empty_check_seconds;
        result.performance_metrics.recompute_skip_rate();
        let busy_windows = scan.windows_processed.saturating_sub(scan.empty_windows);
        if busy_windows > 0 && scan.empty_windows > 0 {
            // Each skipped window would have cost roughly one full query
            // pass; extrapolate from the observed non-empty average.
            let avg_busy_seconds = scan.busy_seconds / busy_windows as f64;
            result.performance_metrics.estimated_seconds_saved =
                scan.empty_windows as f64 * avg_busy_seconds;
        }
        if scan.windows_failed > 0 {
            result
                .warnings
                .push(format!("{} windows failed and were skipped", scan.windows_failed));
            self.coordinator.handle_error(
                crate::error::ErrorCategory::Processing,
                ErrorSeverity::Medium,
                "scheduler",
                format!("{} windows failed during phase 1", scan.windows_failed),
                json!({}),
            );
        }
        let (cache_hits, cache_misses) = query_manager.cache_stats().await;
        result.performance_metrics.query_cache_hits = cache_hits;
        result.performance_metrics.query_cache_misses = cache_misses;

        for source in sources.values() {
            let health = source.health();
            if !health.healthy {
                result.warnings.push(format!(
                    "source {} degraded during the run ({} errors)",
                    health.source_id, health.error_count
                ));
            }
        }

        if scan.cancelled {
            return Err(EngineError::Cancelled(
                self.cancellation
                    .status()
                    .reason
                    .unwrap_or_else(|| "cancelled during phase 1".to_string()),
            ));
        }

        // Streaming decision point: config opt-in or pressure observed in
        // phase 1. The toggle is one-way.
        if let Some(reason) = memory.maybe_enable_streaming() {
            self.tracker.emit(
                ProgressEventKind::StreamingEnabled,
                json!({ "reason": reason }),
            );
        }
        let streaming_store = if memory.streaming_enabled() {
            result.performance_metrics.streaming_mode_activated = true;
            // Shed the per-source query caches along with the switch; phase 2
            // replays from the correlation database, not the sources.
            for source in sources.values() {
                source.clear_query_cache().await;
            }
            let path = case_dir.join(format!("{}_matches.db", wing.wing_id));
            result
                .warnings
                .push(format!("streaming mode active, matches persisted to {}", path.display()));
            Some(StreamingMatchStore::open(&path, wing).await?)
        } else {
            None
        };

        // Phase 2: replay and correlate.
        let correlator =
            crate::correlate::Phase2Correlator::new(wing, &self.config, &self.tracker);
        let phase2 = correlator
            .correlate(&window_store, streaming_store.as_ref(), &self.cancellation)
            .await?;

        result.duplicates_prevented = phase2.duplicates_prevented;
        result.duplicates_by_source = phase2.duplicates_by_source;
        result.matches_failed_validation = phase2.matches_failed_validation;
        result.filter_statistics = phase2.filter_statistics;
        result.phase2_statistics = Some(phase2.statistics);

        if let Some(store) = &streaming_store {
            // Matches live on disk; keep the in-memory result light.
            store.finalize(result).await?;
            info!(
                matches = phase2.matches.len(),
                "phase 2 complete, matches persisted to streaming store"
            );
            store.close().await;
        } else {
            result.matches = phase2.matches;
        }

        result.performance_metrics.peak_memory_mb = memory.peak_mb();
        result
            .warnings
            .extend(memory.optimization_suggestions());

        self.tracker.emit(
            ProgressEventKind::SummaryProgress,
            json!({
                "matches": result.matches.len(),
                "duplicates_prevented": result.duplicates_prevented,
                "matches_failed_validation": result.matches_failed_validation,
            }),
        );

        window_store.close().await;
        for source in sources.values() {
            source.close().await;
        }

        if phase2.cancelled {
            return Err(EngineError::Cancelled(
                self.cancellation
                    .status()
                    .reason
                    .unwrap_or_else(|| "cancelled during phase 2".to_string()),
            ));
        }
        Ok(())
    }

    /// Open every source, skipping the ones that fail. Skips become warnings;
    /// the caller enforces the minimum viable source count.
    async fn load_sources(
        &self,
        wing: &Wing,
        database_paths: &BTreeMap<SourceId, PathBuf>,
        result: &mut CorrelationResult,
    ) -> BTreeMap<SourceId, Arc<SourceQuery>> {
        let mut sources = BTreeMap::new();
        for spec in &wing.sources {
            let mut spec = spec.clone();
            if let Some(path) = database_paths.get(&spec.source_id) {
                spec.database_path = path.clone();
            }
            let source_id = spec.source_id.clone();
            match SourceQuery::open(spec.clone()).await {
                Ok(source) => {
                    sources.insert(source_id, Arc::new(source));
                }
                Err(err) => {
                    warn!(source = %source_id, error = %err, "source failed to load, skipping");
                    self.coordinator.handle_error(
                        err.category(),
                        ErrorSeverity::High,
                        "source_loader",
                        err.to_string(),
                        json!({ "source_id": source_id.as_str() }),
                    );
                    result
                        .warnings
                        .push(format!("source {source_id} skipped: {err}"));
                }
            }
        }
        sources
    }
}
