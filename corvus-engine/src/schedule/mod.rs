//! Window scheduling: sequential or parallel with adaptive batching.
//!
//! Parallel mode runs a bounded pool of workers, each with its own queue; the
//! load balancer picks a queue per task. Batches form a barrier: after each
//! one the scheduler feeds the estimator and resizes the next batch from
//! resource pressure. Cancellation is checked at every window boundary in
//! both modes.

pub mod balancer;

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tracing::{info, warn};

use corvus_model::TimeWindow;

use crate::cancel::CancellationManager;
use crate::error::Result;
use crate::estimate::AdaptiveTimeEstimator;
use crate::memory::MemoryManager;
use crate::progress::ProgressTracker;
use crate::window::WindowGenerator;
use crate::window::processor::WindowProcessor;
use balancer::{BalancingAlgorithm, WorkerLoadBalancer};

/// Batch shrink factor under resource pressure.
const BATCH_SHRINK: f64 = 0.8;
/// Batch growth factor when resources are free.
const BATCH_GROW: f64 = 1.2;
/// CPU percentage above which batches shrink.
const CPU_PRESSURE_PERCENT: f64 = 90.0;
/// Memory usage (percent of limit) above which batches shrink.
const MEMORY_PRESSURE_PERCENT: f64 = 80.0;
/// Worker task-queue depth.
const WORKER_QUEUE_DEPTH: usize = 64;

/// One parallel work item.
#[derive(Debug)]
pub struct WindowProcessingTask {
    pub task_id: u64,
    pub window: TimeWindow,
    pub est_complexity: f64,
}

/// `1 + records/1000 * 0.1 + max(0, sources - 2) * 0.2`.
pub fn estimate_complexity(window: &TimeWindow) -> f64 {
    1.0 + window.total_records() as f64 / 1000.0 * 0.1
        + window.records_by_source.len().saturating_sub(2) as f64 * 0.2
}

/// Next batch size under the observed pressure, clamped to the bounds.
pub fn resize_batch(
    current: usize,
    min: usize,
    max: usize,
    cpu_percent: f64,
    memory_usage_percent: f64,
) -> usize {
    let scaled = if cpu_percent > CPU_PRESSURE_PERCENT
        || memory_usage_percent > MEMORY_PRESSURE_PERCENT
    {
        (current as f64 * BATCH_SHRINK) as usize
    } else {
        (current as f64 * BATCH_GROW) as usize
    };
    scaled.clamp(min, max)
}

/// Scheduling knobs, resolved from the scan configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub parallel: bool,
    pub workers: usize,
    pub batch_size: usize,
    pub min_batch_size: usize,
    pub max_batch_size: usize,
    pub algorithm: BalancingAlgorithm,
}

/// Phase-1 aggregate statistics.
#[derive(Debug, Clone, Default)]
pub struct ScanStats {
    pub windows_processed: u64,
    pub windows_persisted: u64,
    pub empty_windows: u64,
    pub windows_failed: u64,
    pub records_scanned: u64,
    pub empty_check_seconds: f64,
    /// Wall time spent on windows that had data, for skip-savings estimates.
    pub busy_seconds: f64,
    pub batches_dispatched: u64,
    pub final_batch_size: usize,
    pub cancelled: bool,
}

struct WorkerReport {
    worker: usize,
    complexity: f64,
    records: u64,
    persisted: bool,
    empty: bool,
    success: bool,
    skipped: bool,
    seconds: f64,
    empty_check_seconds: f64,
}

/// Drives Phase 1 over the window stream.
pub struct Scheduler {
    processor: Arc<WindowProcessor>,
    cancellation: Arc<CancellationManager>,
    memory: Arc<MemoryManager>,
    estimator: Arc<AdaptiveTimeEstimator>,
    tracker: Arc<ProgressTracker>,
    config: SchedulerConfig,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("config", &self.config)
            .finish()
    }
}

impl Scheduler {
    pub fn new(
        processor: Arc<WindowProcessor>,
        cancellation: Arc<CancellationManager>,
        memory: Arc<MemoryManager>,
        estimator: Arc<AdaptiveTimeEstimator>,
        tracker: Arc<ProgressTracker>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            processor,
            cancellation,
            memory,
            estimator,
            tracker,
            config,
        }
    }

    pub async fn run(&self, generator: &WindowGenerator) -> Result<ScanStats> {
        let total_windows = generator.total_windows();
        self.tracker.set_total_windows(total_windows);
        if self.config.parallel && self.config.workers > 1 {
            self.run_parallel(generator, total_windows).await
        } else {
            self.run_sequential(generator, total_windows).await
        }
    }

    async fn run_sequential(
        &self,
        generator: &WindowGenerator,
        total_windows: u64,
    ) -> Result<ScanStats> {
        let mut stats = ScanStats {
            final_batch_size: 1,
            ..ScanStats::default()
        };

        for window in generator.iter() {
            if self.cancellation.is_cancelled() {
                stats.cancelled = true;
                break;
            }

            let started = Instant::now();
            match self.processor.process(window).await {
                Ok(outcome) => {
                    stats.windows_processed += 1;
                    stats.records_scanned += outcome.records_found;
                    stats.empty_check_seconds += outcome.empty_check_seconds;
                    if outcome.persisted {
                        stats.windows_persisted += 1;
                    }
                    if outcome.is_empty {
                        stats.empty_windows += 1;
                    } else {
                        stats.busy_seconds += outcome.duration_seconds;
                        // Empty windows would skew the rate estimate.
                        self.estimator.add_measurement(
                            1,
                            started.elapsed().as_secs_f64(),
                            outcome.records_found,
                            Some(self.memory.check_pressure().current_mb),
                        );
                    }
                }
                Err(err) => {
                    stats.windows_processed += 1;
                    stats.windows_failed += 1;
                    warn!(error = %err, "window processing failed, continuing");
                }
            }

            if stats.windows_processed % 10 == 0 {
                self.refresh_eta(stats.windows_processed, total_windows);
            }
        }
        Ok(stats)
    }

    async fn run_parallel(
        &self,
        generator: &WindowGenerator,
        total_windows: u64,
    ) -> Result<ScanStats> {
        let worker_count = self.config.workers;
        let balancer = Arc::new(WorkerLoadBalancer::new(worker_count, self.config.algorithm));
        let (report_tx, mut report_rx) = mpsc::unbounded_channel::<WorkerReport>();

        let mut task_senders = Vec::with_capacity(worker_count);
        let mut handles = Vec::with_capacity(worker_count);
        for worker_index in 0..worker_count {
            let (task_tx, mut task_rx) = mpsc::channel::<WindowProcessingTask>(WORKER_QUEUE_DEPTH);
            task_senders.push(task_tx);

            let processor = Arc::clone(&self.processor);
            let token = self.cancellation.token();
            let reports = report_tx.clone();
            handles.push(tokio::spawn(async move {
                while let Some(task) = task_rx.recv().await {
                    if token.is_cancelled() {
                        // Drain without processing so the batch barrier still
                        // sees every dispatched task accounted for.
                        let _ = reports.send(WorkerReport {
                            worker: worker_index,
                            complexity: task.est_complexity,
                            records: 0,
                            persisted: false,
                            empty: false,
                            success: true,
                            skipped: true,
                            seconds: 0.0,
                            empty_check_seconds: 0.0,
                        });
                        continue;
                    }
                    let started = Instant::now();
                    let report = match processor.process(task.window).await {
                        Ok(outcome) => WorkerReport {
                            worker: worker_index,
                            complexity: task.est_complexity,
                            records: outcome.records_found,
                            persisted: outcome.persisted,
                            empty: outcome.is_empty,
                            success: true,
                            skipped: false,
                            seconds: started.elapsed().as_secs_f64(),
                            empty_check_seconds: outcome.empty_check_seconds,
                        },
                        Err(err) => {
                            warn!(
                                worker = worker_index,
                                task = task.task_id,
                                error = %err,
                                "window processing failed"
                            );
                            WorkerReport {
                                worker: worker_index,
                                complexity: task.est_complexity,
                                records: 0,
                                persisted: false,
                                empty: false,
                                success: false,
                                skipped: false,
                                seconds: started.elapsed().as_secs_f64(),
                                empty_check_seconds: 0.0,
                            }
                        }
                    };
                    if reports.send(report).is_err() {
                        break;
                    }
                }
            }));
        }
        drop(report_tx);

        let mut stats = ScanStats::default();
        let mut batch_size = self
            .config
            .batch_size
            .clamp(self.config.min_batch_size, self.config.max_batch_size);
        let mut windows = generator.iter();
        let mut next_task_id = 0u64;

        'batches: loop {
            if self.cancellation.is_cancelled() {
                stats.cancelled = true;
                break;
            }

            let batch: Vec<TimeWindow> = windows.by_ref().take(batch_size).collect();
            if batch.is_empty() {
                break;
            }

            let batch_started = Instant::now();
            let mut dispatched = 0usize;
            for window in batch {
                if self.cancellation.is_cancelled() {
                    stats.cancelled = true;
                    // Fall through to drain whatever was already dispatched.
                    break;
                }
                let est_complexity = estimate_complexity(&window);
                let worker = balancer.select_worker(est_complexity).unwrap_or(0);
                balancer.update_load(worker, est_complexity);
                let task = WindowProcessingTask {
                    task_id: next_task_id,
                    window,
                    est_complexity,
                };
                next_task_id += 1;
                if task_senders[worker].send(task).await.is_err() {
                    warn!(worker, "worker queue closed, stopping dispatch");
                    stats.cancelled = true;
                    break;
                }
                dispatched += 1;
            }

            let mut batch_records = 0u64;
            let mut batch_non_empty = 0u64;
            for _ in 0..dispatched {
                let Some(report) = report_rx.recv().await else {
                    break 'batches;
                };
                balancer.update_load(report.worker, -report.complexity);
                balancer.record_completion(report.worker, report.seconds, report.success);
                if report.skipped {
                    continue;
                }
                stats.windows_processed += 1;
                stats.records_scanned += report.records;
                stats.empty_check_seconds += report.empty_check_seconds;
                batch_records += report.records;
                if report.persisted {
                    stats.windows_persisted += 1;
                }
                if report.empty {
                    stats.empty_windows += 1;
                } else {
                    stats.busy_seconds += report.seconds;
                    batch_non_empty += 1;
                }
                if !report.success {
                    stats.windows_failed += 1;
                }
            }

            stats.batches_dispatched += 1;
            if batch_non_empty > 0 {
                self.estimator.add_measurement(
                    batch_non_empty,
                    batch_started.elapsed().as_secs_f64(),
                    batch_records,
                    Some(self.memory.check_pressure().current_mb),
                );
            }
            self.refresh_eta(stats.windows_processed, total_windows);

            let pressure = self.memory.check_pressure();
            let resized = resize_batch(
                batch_size,
                self.config.min_batch_size,
                self.config.max_batch_size,
                self.memory.cpu_percent(),
                pressure.usage_percentage,
            );
            if resized != batch_size {
                info!(from = batch_size, to = resized, "adjusted parallel batch size");
                batch_size = resized;
            }
        }

        // Closing the queues ends the workers; wait them out with a timeout.
        drop(task_senders);
        for handle in handles {
            match tokio::time::timeout(std::time::Duration::from_secs(30), handle).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!("worker task failed: {err:?}"),
                Err(_) => warn!("worker task timed out during shutdown"),
            }
        }

        stats.cancelled |= self.cancellation.is_cancelled();
        stats.final_batch_size = batch_size;
        Ok(stats)
    }

    fn refresh_eta(&self, windows_processed: u64, total_windows: u64) {
        if let Some(estimate) = self
            .estimator
            .estimate_completion(windows_processed, total_windows)
        {
            self.tracker.update_eta(estimate.seconds_remaining);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use corvus_model::WindowId;

    #[test]
    fn complexity_scales_with_records_and_sources() {
        let start = Utc.with_ymd_and_hms(2024, 10, 1, 10, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2024, 10, 1, 10, 5, 0).unwrap();
        let window = TimeWindow::new(WindowId(0), start, end);
        assert!((estimate_complexity(&window) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn batch_resizing_shrinks_under_pressure_and_grows_when_free() {
        assert_eq!(resize_batch(100, 10, 500, 95.0, 10.0), 80);
        assert_eq!(resize_batch(100, 10, 500, 10.0, 85.0), 80);
        assert_eq!(resize_batch(100, 10, 500, 10.0, 10.0), 120);
        // Clamped at both ends.
        assert_eq!(resize_batch(12, 10, 500, 95.0, 95.0), 10);
        assert_eq!(resize_batch(450, 10, 500, 10.0, 10.0), 500);
    }
}
