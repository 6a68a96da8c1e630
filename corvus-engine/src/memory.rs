//! Process memory tracking and streaming-mode arbitration.
//!
//! A background task samples process RSS and system free memory on a fixed
//! cadence. Window processing consults the manager before each window, and
//! the manager decides when the run must shed to streaming persistence. The
//! streaming toggle is one-way for the lifetime of a run.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use sysinfo::{ProcessesToUpdate, System};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Streaming triggers fire when free system memory drops below this floor.
const SYSTEM_FREE_FLOOR_MB: f64 = 500.0;
/// Streaming triggers fire when usage crosses this fraction of the limit.
const USAGE_WARNING_FRACTION: f64 = 0.85;
/// Streaming triggers fire when the rolling efficiency crosses this many MB
/// per thousand records.
const EFFICIENCY_CEILING_MB_PER_1K: f64 = 10.0;
/// Windows are refused while free system memory is under this fraction of
/// total memory.
const FREE_BUFFER_FRACTION: f64 = 0.20;

const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_secs(2);

/// Point-in-time view of memory pressure.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct MemoryReport {
    pub current_mb: f64,
    pub peak_mb: f64,
    pub limit_mb: f64,
    pub usage_percentage: f64,
    pub system_available_mb: f64,
    pub system_total_mb: f64,
    pub is_over_limit: bool,
    /// Rolling MB consumed per thousand records processed.
    pub efficiency_mb_per_1k: f64,
}

/// Tracks process RSS against the configured limit and owns the one-way
/// streaming-mode switch.
pub struct MemoryManager {
    limit_mb: f64,
    system: Mutex<System>,
    pid: sysinfo::Pid,
    current_kb: AtomicU64,
    peak_kb: AtomicU64,
    available_kb: AtomicU64,
    total_kb: AtomicU64,
    records_processed: AtomicU64,
    baseline_kb: AtomicU64,
    streaming_enabled: AtomicBool,
    warnings_issued: AtomicU64,
    /// Bit pattern of the latest global CPU usage percentage.
    cpu_percent_bits: AtomicU64,
}

impl std::fmt::Debug for MemoryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryManager")
            .field("limit_mb", &self.limit_mb)
            .field("current_mb", &kb_to_mb(self.current_kb.load(Ordering::Relaxed)))
            .field(
                "streaming_enabled",
                &self.streaming_enabled.load(Ordering::Relaxed),
            )
            .finish()
    }
}

impl MemoryManager {
    /// Create a manager and start its sampling task. The task holds only a
    /// weak reference and exits once every owner has dropped the manager.
    pub fn start(limit_mb: u64) -> Arc<Self> {
        Self::start_with_interval(limit_mb, DEFAULT_SAMPLE_INTERVAL)
    }

    pub fn start_with_interval(limit_mb: u64, interval: Duration) -> Arc<Self> {
        let pid = sysinfo::get_current_pid().unwrap_or_else(|_| sysinfo::Pid::from_u32(0));
        let manager = Arc::new(Self {
            limit_mb: limit_mb as f64,
            system: Mutex::new(System::new()),
            pid,
            current_kb: AtomicU64::new(0),
            peak_kb: AtomicU64::new(0),
            available_kb: AtomicU64::new(u64::MAX),
            total_kb: AtomicU64::new(0),
            records_processed: AtomicU64::new(0),
            baseline_kb: AtomicU64::new(0),
            streaming_enabled: AtomicBool::new(false),
            warnings_issued: AtomicU64::new(0),
            cpu_percent_bits: AtomicU64::new(0),
        });

        let weak = Arc::downgrade(&manager);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let Some(manager) = weak.upgrade() else {
                    break;
                };
                manager.sample().await;
            }
        });

        manager
    }

    /// Refresh process and system memory readings.
    pub async fn sample(&self) {
        let mut system = self.system.lock().await;
        system.refresh_processes(ProcessesToUpdate::Some(&[self.pid]), true);
        system.refresh_memory();

        if let Some(process) = system.process(self.pid) {
            let kb = process.memory() / 1024;
            self.current_kb.store(kb, Ordering::Relaxed);
            self.peak_kb.fetch_max(kb, Ordering::Relaxed);
            if self.baseline_kb.load(Ordering::Relaxed) == 0 {
                self.baseline_kb.store(kb, Ordering::Relaxed);
            }
        }
        self.available_kb
            .store(system.available_memory() / 1024, Ordering::Relaxed);
        self.total_kb
            .store(system.total_memory() / 1024, Ordering::Relaxed);

        system.refresh_cpu_usage();
        self.cpu_percent_bits.store(
            f64::from(system.global_cpu_usage()).to_bits(),
            Ordering::Relaxed,
        );
    }

    /// Latest sampled global CPU usage percentage.
    pub fn cpu_percent(&self) -> f64 {
        f64::from_bits(self.cpu_percent_bits.load(Ordering::Relaxed))
    }

    /// Count records that passed through the engine, feeding the rolling
    /// efficiency metric.
    pub fn record_processed(&self, records: u64) {
        self.records_processed.fetch_add(records, Ordering::Relaxed);
    }

    pub fn streaming_enabled(&self) -> bool {
        self.streaming_enabled.load(Ordering::Relaxed)
    }

    pub fn check_pressure(&self) -> MemoryReport {
        let current_mb = kb_to_mb(self.current_kb.load(Ordering::Relaxed));
        let peak_mb = kb_to_mb(self.peak_kb.load(Ordering::Relaxed));
        let available_kb = self.available_kb.load(Ordering::Relaxed);
        let system_available_mb = if available_kb == u64::MAX {
            f64::MAX
        } else {
            kb_to_mb(available_kb)
        };

        MemoryReport {
            current_mb,
            peak_mb,
            limit_mb: self.limit_mb,
            usage_percentage: if self.limit_mb > 0.0 {
                current_mb / self.limit_mb * 100.0
            } else {
                0.0
            },
            system_available_mb,
            system_total_mb: kb_to_mb(self.total_kb.load(Ordering::Relaxed)),
            is_over_limit: current_mb > self.limit_mb,
            efficiency_mb_per_1k: self.efficiency_mb_per_1k(),
        }
    }

    /// MB consumed beyond the baseline per thousand processed records.
    pub fn efficiency_mb_per_1k(&self) -> f64 {
        let records = self.records_processed.load(Ordering::Relaxed);
        if records == 0 {
            return 0.0;
        }
        let growth_mb = kb_to_mb(
            self.current_kb
                .load(Ordering::Relaxed)
                .saturating_sub(self.baseline_kb.load(Ordering::Relaxed)),
        );
        growth_mb / (records as f64 / 1000.0)
    }

    /// Whether the next window may be processed in memory. Refuses when the
    /// projection overshoots the limit or system free memory is under the
    /// 20% buffer.
    pub fn can_process_window(&self, estimated_records: usize) -> bool {
        let report = self.check_pressure();
        let projected_mb = report.current_mb
            + estimated_records as f64 / 1000.0 * self.efficiency_mb_per_1k().max(1.0);
        if projected_mb > report.limit_mb {
            self.warnings_issued.fetch_add(1, Ordering::Relaxed);
            warn!(
                projected_mb,
                limit_mb = report.limit_mb,
                "window refused: projected memory exceeds limit"
            );
            return false;
        }
        if report.system_total_mb > 0.0
            && report.system_available_mb < report.system_total_mb * FREE_BUFFER_FRACTION
        {
            self.warnings_issued.fetch_add(1, Ordering::Relaxed);
            warn!(
                available_mb = report.system_available_mb,
                "window refused: system free memory below buffer"
            );
            return false;
        }
        true
    }

    /// Evaluate streaming triggers and flip the one-way switch when any fire.
    /// Returns the trigger reason exactly once, on the transition.
    pub fn maybe_enable_streaming(&self) -> Option<String> {
        if self.streaming_enabled.load(Ordering::Relaxed) {
            return None;
        }
        let report = self.check_pressure();
        let reason = streaming_trigger(&report)?;
        match self.streaming_enabled.compare_exchange(
            false,
            true,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => {
                debug!(reason = %reason, "streaming mode enabled");
                Some(reason)
            }
            Err(_) => None,
        }
    }

    /// Force streaming on regardless of pressure (configuration opt-in).
    pub fn force_streaming(&self) {
        self.streaming_enabled.store(true, Ordering::SeqCst);
    }

    pub fn warnings_issued(&self) -> u64 {
        self.warnings_issued.load(Ordering::Relaxed)
    }

    pub fn peak_mb(&self) -> f64 {
        kb_to_mb(self.peak_kb.load(Ordering::Relaxed))
    }

    /// Operator-facing suggestions derived from what the run has seen so far.
    pub fn optimization_suggestions(&self) -> Vec<String> {
        let mut suggestions = Vec::new();
        if self.warnings_issued.load(Ordering::Relaxed) > 5 {
            suggestions.push(
                "frequent memory warnings: consider raising memory_limit_mb".to_string(),
            );
        }
        if self.streaming_enabled() {
            suggestions.push(
                "streaming mode activated: raise memory_limit_mb or reduce window size to keep \
                 results in memory"
                    .to_string(),
            );
        }
        if self.efficiency_mb_per_1k() > EFFICIENCY_CEILING_MB_PER_1K {
            suggestions.push(
                "memory per record is high: reduce max_records_per_window".to_string(),
            );
        }
        suggestions
    }
}

/// The streaming trigger table. Pure so the thresholds are testable without a
/// live process.
pub fn streaming_trigger(report: &MemoryReport) -> Option<String> {
    if report.is_over_limit {
        return Some(format!(
            "memory usage {:.1}MB exceeds the {:.0}MB limit",
            report.current_mb, report.limit_mb
        ));
    }
    if report.usage_percentage > USAGE_WARNING_FRACTION * 100.0 {
        return Some(format!(
            "memory usage at {:.1}% of the limit",
            report.usage_percentage
        ));
    }
    if report.system_available_mb < SYSTEM_FREE_FLOOR_MB {
        return Some(format!(
            "system free memory down to {:.0}MB",
            report.system_available_mb
        ));
    }
    if report.efficiency_mb_per_1k > EFFICIENCY_CEILING_MB_PER_1K {
        return Some(format!(
            "memory efficiency degraded to {:.1}MB per 1000 records",
            report.efficiency_mb_per_1k
        ));
    }
    None
}

fn kb_to_mb(kb: u64) -> f64 {
    kb as f64 / 1024.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quiet_report() -> MemoryReport {
        MemoryReport {
            current_mb: 100.0,
            peak_mb: 120.0,
            limit_mb: 500.0,
            usage_percentage: 20.0,
            system_available_mb: 8000.0,
            system_total_mb: 16000.0,
            is_over_limit: false,
            efficiency_mb_per_1k: 1.0,
        }
    }

    #[test]
    fn no_trigger_under_quiet_conditions() {
        assert!(streaming_trigger(&quiet_report()).is_none());
    }

    #[test]
    fn over_limit_triggers_streaming() {
        let report = MemoryReport {
            current_mb: 600.0,
            is_over_limit: true,
            usage_percentage: 120.0,
            ..quiet_report()
        };
        assert!(streaming_trigger(&report).unwrap().contains("exceeds"));
    }

    #[test]
    fn eighty_five_percent_usage_triggers_streaming() {
        let report = MemoryReport {
            current_mb: 430.0,
            usage_percentage: 86.0,
            ..quiet_report()
        };
        assert!(streaming_trigger(&report).is_some());
    }

    #[test]
    fn low_system_memory_triggers_streaming() {
        let report = MemoryReport {
            system_available_mb: 400.0,
            ..quiet_report()
        };
        assert!(streaming_trigger(&report).unwrap().contains("free memory"));
    }

    #[test]
    fn poor_efficiency_triggers_streaming() {
        let report = MemoryReport {
            efficiency_mb_per_1k: 12.5,
            ..quiet_report()
        };
        assert!(streaming_trigger(&report).unwrap().contains("efficiency"));
    }

    #[tokio::test]
    async fn streaming_toggle_is_one_way_and_reports_once() {
        let manager = MemoryManager::start_with_interval(500, Duration::from_secs(3600));
        manager.force_streaming();
        assert!(manager.streaming_enabled());
        // Once on, further trigger evaluation stays quiet.
        assert!(manager.maybe_enable_streaming().is_none());
    }

    #[tokio::test]
    async fn sampling_populates_current_usage() {
        let manager = MemoryManager::start_with_interval(500, Duration::from_secs(3600));
        manager.sample().await;
        let report = manager.check_pressure();
        assert!(report.current_mb > 0.0, "{report:?}");
        assert!(report.peak_mb >= report.current_mb);
    }
}
