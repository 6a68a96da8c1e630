//! Progress event stream for scan observers.
//!
//! The engine narrates a run through typed events; listeners subscribe in
//! registration order and are isolated from one another, so a panicking
//! listener is logged and skipped rather than breaking emission. UI layers
//! and log sinks both hang off this interface.

use std::panic::AssertUnwindSafe;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{error, trace};

/// Everything the engine reports about a run in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressEventKind {
    ScanningStart,
    WingStart,
    AnchorCollection,
    CorrelationStart,
    WindowProgress,
    AnchorProgress,
    SummaryProgress,
    MemoryWarning,
    StreamingEnabled,
    Error,
    Cancelled,
    Complete,
}

/// Counters snapshot attached to every event.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct OverallProgress {
    pub windows_processed: u64,
    pub total_windows: u64,
    pub empty_windows_skipped: u64,
    pub skip_rate_percentage: f64,
    pub records_scanned: u64,
    pub matches_found: u64,
    pub elapsed_seconds: f64,
    pub eta_seconds: Option<f64>,
    pub memory_mb: f64,
}

impl OverallProgress {
    pub fn percent_complete(&self) -> f64 {
        if self.total_windows == 0 {
            0.0
        } else {
            self.windows_processed as f64 / self.total_windows as f64 * 100.0
        }
    }
}

/// One progress event: what happened, when, and the run state at that moment.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ProgressEvent {
    pub kind: ProgressEventKind,
    pub timestamp: DateTime<Utc>,
    pub overall: OverallProgress,
    pub data: Value,
}

/// Observer of the engine's event stream.
pub trait ProgressListener: Send + Sync {
    fn on_event(&self, event: &ProgressEvent);
}

impl<F> ProgressListener for F
where
    F: Fn(&ProgressEvent) + Send + Sync,
{
    fn on_event(&self, event: &ProgressEvent) {
        self(event)
    }
}

/// Shared progress state plus the listener registry.
pub struct ProgressTracker {
    listeners: Mutex<Vec<Box<dyn ProgressListener>>>,
    started: Instant,
    windows_processed: AtomicU64,
    total_windows: AtomicU64,
    empty_windows_skipped: AtomicU64,
    records_scanned: AtomicU64,
    matches_found: AtomicU64,
    /// Bit pattern of the latest memory reading in MB.
    memory_mb_bits: AtomicU64,
    /// Bit pattern of the latest ETA in seconds; `u64::MAX` means none.
    eta_bits: AtomicU64,
}

impl std::fmt::Debug for ProgressTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressTracker")
            .field(
                "listeners",
                &self.listeners.lock().map(|l| l.len()).unwrap_or(0),
            )
            .field(
                "windows_processed",
                &self.windows_processed.load(Ordering::Relaxed),
            )
            .finish()
    }
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self {
            listeners: Mutex::new(Vec::new()),
            started: Instant::now(),
            windows_processed: AtomicU64::new(0),
            total_windows: AtomicU64::new(0),
            empty_windows_skipped: AtomicU64::new(0),
            records_scanned: AtomicU64::new(0),
            matches_found: AtomicU64::new(0),
            memory_mb_bits: AtomicU64::new(0),
            eta_bits: AtomicU64::new(u64::MAX),
        }
    }

    /// Subscribe a listener; invocation order follows registration order.
    pub fn register_listener(&self, listener: impl ProgressListener + 'static) {
        if let Ok(mut listeners) = self.listeners.lock() {
            listeners.push(Box::new(listener));
        }
    }

    pub fn set_total_windows(&self, total: u64) {
        self.total_windows.store(total, Ordering::Relaxed);
    }

    pub fn record_window(&self, records: u64, is_empty: bool) {
        self.windows_processed.fetch_add(1, Ordering::Relaxed);
        self.records_scanned.fetch_add(records, Ordering::Relaxed);
        if is_empty {
            self.empty_windows_skipped.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_matches(&self, count: u64) {
        self.matches_found.fetch_add(count, Ordering::Relaxed);
    }

    pub fn update_memory(&self, memory_mb: f64) {
        self.memory_mb_bits
            .store(memory_mb.to_bits(), Ordering::Relaxed);
    }

    pub fn update_eta(&self, eta_seconds: Option<f64>) {
        let bits = eta_seconds.map_or(u64::MAX, f64::to_bits);
        self.eta_bits.store(bits, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> OverallProgress {
        let windows_processed = self.windows_processed.load(Ordering::Relaxed);
        let empty = self.empty_windows_skipped.load(Ordering::Relaxed);
        let eta_bits = self.eta_bits.load(Ordering::Relaxed);
        OverallProgress {
            windows_processed,
            total_windows: self.total_windows.load(Ordering::Relaxed),
            empty_windows_skipped: empty,
            skip_rate_percentage: if windows_processed > 0 {
                empty as f64 / windows_processed as f64 * 100.0
            } else {
                0.0
            },
            records_scanned: self.records_scanned.load(Ordering::Relaxed),
            matches_found: self.matches_found.load(Ordering::Relaxed),
            elapsed_seconds: self.started.elapsed().as_secs_f64(),
            eta_seconds: (eta_bits != u64::MAX).then(|| f64::from_bits(eta_bits)),
            memory_mb: f64::from_bits(self.memory_mb_bits.load(Ordering::Relaxed)),
        }
    }

    /// Emit an event to every listener. A panicking listener is logged and
    /// does not stop delivery to the rest.
    pub fn emit(&self, kind: ProgressEventKind, data: Value) {
        let event = ProgressEvent {
            kind,
            timestamp: Utc::now(),
            overall: self.snapshot(),
            data,
        };
        trace!(kind = ?event.kind, "emitting progress event");

        let Ok(listeners) = self.listeners.lock() else {
            return;
        };
        for (index, listener) in listeners.iter().enumerate() {
            let outcome =
                std::panic::catch_unwind(AssertUnwindSafe(|| listener.on_event(&event)));
            if outcome.is_err() {
                error!(listener = index, kind = ?event.kind, "progress listener panicked");
            }
        }
    }
}
