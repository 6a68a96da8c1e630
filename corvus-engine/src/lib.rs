//! Corvus: a two-phase time-window correlation engine for forensic artifact
//! databases.
//!
//! Given per-artifact SQLite databases and a wing (correlation recipe), the
//! engine discovers the interesting time range, sweeps fixed-width windows
//! over indexed timestamp columns, preserves sufficient windows (Phase 1),
//! then replays them into deduplicated, scored, confidence-banded matches
//! (Phase 2).
//!
//! ```no_run
//! use std::collections::BTreeMap;
//! use std::path::Path;
//!
//! use corvus_engine::CorrelationEngine;
//! use corvus_model::{ScanConfig, Wing};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let wing = Wing::load_from_file("execution_proof.wing.json")?;
//! let engine = CorrelationEngine::new(ScanConfig::default().adapted_to_wing(&wing))?;
//! let result = engine
//!     .execute_wing(&wing, &BTreeMap::new(), Path::new("./case"))
//!     .await;
//! for m in result.canonical_matches() {
//!     println!("{} @ {} ({})", m.anchor_source_id, m.anchor_instant, m.confidence_band);
//! }
//! # Ok(())
//! # }
//! ```
#![allow(missing_docs)]

pub mod cancel;
pub mod coordinator;
pub mod correlate;
pub mod engine;
pub mod error;
pub mod estimate;
pub mod memory;
pub mod persist;
pub mod progress;
pub mod range;
pub mod schedule;
pub mod scoring;
pub mod semantic;
pub mod source;
pub mod timestamp;
pub mod window;

#[cfg(test)]
pub(crate) mod testutil;

pub use cancel::{CancellationManager, CancellationStatus};
pub use coordinator::{ErrorCoordinator, ErrorEvent, HealthGrade, HealthStatus};
pub use correlate::Phase2Correlator;
pub use engine::{CorrelationEngine, EngineMetadata};
pub use error::{EngineError, ErrorCategory, ErrorSeverity, Result};
pub use estimate::{AdaptiveTimeEstimator, Estimate, EstimationStrategy, Trend};
pub use memory::{MemoryManager, MemoryReport};
pub use persist::WindowStore;
pub use persist::streaming::StreamingMatchStore;
pub use progress::{
    OverallProgress, ProgressEvent, ProgressEventKind, ProgressListener, ProgressTracker,
};
pub use range::{TimeRangeDetectionResult, TimeRangeDetector};
pub use schedule::balancer::{BalancingAlgorithm, WorkerLoadBalancer};
pub use schedule::{Scheduler, SchedulerConfig};
pub use source::SourceQuery;
pub use timestamp::{TimestampFormat, TimestampParser};
pub use window::WindowGenerator;
