//! Central error bookkeeping: taxonomy, recovery chains, and health grading.
//!
//! Components report failures here instead of deciding recovery themselves.
//! The coordinator records every event on a bounded ring (seven-day cutoff),
//! suggests the next recovery action for the category, and grades overall
//! engine health from recent error density.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use tracing::warn;

use crate::error::{ErrorCategory, ErrorSeverity};

/// Events older than this are dropped from the ring.
const EVENT_RETENTION: Duration = Duration::days(7);
/// Hard cap on retained events.
const EVENT_CAPACITY: usize = 1000;
/// Recent-error thresholds (per hour, per category) for health grading.
const DEGRADED_THRESHOLD: usize = 3;
const CRITICAL_THRESHOLD: usize = 10;

/// One recorded failure, with whatever recovery was suggested for it.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ErrorEvent {
    pub timestamp: DateTime<Utc>,
    pub category: ErrorCategory,
    pub severity: ErrorSeverity,
    pub component: String,
    pub message: String,
    pub context: Value,
    pub recovery_action: Option<String>,
    pub resolved: bool,
}

/// Overall health grade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthGrade {
    Healthy,
    Degraded,
    Critical,
}

/// Health report with per-category detail and recommendations.
#[derive(Debug, Clone, serde::Serialize)]
pub struct HealthStatus {
    pub grade: HealthGrade,
    pub recent_errors_by_category: HashMap<ErrorCategory, usize>,
    pub recommendations: Vec<String>,
}

/// Ordered recovery strategies for a category; the engine works through them
/// on consecutive failures.
pub fn recovery_chain(category: ErrorCategory) -> &'static [&'static str] {
    match category {
        ErrorCategory::Database => &[
            "reset_connections",
            "fall_back_to_cached",
            "skip_source",
        ],
        ErrorCategory::Memory => &[
            "enable_streaming",
            "force_gc",
            "shrink_batch_size",
        ],
        ErrorCategory::Timestamp => &[
            "clear_format_cache",
            "use_fallback_format",
            "skip_invalid_records",
        ],
        ErrorCategory::Configuration => &["abort_run"],
        ErrorCategory::Processing => &["skip_window", "abort_run"],
        ErrorCategory::System => &["retry_operation", "abort_run"],
    }
}

struct CoordinatorState {
    events: VecDeque<ErrorEvent>,
    /// How many failures each category has accumulated, indexing into its
    /// recovery chain.
    recovery_progress: HashMap<ErrorCategory, usize>,
    totals: HashMap<ErrorCategory, u64>,
}

/// Process-wide error sink.
pub struct ErrorCoordinator {
    state: Mutex<CoordinatorState>,
}

impl std::fmt::Debug for ErrorCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let events = self.state.lock().map(|s| s.events.len()).unwrap_or(0);
        f.debug_struct("ErrorCoordinator")
            .field("retained_events", &events)
            .finish()
    }
}

impl Default for ErrorCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ErrorCoordinator {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(CoordinatorState {
                events: VecDeque::new(),
                recovery_progress: HashMap::new(),
                totals: HashMap::new(),
            }),
        }
    }

    /// Record a failure and return the suggested recovery action, advancing
    /// the category's chain so repeated failures escalate.
    pub fn handle_error(
        &self,
        category: ErrorCategory,
        severity: ErrorSeverity,
        component: &str,
        message: impl Into<String>,
        context: Value,
    ) -> Option<&'static str> {
        let message = message.into();
        warn!(%category, %severity, component, %message, "error reported to coordinator");

        let Ok(mut state) = self.state.lock() else {
            return None;
        };

        let chain = recovery_chain(category);
        let progress = state.recovery_progress.entry(category).or_insert(0);
        let action = chain.get(*progress).copied().or_else(|| chain.last().copied());
        *progress = (*progress + 1).min(chain.len().saturating_sub(1));
        *state.totals.entry(category).or_insert(0) += 1;

        state.events.push_back(ErrorEvent {
            timestamp: Utc::now(),
            category,
            severity,
            component: component.to_string(),
            message,
            context,
            recovery_action: action.map(str::to_string),
            resolved: false,
        });
        prune(&mut state.events);
        action
    }

    /// Mark the most recent unresolved event of a category as resolved.
    pub fn mark_resolved(&self, category: ErrorCategory) {
        if let Ok(mut state) = self.state.lock() {
            if let Some(event) = state
                .events
                .iter_mut()
                .rev()
                .find(|e| e.category == category && !e.resolved)
            {
                event.resolved = true;
            }
            // A successful recovery rewinds the category's escalation.
            state.recovery_progress.insert(category, 0);
        }
    }

    pub fn recent_errors(&self, window: Duration) -> Vec<ErrorEvent> {
        let cutoff = Utc::now() - window;
        self.state
            .lock()
            .map(|state| {
                state
                    .events
                    .iter()
                    .filter(|e| e.timestamp >= cutoff)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn total_errors(&self) -> u64 {
        self.state
            .lock()
            .map(|state| state.totals.values().sum())
            .unwrap_or(0)
    }

    /// Grade health from error density over the last hour.
    pub fn check_health(&self) -> HealthStatus {
        let recent = self.recent_errors(Duration::hours(1));
        let mut by_category: HashMap<ErrorCategory, usize> = HashMap::new();
        let mut worst_severity = ErrorSeverity::Low;
        for event in &recent {
            *by_category.entry(event.category).or_insert(0) += 1;
            worst_severity = worst_severity.max(event.severity);
        }

        let max_in_category = by_category.values().max().copied().unwrap_or(0);
        let grade = if worst_severity == ErrorSeverity::Critical
            || max_in_category > CRITICAL_THRESHOLD
        {
            HealthGrade::Critical
        } else if max_in_category > DEGRADED_THRESHOLD {
            HealthGrade::Degraded
        } else {
            HealthGrade::Healthy
        };

        let mut recommendations = Vec::new();
        for (category, count) in &by_category {
            if *count > DEGRADED_THRESHOLD {
                recommendations.push(match category {
                    ErrorCategory::Database => {
                        "repeated database errors: verify source files are intact and unlocked"
                            .to_string()
                    }
                    ErrorCategory::Memory => {
                        "repeated memory pressure: raise memory_limit_mb or shrink windows"
                            .to_string()
                    }
                    ErrorCategory::Timestamp => {
                        "repeated timestamp failures: check artifact timestamp formats"
                            .to_string()
                    }
                    other => format!("repeated {other} errors: inspect the error log"),
                });
            }
        }

        HealthStatus {
            grade,
            recent_errors_by_category: by_category,
            recommendations,
        }
    }
}

fn prune(events: &mut VecDeque<ErrorEvent>) {
    let cutoff = Utc::now() - EVENT_RETENTION;
    while let Some(front) = events.front() {
        if front.timestamp < cutoff || events.len() > EVENT_CAPACITY {
            events.pop_front();
        } else {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn recovery_chain_escalates_then_pins_at_last() {
        let coordinator = ErrorCoordinator::new();
        let ctx = json!({"source": "prefetch"});

        let first = coordinator.handle_error(
            ErrorCategory::Database,
            ErrorSeverity::Medium,
            "source_query",
            "database is locked",
            ctx.clone(),
        );
        assert_eq!(first, Some("reset_connections"));

        let second = coordinator.handle_error(
            ErrorCategory::Database,
            ErrorSeverity::Medium,
            "source_query",
            "still locked",
            ctx.clone(),
        );
        assert_eq!(second, Some("fall_back_to_cached"));

        let third = coordinator.handle_error(
            ErrorCategory::Database,
            ErrorSeverity::High,
            "source_query",
            "still locked",
            ctx.clone(),
        );
        assert_eq!(third, Some("skip_source"));

        // Exhausted chains keep suggesting the terminal action.
        let fourth = coordinator.handle_error(
            ErrorCategory::Database,
            ErrorSeverity::High,
            "source_query",
            "still locked",
            ctx,
        );
        assert_eq!(fourth, Some("skip_source"));
    }

    #[test]
    fn resolution_rewinds_escalation() {
        let coordinator = ErrorCoordinator::new();
        coordinator.handle_error(
            ErrorCategory::Memory,
            ErrorSeverity::Medium,
            "memory",
            "pressure",
            Value::Null,
        );
        coordinator.mark_resolved(ErrorCategory::Memory);
        let next = coordinator.handle_error(
            ErrorCategory::Memory,
            ErrorSeverity::Medium,
            "memory",
            "pressure again",
            Value::Null,
        );
        assert_eq!(next, Some("enable_streaming"));
    }

    #[test]
    fn health_degrades_with_error_density() {
        let coordinator = ErrorCoordinator::new();
        assert_eq!(coordinator.check_health().grade, HealthGrade::Healthy);

        for _ in 0..5 {
            coordinator.handle_error(
                ErrorCategory::Database,
                ErrorSeverity::Medium,
                "source_query",
                "locked",
                Value::Null,
            );
        }
        let health = coordinator.check_health();
        assert_eq!(health.grade, HealthGrade::Degraded);
        assert!(!health.recommendations.is_empty());

        for _ in 0..10 {
            coordinator.handle_error(
                ErrorCategory::Database,
                ErrorSeverity::Medium,
                "source_query",
                "locked",
                Value::Null,
            );
        }
        assert_eq!(coordinator.check_health().grade, HealthGrade::Critical);
    }

    #[test]
    fn critical_severity_is_critical_immediately() {
        let coordinator = ErrorCoordinator::new();
        coordinator.handle_error(
            ErrorCategory::Memory,
            ErrorSeverity::Critical,
            "memory",
            "out of memory",
            Value::Null,
        );
        assert_eq!(coordinator.check_health().grade, HealthGrade::Critical);
    }
}
