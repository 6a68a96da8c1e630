//! Cooperative cancellation with ordered resource cleanup.
//!
//! Cancellation is checked at every window boundary in both scheduling modes.
//! On request the engine stops submitting work, in-flight tasks bail at their
//! next checkpoint, and registered cleanup hooks run in LIFO order so later
//! acquisitions release first.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::{EngineError, Result};

type CleanupHook = Box<dyn FnOnce() + Send>;

/// Snapshot of the cancellation state.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CancellationStatus {
    pub requested: bool,
    pub reason: Option<String>,
    pub requested_at: Option<DateTime<Utc>>,
    pub pending_cleanup_hooks: usize,
}

/// Owns the run's cancellation token and cleanup stack.
pub struct CancellationManager {
    token: CancellationToken,
    reason: Mutex<Option<(String, DateTime<Utc>)>>,
    hooks: Mutex<Vec<(String, CleanupHook)>>,
}

impl std::fmt::Debug for CancellationManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationManager")
            .field("cancelled", &self.token.is_cancelled())
            .field(
                "pending_hooks",
                &self.hooks.lock().map(|h| h.len()).unwrap_or(0),
            )
            .finish()
    }
}

impl Default for CancellationManager {
    fn default() -> Self {
        Self::new()
    }
}

impl CancellationManager {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            reason: Mutex::new(None),
            hooks: Mutex::new(Vec::new()),
        }
    }

    /// Child token for handing to workers and channel loops.
    pub fn token(&self) -> CancellationToken {
        self.token.child_token()
    }

    /// Request cancellation. Idempotent; the first reason wins.
    pub fn request(&self, reason: impl Into<String>) {
        let reason = reason.into();
        if let Ok(mut guard) = self.reason.lock()
            && guard.is_none()
        {
            info!(%reason, "cancellation requested");
            *guard = Some((reason, Utc::now()));
        }
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Window-boundary checkpoint.
    pub fn check(&self) -> Result<()> {
        if self.token.is_cancelled() {
            let reason = self
                .reason
                .lock()
                .ok()
                .and_then(|guard| guard.as_ref().map(|(r, _)| r.clone()))
                .unwrap_or_else(|| "cancelled".to_string());
            return Err(EngineError::Cancelled(reason));
        }
        Ok(())
    }

    /// Register a cleanup hook; hooks run LIFO when cancellation (or normal
    /// teardown) drains them.
    pub fn register_cleanup(&self, name: impl Into<String>, hook: impl FnOnce() + Send + 'static) {
        if let Ok(mut hooks) = self.hooks.lock() {
            hooks.push((name.into(), Box::new(hook)));
        }
    }

    /// Run and drain all cleanup hooks, most recently registered first.
    pub fn run_cleanup(&self) {
        let drained: Vec<(String, CleanupHook)> = match self.hooks.lock() {
            Ok(mut hooks) => hooks.drain(..).collect(),
            Err(_) => return,
        };
        for (name, hook) in drained.into_iter().rev() {
            info!(hook = %name, "running cleanup hook");
            if std::panic::catch_unwind(std::panic::AssertUnwindSafe(hook)).is_err() {
                warn!(hook = %name, "cleanup hook panicked");
            }
        }
    }

    pub fn status(&self) -> CancellationStatus {
        let (reason, requested_at) = self
            .reason
            .lock()
            .ok()
            .and_then(|guard| guard.clone())
            .map(|(r, at)| (Some(r), Some(at)))
            .unwrap_or((None, None));
        CancellationStatus {
            requested: self.token.is_cancelled(),
            reason,
            requested_at,
            pending_cleanup_hooks: self.hooks.lock().map(|h| h.len()).unwrap_or(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn check_fails_after_request_with_reason() {
        let manager = CancellationManager::new();
        assert!(manager.check().is_ok());

        manager.request("user clicked stop");
        let err = manager.check().unwrap_err();
        assert!(matches!(err, EngineError::Cancelled(reason) if reason.contains("user clicked")));
    }

    #[test]
    fn first_reason_wins() {
        let manager = CancellationManager::new();
        manager.request("first");
        manager.request("second");
        assert_eq!(manager.status().reason.as_deref(), Some("first"));
    }

    #[test]
    fn cleanup_runs_in_lifo_order() {
        let manager = CancellationManager::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for tag in ["connections", "writer", "caches"] {
            let order = Arc::clone(&order);
            manager.register_cleanup(tag, move || {
                order.lock().unwrap().push(tag);
            });
        }

        manager.run_cleanup();
        assert_eq!(
            *order.lock().unwrap(),
            vec!["caches", "writer", "connections"]
        );
        assert_eq!(manager.status().pending_cleanup_hooks, 0);
    }

    #[test]
    fn panicking_hook_does_not_stop_the_rest() {
        let manager = CancellationManager::new();
        let ran = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&ran);
        manager.register_cleanup("good", move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        manager.register_cleanup("bad", || panic!("hook bug"));

        manager.run_cleanup();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn child_tokens_observe_cancellation() {
        let manager = CancellationManager::new();
        let token = manager.token();
        assert!(!token.is_cancelled());
        manager.request("shutdown");
        assert!(token.is_cancelled());
    }
}
