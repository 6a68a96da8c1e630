//! Worker selection for parallel window processing.
//!
//! Tracks per-worker load, recent task durations, resource readings, and
//! error counts. Three algorithms are available; the adaptive one scores
//! workers on a weighted blend and re-biases its weights online when
//! performance or load spreads out across the pool.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::debug;

/// Per-worker duration history retained for scoring.
const PERFORMANCE_HISTORY: usize = 50;
/// Recent durations considered when scoring a worker.
const RECENT_WINDOW: usize = 10;
/// Coefficient-of-variation threshold that marks the pool imbalanced.
const LOAD_IMBALANCE_THRESHOLD: f64 = 0.3;
/// Performance standard-deviation threshold for re-biasing toward `w_perf`.
const PERFORMANCE_VARIANCE_THRESHOLD: f64 = 0.5;
/// Minimum spacing between weight rebalances.
const REBALANCE_INTERVAL: Duration = Duration::from_secs(30);
/// Per-error scale inside the adaptive score's error term.
const ERROR_PENALTY: f64 = 0.1;

/// Worker-selection strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BalancingAlgorithm {
    RoundRobin,
    LeastLoaded,
    Adaptive,
}

#[derive(Debug, Clone, Default)]
struct WorkerState {
    load: f64,
    recent_seconds: VecDeque<f64>,
    cpu_usage: f64,
    memory_usage_mb: f64,
    active_tasks: usize,
    error_count: u64,
}

impl WorkerState {
    fn avg_recent_seconds(&self) -> Option<f64> {
        let tail: Vec<f64> = self
            .recent_seconds
            .iter()
            .rev()
            .take(RECENT_WINDOW)
            .copied()
            .collect();
        if tail.is_empty() {
            None
        } else {
            Some(tail.iter().sum::<f64>() / tail.len() as f64)
        }
    }
}

struct BalancerState {
    workers: Vec<WorkerState>,
    algorithm: BalancingAlgorithm,
    performance_weight: f64,
    load_weight: f64,
    resource_weight: f64,
    error_weight: f64,
    round_robin_index: usize,
    last_rebalance: Instant,
}

/// Snapshot of balancer internals for statistics reporting.
#[derive(Debug, Clone, serde::Serialize)]
pub struct BalancerStats {
    pub algorithm: BalancingAlgorithm,
    pub worker_loads: Vec<f64>,
    pub worker_error_counts: Vec<u64>,
    pub performance_weight: f64,
    pub load_weight: f64,
    pub resource_weight: f64,
    pub error_weight: f64,
    pub load_coefficient_of_variation: f64,
}

/// Assigns window-processing tasks to workers. One lock guards all state;
/// contention is one update per task boundary.
pub struct WorkerLoadBalancer {
    state: Mutex<BalancerState>,
}

impl std::fmt::Debug for WorkerLoadBalancer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.state.lock() {
            Ok(state) => f
                .debug_struct("WorkerLoadBalancer")
                .field("workers", &state.workers.len())
                .field("algorithm", &state.algorithm)
                .finish(),
            Err(_) => f.write_str("WorkerLoadBalancer { <poisoned> }"),
        }
    }
}

impl WorkerLoadBalancer {
    pub fn new(worker_count: usize, algorithm: BalancingAlgorithm) -> Self {
        Self {
            state: Mutex::new(BalancerState {
                workers: vec![WorkerState::default(); worker_count],
                algorithm,
                // The four score weights sum to one and stay that way
                // through renormalization.
                performance_weight: 0.35,
                load_weight: 0.35,
                resource_weight: 0.2,
                error_weight: 0.1,
                round_robin_index: 0,
                // No spacing constraint on the first rebalance.
                last_rebalance: Instant::now()
                    .checked_sub(REBALANCE_INTERVAL)
                    .unwrap_or_else(Instant::now),
            }),
        }
    }

    /// Pick the worker for a task of the given estimated complexity.
    pub fn select_worker(&self, task_complexity: f64) -> Option<usize> {
        let mut state = self.state.lock().ok()?;
        if state.workers.is_empty() {
            return None;
        }
        maybe_rebalance(&mut state);

        let selected = match state.algorithm {
            BalancingAlgorithm::RoundRobin => {
                let index = state.round_robin_index % state.workers.len();
                state.round_robin_index += 1;
                index
            }
            BalancingAlgorithm::LeastLoaded => state
                .workers
                .iter()
                .enumerate()
                .min_by(|(_, a), (_, b)| {
                    a.load
                        .partial_cmp(&b.load)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .map(|(index, _)| index)?,
            BalancingAlgorithm::Adaptive => {
                let mut best = 0usize;
                let mut best_score = f64::INFINITY;
                for (index, _) in state.workers.iter().enumerate() {
                    let score = worker_score(&state, index, task_complexity);
                    if score < best_score {
                        best_score = score;
                        best = index;
                    }
                }
                best
            }
        };
        Some(selected)
    }

    /// Adjust a worker's load (positive on dispatch, negative on completion).
    pub fn update_load(&self, worker: usize, delta: f64) {
        if let Ok(mut state) = self.state.lock()
            && let Some(w) = state.workers.get_mut(worker)
        {
            w.load = (w.load + delta).max(0.0);
            if delta > 0.0 {
                w.active_tasks += 1;
            } else {
                w.active_tasks = w.active_tasks.saturating_sub(1);
            }
        }
    }

    /// Record an observed CPU/memory reading for a worker.
    pub fn update_resources(&self, worker: usize, cpu_usage: f64, memory_usage_mb: f64) {
        if let Ok(mut state) = self.state.lock()
            && let Some(w) = state.workers.get_mut(worker)
        {
            w.cpu_usage = cpu_usage;
            w.memory_usage_mb = memory_usage_mb;
        }
    }

    /// Feed a finished task back into the scoring history.
    pub fn record_completion(&self, worker: usize, seconds: f64, success: bool) {
        if let Ok(mut state) = self.state.lock()
            && let Some(w) = state.workers.get_mut(worker)
        {
            w.recent_seconds.push_back(seconds);
            while w.recent_seconds.len() > PERFORMANCE_HISTORY {
                w.recent_seconds.pop_front();
            }
            if !success {
                w.error_count += 1;
            }
        }
    }

    pub fn set_algorithm(&self, algorithm: BalancingAlgorithm) {
        if let Ok(mut state) = self.state.lock() {
            state.algorithm = algorithm;
        }
    }

    pub fn stats(&self) -> Option<BalancerStats> {
        let state = self.state.lock().ok()?;
        Some(BalancerStats {
            algorithm: state.algorithm,
            worker_loads: state.workers.iter().map(|w| w.load).collect(),
            worker_error_counts: state.workers.iter().map(|w| w.error_count).collect(),
            performance_weight: state.performance_weight,
            load_weight: state.load_weight,
            resource_weight: state.resource_weight,
            error_weight: state.error_weight,
            load_coefficient_of_variation: load_cv(&state),
        })
    }
}

/// `w_load*load + w_perf*avg_recent*complexity + w_res*resources +
/// w_err*errors*0.1`; lower is better.
fn worker_score(state: &BalancerState, index: usize, task_complexity: f64) -> f64 {
    let worker = &state.workers[index];
    let load_score = worker.load * state.load_weight;
    let performance_score = match worker.avg_recent_seconds() {
        Some(avg) => avg * task_complexity * state.performance_weight,
        None => task_complexity * state.performance_weight,
    };
    let resource_score = (worker.cpu_usage
        + worker.memory_usage_mb / 100.0
        + worker.active_tasks as f64)
        * state.resource_weight;
    let error_penalty = worker.error_count as f64 * state.error_weight * ERROR_PENALTY;
    load_score + performance_score + resource_score + error_penalty
}

fn load_cv(state: &BalancerState) -> f64 {
    let loads: Vec<f64> = state.workers.iter().map(|w| w.load).collect();
    if loads.len() < 2 {
        return 0.0;
    }
    let mean = loads.iter().sum::<f64>() / loads.len() as f64;
    if mean == 0.0 {
        return 0.0;
    }
    let variance = loads.iter().map(|l| (l - mean).powi(2)).sum::<f64>() / loads.len() as f64;
    variance.sqrt() / mean
}

fn performance_std_dev(state: &BalancerState) -> f64 {
    let mut all: Vec<f64> = Vec::new();
    for worker in &state.workers {
        all.extend(worker.recent_seconds.iter().rev().take(5));
    }
    if all.len() < 2 {
        return 0.0;
    }
    let mean = all.iter().sum::<f64>() / all.len() as f64;
    let variance = all.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / all.len() as f64;
    variance.sqrt()
}

/// Online weight adjustment, at most once per rebalance interval. Two
/// independent triggers: diverging task times bias toward `w_perf`, diverging
/// loads bias toward `w_load`. Whichever fired, the four weights are
/// renormalized back to summing to one.
fn maybe_rebalance(state: &mut BalancerState) {
    if state.last_rebalance.elapsed() < REBALANCE_INTERVAL {
        return;
    }

    let mut adjusted = false;
    if performance_std_dev(state) > PERFORMANCE_VARIANCE_THRESHOLD {
        state.performance_weight = (state.performance_weight + 0.1).min(0.6);
        state.load_weight = (state.load_weight - 0.05).max(0.2);
        adjusted = true;
    }
    if load_cv(state) > LOAD_IMBALANCE_THRESHOLD {
        state.load_weight = (state.load_weight + 0.1).min(0.6);
        state.performance_weight = (state.performance_weight - 0.05).max(0.2);
        adjusted = true;
    }
    if !adjusted {
        return;
    }
    state.last_rebalance = Instant::now();

    let total = state.performance_weight
        + state.load_weight
        + state.resource_weight
        + state.error_weight;
    if total > 0.0 {
        state.performance_weight /= total;
        state.load_weight /= total;
        state.resource_weight /= total;
        state.error_weight /= total;
    }
    debug!(
        w_perf = state.performance_weight,
        w_load = state.load_weight,
        w_res = state.resource_weight,
        w_err = state.error_weight,
        "rebalanced worker-selection weights"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_robin_cycles_through_workers() {
        let balancer = WorkerLoadBalancer::new(3, BalancingAlgorithm::RoundRobin);
        let picks: Vec<usize> = (0..6)
            .map(|_| balancer.select_worker(1.0).unwrap())
            .collect();
        assert_eq!(picks, vec![0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn least_loaded_prefers_idle_workers() {
        let balancer = WorkerLoadBalancer::new(3, BalancingAlgorithm::LeastLoaded);
        balancer.update_load(0, 2.0);
        balancer.update_load(1, 0.5);
        balancer.update_load(2, 1.0);
        assert_eq!(balancer.select_worker(1.0), Some(1));
    }

    #[test]
    fn adaptive_avoids_slow_and_failing_workers() {
        let balancer = WorkerLoadBalancer::new(2, BalancingAlgorithm::Adaptive);
        // Worker 0 is slow and error-prone; worker 1 is healthy.
        for _ in 0..5 {
            balancer.record_completion(0, 10.0, false);
            balancer.record_completion(1, 0.5, true);
        }
        assert_eq!(balancer.select_worker(1.0), Some(1));
    }

    #[test]
    fn adaptive_considers_current_load() {
        let balancer = WorkerLoadBalancer::new(2, BalancingAlgorithm::Adaptive);
        for _ in 0..5 {
            balancer.record_completion(0, 1.0, true);
            balancer.record_completion(1, 1.0, true);
        }
        balancer.update_load(0, 10.0);
        assert_eq!(balancer.select_worker(1.0), Some(1));
    }

    #[test]
    fn completion_history_is_bounded() {
        let balancer = WorkerLoadBalancer::new(1, BalancingAlgorithm::Adaptive);
        for _ in 0..100 {
            balancer.record_completion(0, 1.0, true);
        }
        let state = balancer.state.lock().unwrap();
        assert_eq!(state.workers[0].recent_seconds.len(), PERFORMANCE_HISTORY);
    }

    #[test]
    fn stats_report_weights_and_cv() {
        let balancer = WorkerLoadBalancer::new(2, BalancingAlgorithm::Adaptive);
        balancer.update_load(0, 4.0);
        let stats = balancer.stats().unwrap();
        assert_eq!(stats.worker_loads, vec![4.0, 0.0]);
        assert!((stats.performance_weight - 0.35).abs() < 1e-9);
        assert!((stats.error_weight - 0.1).abs() < 1e-9);
        assert!(stats.load_coefficient_of_variation > 0.0);
    }

    fn weight_sum(stats: &BalancerStats) -> f64 {
        stats.performance_weight + stats.load_weight + stats.resource_weight + stats.error_weight
    }

    #[test]
    fn performance_variance_alone_biases_toward_performance() {
        let balancer = WorkerLoadBalancer::new(2, BalancingAlgorithm::Adaptive);
        // Loads stay balanced (zero) while task times diverge wildly.
        for _ in 0..5 {
            balancer.record_completion(0, 0.1, true);
            balancer.record_completion(1, 5.0, true);
        }
        balancer.select_worker(1.0);

        let stats = balancer.stats().unwrap();
        assert!(
            stats.performance_weight > stats.load_weight,
            "{stats:?}"
        );
        assert!((weight_sum(&stats) - 1.0).abs() < 1e-9, "{stats:?}");
    }

    #[test]
    fn load_imbalance_alone_biases_toward_load() {
        let balancer = WorkerLoadBalancer::new(2, BalancingAlgorithm::Adaptive);
        // Uniform task times, heavily skewed load.
        for _ in 0..5 {
            balancer.record_completion(0, 1.0, true);
            balancer.record_completion(1, 1.0, true);
        }
        balancer.update_load(0, 10.0);
        balancer.select_worker(1.0);

        let stats = balancer.stats().unwrap();
        assert!(stats.load_weight > stats.performance_weight, "{stats:?}");
        assert!((weight_sum(&stats) - 1.0).abs() < 1e-9, "{stats:?}");
    }
}
