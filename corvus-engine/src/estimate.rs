//! Adaptive completion-time estimation.
//!
//! Five strategies produce independent estimates from the same measurement
//! history; a selector scores each by `confidence * strategy_weight`, with a
//! 1.1x bonus for trend-aware results, and reports the winner. Weights adapt
//! as earlier predictions are graded against what actually happened.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Instant;

use chrono::{DateTime, Duration, Utc};
use tracing::trace;

/// Measurements retained for estimation.
const MEASUREMENT_CAPACITY: usize = 200;
/// Estimates require at least this many measurements.
const MIN_MEASUREMENTS: usize = 5;
/// Recent measurements considered by each strategy.
const TREND_WINDOW: usize = 20;
/// Score bonus for strategies that report a known trend.
const TREND_BONUS: f64 = 1.1;

/// One processed batch of windows, as fed to the estimator.
#[derive(Debug, Clone, Copy)]
pub struct Measurement {
    /// Seconds since estimation started.
    pub at_seconds: f64,
    pub windows_processed: u64,
    pub processing_seconds: f64,
    pub records_processed: u64,
    pub memory_mb: Option<f64>,
}

impl Measurement {
    fn windows_per_second(&self) -> Option<f64> {
        (self.processing_seconds > 0.0)
            .then(|| self.windows_processed as f64 / self.processing_seconds)
    }
}

/// Observed performance direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    Improving,
    Stable,
    Degrading,
    Unknown,
}

/// A single strategy's completion estimate.
#[derive(Debug, Clone)]
pub struct Estimate {
    pub eta: Option<DateTime<Utc>>,
    pub seconds_remaining: Option<f64>,
    pub confidence: f64,
    pub windows_per_second: f64,
    pub records_per_second: f64,
    pub method: &'static str,
    pub trend: Trend,
}

/// A pluggable estimation strategy.
pub trait EstimationStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Produce an estimate from recent measurements, or `None` when the
    /// strategy cannot apply to the data it was given.
    fn estimate(
        &self,
        measurements: &[Measurement],
        windows_processed: u64,
        total_windows: u64,
    ) -> Option<Estimate>;
}

fn finish(
    method: &'static str,
    rate: f64,
    confidence: f64,
    trend: Trend,
    measurements: &[Measurement],
    windows_processed: u64,
    total_windows: u64,
) -> Option<Estimate> {
    if rate <= 0.0 || !rate.is_finite() {
        return None;
    }
    let remaining_windows = total_windows.saturating_sub(windows_processed) as f64;
    let seconds_remaining = remaining_windows / rate;

    let total_records: u64 = measurements.iter().map(|m| m.records_processed).sum();
    let total_time: f64 = measurements.iter().map(|m| m.processing_seconds).sum();
    let records_per_second = if total_time > 0.0 {
        total_records as f64 / total_time
    } else {
        0.0
    };

    Some(Estimate {
        eta: Some(Utc::now() + Duration::milliseconds((seconds_remaining * 1000.0) as i64)),
        seconds_remaining: Some(seconds_remaining),
        confidence,
        windows_per_second: rate,
        records_per_second,
        method,
        trend,
    })
}

/// Rates per measurement, skipping zero-duration samples.
fn rates(measurements: &[Measurement]) -> Vec<f64> {
    measurements
        .iter()
        .filter_map(Measurement::windows_per_second)
        .collect()
}

/// Compare first-half and second-half average rates.
fn analyze_trend(measurements: &[Measurement]) -> Trend {
    let rates = rates(measurements);
    if rates.len() < 3 {
        return Trend::Unknown;
    }
    let mid = rates.len() / 2;
    let first: f64 = rates[..mid].iter().sum::<f64>() / mid as f64;
    let second: f64 = rates[mid..].iter().sum::<f64>() / (rates.len() - mid) as f64;
    if first <= 0.0 {
        return Trend::Unknown;
    }
    let change_percent = (second - first) / first * 100.0;
    if change_percent > 5.0 {
        Trend::Improving
    } else if change_percent < -5.0 {
        Trend::Degrading
    } else {
        Trend::Stable
    }
}

fn regression_slope(points: &[(f64, f64)]) -> Option<f64> {
    let n = points.len() as f64;
    let sum_x: f64 = points.iter().map(|(x, _)| x).sum();
    let sum_y: f64 = points.iter().map(|(_, y)| y).sum();
    let sum_xy: f64 = points.iter().map(|(x, y)| x * y).sum();
    let sum_x2: f64 = points.iter().map(|(x, _)| x * x).sum();
    let denominator = n * sum_x2 - sum_x * sum_x;
    if denominator == 0.0 {
        None
    } else {
        Some((n * sum_xy - sum_x * sum_y) / denominator)
    }
}

/// Plain average of recent rates.
#[derive(Debug, Default)]
pub struct SimpleAverage;

impl EstimationStrategy for SimpleAverage {
    fn name(&self) -> &'static str {
        "simple_average"
    }

    fn estimate(
        &self,
        measurements: &[Measurement],
        windows_processed: u64,
        total_windows: u64,
    ) -> Option<Estimate> {
        let total_time: f64 = measurements.iter().map(|m| m.processing_seconds).sum();
        if total_time <= 0.0 {
            return None;
        }
        let windows: u64 = measurements.iter().map(|m| m.windows_processed).sum();
        let rate = windows as f64 / total_time;
        let confidence = (measurements.len() as f64 / TREND_WINDOW as f64).min(0.8);
        finish(
            self.name(),
            rate,
            confidence,
            analyze_trend(measurements),
            measurements,
            windows_processed,
            total_windows,
        )
    }
}

/// Recency-weighted average, newest measurements counting most.
#[derive(Debug, Default)]
pub struct WeightedAverage;

impl EstimationStrategy for WeightedAverage {
    fn name(&self) -> &'static str {
        "weighted_average"
    }

    fn estimate(
        &self,
        measurements: &[Measurement],
        windows_processed: u64,
        total_windows: u64,
    ) -> Option<Estimate> {
        let total_weight: f64 = (1..=measurements.len()).map(|w| w as f64).sum();
        if total_weight <= 0.0 {
            return None;
        }
        let mut rate = 0.0;
        for (index, measurement) in measurements.iter().enumerate() {
            if let Some(r) = measurement.windows_per_second() {
                rate += r * (index + 1) as f64 / total_weight;
            }
        }
        let confidence = (measurements.len() as f64 / TREND_WINDOW as f64).min(0.9);
        finish(
            self.name(),
            rate,
            confidence,
            analyze_trend(measurements),
            measurements,
            windows_processed,
            total_windows,
        )
    }
}

/// Regression of cumulative windows over wall time.
#[derive(Debug, Default)]
pub struct LinearRegression;

impl EstimationStrategy for LinearRegression {
    fn name(&self) -> &'static str {
        "linear_regression"
    }

    fn estimate(
        &self,
        measurements: &[Measurement],
        windows_processed: u64,
        total_windows: u64,
    ) -> Option<Estimate> {
        if measurements.len() < 10 {
            return None;
        }
        let origin = measurements.first()?.at_seconds;
        let mut cumulative = 0u64;
        let points: Vec<(f64, f64)> = measurements
            .iter()
            .map(|m| {
                cumulative += m.windows_processed;
                (m.at_seconds - origin, cumulative as f64)
            })
            .collect();
        let slope = regression_slope(&points)?;
        let confidence = (measurements.len() as f64 / TREND_WINDOW as f64).min(0.85);
        finish(
            self.name(),
            slope,
            confidence,
            analyze_trend(measurements),
            measurements,
            windows_processed,
            total_windows,
        )
    }
}

/// Exponentially smoothed rate with a fixed smoothing factor.
#[derive(Debug)]
pub struct ExponentialSmoothing {
    pub alpha: f64,
}

impl Default for ExponentialSmoothing {
    fn default() -> Self {
        Self { alpha: 0.3 }
    }
}

impl EstimationStrategy for ExponentialSmoothing {
    fn name(&self) -> &'static str {
        "exponential_smoothing"
    }

    fn estimate(
        &self,
        measurements: &[Measurement],
        windows_processed: u64,
        total_windows: u64,
    ) -> Option<Estimate> {
        let rates = rates(measurements);
        let mut smoothed = *rates.first()?;
        for rate in &rates[1..] {
            smoothed = self.alpha * rate + (1.0 - self.alpha) * smoothed;
        }
        let confidence = (measurements.len() as f64 / TREND_WINDOW as f64).min(0.9);
        finish(
            self.name(),
            smoothed,
            confidence,
            analyze_trend(measurements),
            measurements,
            windows_processed,
            total_windows,
        )
    }
}

/// Projects the rate forward along its fitted trend before estimating.
#[derive(Debug, Default)]
pub struct TrendAdjusted;

impl EstimationStrategy for TrendAdjusted {
    fn name(&self) -> &'static str {
        "trend_adjusted"
    }

    fn estimate(
        &self,
        measurements: &[Measurement],
        windows_processed: u64,
        total_windows: u64,
    ) -> Option<Estimate> {
        if measurements.len() < 5 {
            return None;
        }
        let rates = rates(measurements);
        if rates.is_empty() {
            return None;
        }
        let trend_slope = if rates.len() >= 3 {
            let points: Vec<(f64, f64)> = rates
                .iter()
                .enumerate()
                .map(|(i, r)| (i as f64, *r))
                .collect();
            regression_slope(&points).unwrap_or(0.0)
        } else {
            0.0
        };

        let tail = &rates[rates.len().saturating_sub(3)..];
        let current_rate: f64 = tail.iter().sum::<f64>() / tail.len() as f64;

        let remaining_windows = total_windows.saturating_sub(windows_processed) as f64;
        let avg_windows_per_measurement: f64 = measurements
            .iter()
            .map(|m| m.windows_processed as f64)
            .sum::<f64>()
            / measurements.len() as f64;
        let future_measurements = if avg_windows_per_measurement > 0.0 {
            remaining_windows / avg_windows_per_measurement
        } else {
            1.0
        };

        let future_rate =
            (current_rate + trend_slope * future_measurements).max(current_rate * 0.1);
        let adjusted_rate = (current_rate + future_rate) / 2.0;

        let trend = if trend_slope.abs() < 0.01 {
            Trend::Stable
        } else if trend_slope > 0.0 {
            Trend::Improving
        } else {
            Trend::Degrading
        };

        let confidence = (measurements.len() as f64 / TREND_WINDOW as f64).min(0.95);
        finish(
            self.name(),
            adjusted_rate,
            confidence,
            trend,
            measurements,
            windows_processed,
            total_windows,
        )
    }
}

struct EstimatorState {
    measurements: VecDeque<Measurement>,
    weights: Vec<f64>,
    last_estimate: Option<(Instant, Estimate)>,
}

/// Multi-strategy estimator with confidence-weighted selection.
pub struct AdaptiveTimeEstimator {
    strategies: Vec<Box<dyn EstimationStrategy>>,
    state: Mutex<EstimatorState>,
    started: Instant,
}

impl std::fmt::Debug for AdaptiveTimeEstimator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self
            .state
            .lock()
            .map(|s| s.measurements.len())
            .unwrap_or(0);
        f.debug_struct("AdaptiveTimeEstimator")
            .field("strategies", &self.strategies.len())
            .field("measurements", &count)
            .finish()
    }
}

impl Default for AdaptiveTimeEstimator {
    fn default() -> Self {
        Self::new()
    }
}

impl AdaptiveTimeEstimator {
    pub fn new() -> Self {
        let strategies: Vec<Box<dyn EstimationStrategy>> = vec![
            Box::new(SimpleAverage),
            Box::new(WeightedAverage),
            Box::new(LinearRegression),
            Box::new(ExponentialSmoothing::default()),
            Box::new(TrendAdjusted),
        ];
        let weights = vec![1.0; strategies.len()];
        Self {
            strategies,
            state: Mutex::new(EstimatorState {
                measurements: VecDeque::new(),
                weights,
                last_estimate: None,
            }),
            started: Instant::now(),
        }
    }

    /// Record one processed batch.
    pub fn add_measurement(
        &self,
        windows_processed: u64,
        processing_seconds: f64,
        records_processed: u64,
        memory_mb: Option<f64>,
    ) {
        let measurement = Measurement {
            at_seconds: self.started.elapsed().as_secs_f64(),
            windows_processed,
            processing_seconds,
            records_processed,
            memory_mb,
        };
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        state.measurements.push_back(measurement);
        while state.measurements.len() > MEASUREMENT_CAPACITY {
            state.measurements.pop_front();
        }
    }

    pub fn measurement_count(&self) -> usize {
        self.state.lock().map(|s| s.measurements.len()).unwrap_or(0)
    }

    /// Best available completion estimate, or `None` until five measurements
    /// have been recorded or when every strategy declines.
    pub fn estimate_completion(
        &self,
        windows_processed: u64,
        total_windows: u64,
    ) -> Option<Estimate> {
        let Ok(mut state) = self.state.lock() else {
            return None;
        };
        if state.measurements.len() < MIN_MEASUREMENTS {
            return None;
        }

        let recent: Vec<Measurement> = state
            .measurements
            .iter()
            .rev()
            .take(TREND_WINDOW)
            .rev()
            .copied()
            .collect();

        let mut best: Option<(f64, Estimate)> = None;
        for (index, strategy) in self.strategies.iter().enumerate() {
            let Some(estimate) =
                strategy.estimate(&recent, windows_processed, total_windows)
            else {
                continue;
            };
            let mut score = estimate.confidence * state.weights[index];
            if estimate.trend != Trend::Unknown {
                score *= TREND_BONUS;
            }
            trace!(method = estimate.method, score, "strategy estimate");
            if best.as_ref().is_none_or(|(s, _)| score > *s) {
                best = Some((score, estimate));
            }
        }

        let (_, winner) = best?;
        self.grade_previous(&mut state, &winner);
        state.last_estimate = Some((Instant::now(), winner.clone()));
        Some(winner)
    }

    /// Fold the error of the previous winning estimate back into its
    /// strategy's weight: accurate predictions gain, poor ones decay.
    fn grade_previous(&self, state: &mut EstimatorState, current: &Estimate) {
        let Some((when, previous)) = state.last_estimate.take() else {
            return;
        };
        let (Some(predicted), Some(now_remaining)) =
            (previous.seconds_remaining, current.seconds_remaining)
        else {
            return;
        };
        let elapsed = when.elapsed().as_secs_f64();
        let actual_change = predicted - now_remaining;
        let error = (actual_change - elapsed).abs() / elapsed.max(1.0);
        if let Some(index) = self
            .strategies
            .iter()
            .position(|s| s.name() == previous.method)
        {
            let accuracy = 1.0 / (1.0 + error);
            state.weights[index] = (0.9 * state.weights[index] + 0.1 * accuracy).clamp(0.1, 1.5);
        }
    }
}
