//! Time-window generation.

pub mod processor;
pub mod query;

use chrono::{DateTime, Duration, Utc};

use corvus_model::{TimeWindow, WindowId};

/// Lazily yields the sequence of scan windows from a global start to end.
///
/// Steps by the scanning interval; with interval equal to the window size the
/// windows tile the range without overlap. Ids are monotonic from zero.
#[derive(Debug, Clone)]
pub struct WindowGenerator {
    window_minutes: i64,
    interval_minutes: i64,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

impl WindowGenerator {
    pub fn new(
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        window_minutes: i64,
        interval_minutes: i64,
    ) -> Self {
        Self {
            window_minutes,
            interval_minutes,
            start,
            end,
        }
    }

    /// Number of windows the iterator will yield.
    pub fn total_windows(&self) -> u64 {
        if self.start >= self.end || self.interval_minutes <= 0 {
            return 0;
        }
        let total_minutes = (self.end - self.start).num_seconds() as f64 / 60.0;
        (total_minutes / self.interval_minutes as f64).ceil().max(1.0) as u64
    }

    pub fn iter(&self) -> WindowIter {
        WindowIter {
            window: Duration::minutes(self.window_minutes),
            interval: Duration::minutes(self.interval_minutes),
            current: self.start,
            end: self.end,
            next_id: 0,
        }
    }
}

impl IntoIterator for &WindowGenerator {
    type Item = TimeWindow;
    type IntoIter = WindowIter;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Iterator state for [`WindowGenerator`].
#[derive(Debug)]
pub struct WindowIter {
    window: Duration,
    interval: Duration,
    current: DateTime<Utc>,
    end: DateTime<Utc>,
    next_id: u64,
}

impl Iterator for WindowIter {
    type Item = TimeWindow;

    fn next(&mut self) -> Option<TimeWindow> {
        if self.current >= self.end {
            return None;
        }
        let window = TimeWindow::new(
            WindowId(self.next_id),
            self.current,
            self.current + self.window,
        );
        self.current += self.interval;
        self.next_id += 1;
        Some(window)
    }
}
