//! Rolling handler latency statistics, per (owner, event key).

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;

/// Number of latencies kept per (owner, event) pair.
pub const DEFAULT_STATS_WINDOW: usize = 100;

/// Aggregate over the retained latencies of one (owner, event) pair.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HandlingSummary {
    pub owner: String,
    pub event: String,
    pub samples: usize,
    pub min_ms: f64,
    pub max_ms: f64,
    pub mean_ms: f64,
    pub stddev_ms: f64,
}

pub struct HandlingStats {
    window: usize,
    samples: Mutex<HashMap<(String, String), VecDeque<Duration>>>,
}

impl HandlingStats {
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            samples: Mutex::new(HashMap::new()),
        }
    }

    /// Append a latency, evicting the oldest beyond the window.
    pub fn record(&self, owner: &str, event: &str, elapsed: Duration) {
        let mut samples = self.samples.lock().unwrap_or_else(PoisonError::into_inner);
        let history = samples
            .entry((owner.to_string(), event.to_string()))
            .or_default();
        if history.len() == self.window {
            history.pop_front();
        }
        history.push_back(elapsed);
    }

    /// Summaries for every pair seen so far, sorted by owner then event.
    pub fn summaries(&self) -> Vec<HandlingSummary> {
        let samples = self.samples.lock().unwrap_or_else(PoisonError::into_inner);
        let mut out: Vec<HandlingSummary> = samples
            .iter()
            .filter(|(_, history)| !history.is_empty())
            .map(|((owner, event), history)| {
                let ms: Vec<f64> = history.iter().map(|d| d.as_micros() as f64 / 1000.0).collect();
                let (min_ms, max_ms, mean_ms, stddev_ms) = describe(&ms);
                HandlingSummary {
                    owner: owner.clone(),
                    event: event.clone(),
                    samples: ms.len(),
                    min_ms,
                    max_ms,
                    mean_ms,
                    stddev_ms,
                }
            })
            .collect();
        out.sort_by(|a, b| (&a.owner, &a.event).cmp(&(&b.owner, &b.event)));
        out
    }

    pub fn window(&self) -> usize {
        self.window
    }
}

impl Default for HandlingStats {
    fn default() -> Self {
        Self::new(DEFAULT_STATS_WINDOW)
    }
}

/// min, max, mean and sample standard deviation. Empty input gives zeros.
fn describe(values: &[f64]) -> (f64, f64, f64, f64) {
    if values.is_empty() {
        return (0.0, 0.0, 0.0, 0.0);
    }
    let n = values.len() as f64;
    let min = values.iter().copied().fold(f64::INFINITY, f64::min);
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let mean = values.iter().sum::<f64>() / n;
    let stddev = if values.len() > 1 {
        (values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0)).sqrt()
    } else {
        0.0
    };
    (min, max, mean, stddev)
}
