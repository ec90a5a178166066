//! warden-cron: minute-resolution scheduling for plugin tasks.
//!
//! A [`CronEntry`] pairs a [`Schedule`] with a command. The
//! [`CronScheduler`] sweeps its entries once per wall-clock minute on a
//! background task, runs the ones that match, and drops one-shot entries
//! once they are used up.

pub mod error;
pub mod rate;
pub mod schedule;
pub mod scheduler;

use std::collections::VecDeque;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, trace};

use warden_types::{PluginOwner, panic_message};

pub use error::{CronError, Result};
pub use rate::{Field, RateInput, RateSpec};
pub use schedule::Schedule;
pub use scheduler::{Clock, CronScheduler, CronToken, SchedulerConfig, SchedulerState, SystemClock};

/// Number of run durations kept per entry.
pub const DEFAULT_RUN_STATS_WINDOW: usize = 10;

/// The work a cron entry does.
pub type Command = Arc<dyn Fn() -> anyhow::Result<()> + Send + Sync>;

/// Wrap a closure as a [`Command`].
pub fn command<F>(f: F) -> Command
where
    F: Fn() -> anyhow::Result<()> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// A scheduled task.
pub struct CronEntry {
    name: String,
    schedule: Schedule,
    command: Command,
    /// 0 means unlimited.
    max_runs: u32,
    run_count: AtomicU32,
    run_stats: Mutex<VecDeque<Duration>>,
    stats_window: usize,
    owner: Option<Arc<dyn PluginOwner>>,
}

impl CronEntry {
    /// A recurring entry.
    pub fn new(name: impl Into<String>, schedule: Schedule, command: Command) -> Self {
        Self {
            name: name.into(),
            schedule,
            command,
            max_runs: 0,
            run_count: AtomicU32::new(0),
            run_stats: Mutex::new(VecDeque::new()),
            stats_window: DEFAULT_RUN_STATS_WINDOW,
            owner: None,
        }
    }

    /// An entry that runs a single time and is then removed.
    pub fn once(name: impl Into<String>, schedule: Schedule, command: Command) -> Self {
        Self::new(name, schedule, command).with_max_runs(1)
    }

    /// Bind the entry to a plugin; it is suspended while the plugin is disabled.
    pub fn with_owner(mut self, owner: Arc<dyn PluginOwner>) -> Self {
        self.owner = Some(owner);
        self
    }

    pub fn with_max_runs(mut self, max_runs: u32) -> Self {
        self.max_runs = max_runs;
        self
    }

    pub fn with_stats_window(mut self, window: usize) -> Self {
        self.stats_window = window.max(1);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn schedule(&self) -> &Schedule {
        &self.schedule
    }

    pub fn max_runs(&self) -> u32 {
        self.max_runs
    }

    pub fn run_count(&self) -> u32 {
        self.run_count.load(Ordering::SeqCst)
    }

    pub fn owner(&self) -> Option<&Arc<dyn PluginOwner>> {
        self.owner.as_ref()
    }

    pub fn owner_name(&self) -> Option<&str> {
        self.owner.as_ref().map(|o| o.name())
    }

    fn owner_enabled(&self) -> bool {
        self.owner.as_ref().is_none_or(|o| o.is_enabled())
    }

    /// Whether the entry should fire in the minute containing `now`.
    ///
    /// A disabled owner never matches.
    pub fn matches(&self, now: &DateTime<Utc>) -> bool {
        self.owner_enabled() && !self.is_exhausted() && self.schedule.matches_minute(now)
    }

    /// Whether `max_runs` has been reached.
    pub fn is_exhausted(&self) -> bool {
        self.max_runs > 0 && self.run_count() >= self.max_runs
    }

    /// Run the command once, catching errors and panics.
    ///
    /// Returns `false` without running when the owner is disabled or the
    /// entry is exhausted.
    pub fn run(&self) -> bool {
        if !self.owner_enabled() {
            trace!(entry = %self.name, "Owner disabled, skipping run");
            return false;
        }
        let claimed = self
            .run_count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |count| {
                (self.max_runs == 0 || count < self.max_runs).then_some(count + 1)
            });
        if claimed.is_err() {
            return false;
        }

        let started = Instant::now();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| (self.command)()));
        let elapsed = started.elapsed();
        self.push_stat(elapsed);

        let owner = self.owner_name().unwrap_or("-");
        match outcome {
            Ok(Ok(())) => debug!(entry = %self.name, owner, ?elapsed, "Cron entry ran"),
            Ok(Err(e)) => error!(entry = %self.name, owner, "Cron command failed: {e:?}"),
            Err(payload) => error!(
                entry = %self.name,
                owner,
                "Cron command panicked: {}",
                panic_message(payload.as_ref())
            ),
        }
        true
    }

    fn push_stat(&self, elapsed: Duration) {
        let mut stats = self.run_stats.lock().unwrap_or_else(PoisonError::into_inner);
        if stats.len() == self.stats_window {
            stats.pop_front();
        }
        stats.push_back(elapsed);
    }

    /// Durations of the most recent runs, oldest first.
    pub fn run_stats(&self) -> Vec<Duration> {
        self.run_stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .copied()
            .collect()
    }

    /// Admin-facing view of the entry.
    pub fn summary(&self) -> EntrySummary {
        let ms: Vec<f64> = self
            .run_stats()
            .iter()
            .map(|d| d.as_micros() as f64 / 1000.0)
            .collect();
        let (min_ms, max_ms, mean_ms) = if ms.is_empty() {
            (0.0, 0.0, 0.0)
        } else {
            (
                ms.iter().copied().fold(f64::INFINITY, f64::min),
                ms.iter().copied().fold(f64::NEG_INFINITY, f64::max),
                ms.iter().sum::<f64>() / ms.len() as f64,
            )
        };
        EntrySummary {
            name: self.name.clone(),
            owner: self.owner_name().map(str::to_string),
            schedule: self.schedule.to_string(),
            run_count: self.run_count(),
            max_runs: self.max_runs,
            samples: ms.len(),
            min_ms,
            max_ms,
            mean_ms,
        }
    }
}

impl fmt::Debug for CronEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CronEntry")
            .field("name", &self.name)
            .field("schedule", &self.schedule.to_string())
            .field("owner", &self.owner_name())
            .field("max_runs", &self.max_runs)
            .field("run_count", &self.run_count())
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntrySummary {
    pub name: String,
    pub owner: Option<String>,
    pub schedule: String,
    pub run_count: u32,
    pub max_runs: u32,
    pub samples: usize,
    pub min_ms: f64,
    pub max_ms: f64,
    pub mean_ms: f64,
}
