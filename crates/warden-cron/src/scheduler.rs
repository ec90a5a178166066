//! Cron scheduler: owns the active entries and the background sweep loop.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, DurationRound, Timelike, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::CronEntry;

/// Handle returned by [`CronScheduler::add`]. Unique for the scheduler's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CronToken(u64);

impl fmt::Display for CronToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cron#{}", self.0)
    }
}

/// Source of wall-clock time for the sweep loop.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How long `stop` waits for the loop to exit.
    pub stop_timeout: Duration,
    /// Extra seconds slept past each minute boundary.
    pub minute_slack_secs: u32,
    /// Delay used when a sweep ran into the next minute.
    pub overrun_delay: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            stop_timeout: Duration::from_secs(5),
            minute_slack_secs: 2,
            overrun_delay: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Stopped,
    Running,
}

struct Runner {
    cancel: CancellationToken,
    /// Cancelled when the loop task exits.
    done: CancellationToken,
}

impl Runner {
    fn is_live(&self) -> bool {
        !self.done.is_cancelled()
    }
}

/// One pending run inside a swept minute.
struct DueRun {
    second: u32,
    token: CronToken,
    entry: Arc<CronEntry>,
}

/// Minute-resolution scheduler.
///
/// Entries are swept from a snapshot, so commands may add or cancel entries
/// while a sweep is in progress.
pub struct CronScheduler {
    entries: Mutex<BTreeMap<CronToken, Arc<CronEntry>>>,
    next_token: AtomicU64,
    clock: Arc<dyn Clock>,
    config: SchedulerConfig,
    runner: Mutex<Option<Runner>>,
}

impl CronScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: SchedulerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
            next_token: AtomicU64::new(1),
            clock,
            config,
            runner: Mutex::new(None),
        }
    }

    /// Insert an entry into the active set.
    pub fn add(&self, entry: CronEntry) -> CronToken {
        let token = CronToken(self.next_token.fetch_add(1, Ordering::SeqCst));
        debug!(%token, entry = %entry.name(), schedule = %entry.schedule(), "Cron entry added");
        self.lock_entries().insert(token, Arc::new(entry));
        token
    }

    /// Remove an entry. Unknown tokens are logged and ignored.
    pub fn cancel(&self, token: CronToken) -> bool {
        match self.lock_entries().remove(&token) {
            Some(entry) => {
                debug!(%token, entry = %entry.name(), "Cron entry cancelled");
                true
            }
            None => {
                warn!(%token, "Cancel of unknown cron entry ignored");
                false
            }
        }
    }

    /// Remove every entry bound to `owner`. Returns how many were removed.
    pub fn cancel_owned_by(&self, owner: &str) -> usize {
        let mut entries = self.lock_entries();
        let before = entries.len();
        entries.retain(|_, entry| entry.owner_name() != Some(owner));
        before - entries.len()
    }

    /// Active entries in insertion order.
    pub fn list(&self) -> Vec<(CronToken, Arc<CronEntry>)> {
        self.lock_entries()
            .iter()
            .map(|(token, entry)| (*token, entry.clone()))
            .collect()
    }

    pub fn get(&self, token: CronToken) -> Option<Arc<CronEntry>> {
        self.lock_entries().get(&token).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock_entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn state(&self) -> SchedulerState {
        match &*self.runner.lock().unwrap_or_else(PoisonError::into_inner) {
            Some(runner) if runner.is_live() => SchedulerState::Running,
            _ => SchedulerState::Stopped,
        }
    }

    /// Spawn the sweep loop. Must be called from within a Tokio runtime.
    ///
    /// Starting an already running scheduler logs a warning and does nothing.
    /// A loop that is still finishing after a timed-out `stop` counts as running.
    pub fn start(self: &Arc<Self>) {
        let mut runner = self.runner.lock().unwrap_or_else(PoisonError::into_inner);
        if runner.as_ref().is_some_and(Runner::is_live) {
            warn!("Cron scheduler already running");
            return;
        }
        let cancel = CancellationToken::new();
        let done = CancellationToken::new();
        let exit_guard = done.clone().drop_guard();
        let scheduler = self.clone();
        let loop_cancel = cancel.clone();
        tokio::spawn(async move {
            let _exit_guard = exit_guard;
            scheduler.run_loop(loop_cancel).await;
        });
        *runner = Some(Runner { cancel, done });
    }

    /// Signal the loop to exit and wait, bounded by `stop_timeout`.
    ///
    /// A command that is already running is not interrupted. If the wait times
    /// out the scheduler keeps reporting [`SchedulerState::Running`] until the
    /// loop has actually exited.
    pub async fn stop(&self) {
        let tokens = self
            .runner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|r| (r.cancel.clone(), r.done.clone()));
        let Some((cancel, done)) = tokens else {
            debug!("Cron scheduler not running");
            return;
        };
        cancel.cancel();
        if tokio::time::timeout(self.config.stop_timeout, done.cancelled())
            .await
            .is_err()
        {
            warn!(
                timeout = ?self.config.stop_timeout,
                "Cron scheduler did not stop in time, a command is still running"
            );
            return;
        }
        let mut runner = self.runner.lock().unwrap_or_else(PoisonError::into_inner);
        if runner.as_ref().is_some_and(|r| !r.is_live()) {
            *runner = None;
        }
    }

    /// Run every entry due in the minute containing `now`, without waiting
    /// for their seconds. Returns the number of runs.
    pub fn sweep(&self, now: DateTime<Utc>) -> usize {
        self.due_runs(now)
            .into_iter()
            .filter(|due| self.run_due(due))
            .count()
    }

    fn due_runs(&self, now: DateTime<Utc>) -> Vec<DueRun> {
        let snapshot = self.list();
        let mut due: Vec<DueRun> = snapshot
            .into_iter()
            .filter(|(_, entry)| entry.matches(&now))
            .flat_map(|(token, entry)| {
                entry
                    .schedule()
                    .run_seconds()
                    .into_iter()
                    .map(move |second| DueRun {
                        second,
                        token,
                        entry: entry.clone(),
                    })
            })
            .collect();
        due.sort_by_key(|d| (d.second, d.token));
        due
    }

    /// Run one due entry if it is still active, removing it once exhausted.
    fn run_due(&self, due: &DueRun) -> bool {
        if !self.lock_entries().contains_key(&due.token) {
            trace!(token = %due.token, "Cron entry cancelled before its run");
            return false;
        }
        let ran = due.entry.run();
        if due.entry.is_exhausted() && self.lock_entries().remove(&due.token).is_some() {
            debug!(token = %due.token, entry = %due.entry.name(), "Cron entry exhausted, removed");
        }
        ran
    }

    async fn run_loop(self: Arc<Self>, cancel: CancellationToken) {
        info!("Cron scheduler started");
        let mut last_swept: Option<DateTime<Utc>> = None;

        loop {
            let now = self.clock.now();
            let minute = truncate_to_minute(now);
            if last_swept == Some(minute) {
                trace!(%minute, "Minute already swept");
            } else {
                self.sweep_minute(minute, &cancel).await;
                last_swept = Some(minute);
            }
            if cancel.is_cancelled() {
                break;
            }

            let after = self.clock.now();
            let delay = if truncate_to_minute(after) > minute {
                warn!(
                    %minute,
                    "Cron sweep overran into the next minute; scheduled work is too heavy"
                );
                self.config.overrun_delay
            } else {
                next_minute_delay(after.second(), self.config.minute_slack_secs)
            };

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        info!("Cron scheduler stopped");
    }

    /// Commands run on the blocking pool so a slow one never holds a runtime
    /// worker. Runs within the minute stay sequential.
    async fn sweep_minute(self: &Arc<Self>, minute: DateTime<Utc>, cancel: &CancellationToken) {
        for due in self.due_runs(minute) {
            if cancel.is_cancelled() {
                return;
            }
            let at = minute + chrono::Duration::seconds(i64::from(due.second));
            if let Ok(wait) = (at - self.clock.now()).to_std() {
                if !wait.is_zero() {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
            }
            let scheduler = Arc::clone(self);
            if let Err(e) = tokio::task::spawn_blocking(move || scheduler.run_due(&due)).await {
                error!("Cron command task failed: {e}");
            }
        }
    }

    fn lock_entries(&self) -> std::sync::MutexGuard<'_, BTreeMap<CronToken, Arc<CronEntry>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for CronScheduler {
    fn default() -> Self {
        Self::new(SchedulerConfig::default())
    }
}

/// Time from `second` past the minute to `slack_secs` past the next one.
fn next_minute_delay(second: u32, slack_secs: u32) -> Duration {
    Duration::from_secs((60 + u64::from(slack_secs)).saturating_sub(u64::from(second)))
}

fn truncate_to_minute(t: DateTime<Utc>) -> DateTime<Utc> {
    t.duration_trunc(chrono::Duration::minutes(1)).unwrap_or(t)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Schedule, command};
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use warden_types::PluginState;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 4, h, m, s).unwrap()
    }

    fn counter() -> (Arc<AtomicUsize>, crate::Command) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        (
            count,
            command(move || {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        )
    }

    #[test]
    fn test_once_entry_removed_after_run() {
        let scheduler = CronScheduler::default();
        let (count, cmd) = counter();
        let token = scheduler.add(CronEntry::once("once", Schedule::every_minute(), cmd));

        for minute in 0..5 {
            scheduler.sweep(at(12, minute, 0));
        }
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(scheduler.get(token).is_none());
        assert!(scheduler.is_empty());
    }

    #[test]
    fn test_only_matching_minutes_run() {
        let scheduler = CronScheduler::default();
        let (count, cmd) = counter();
        let schedule = Schedule::new("*/15", "*", "*", "*", "*").unwrap();
        scheduler.add(CronEntry::new("quarter", schedule, cmd));

        for minute in 0..60 {
            scheduler.sweep(at(8, minute, 0));
        }
        assert_eq!(count.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_disabled_plugin_suspends_entry() {
        let scheduler = CronScheduler::default();
        let state = Arc::new(PluginState::new("tk"));
        let (count, cmd) = counter();
        scheduler.add(CronEntry::new("tick", Schedule::every_minute(), cmd).with_owner(state.clone()));

        state.set_enabled(false);
        assert_eq!(scheduler.sweep(at(9, 0, 0)), 0);
        assert_eq!(scheduler.sweep(at(9, 1, 0)), 0);
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(scheduler.len(), 1);

        state.set_enabled(true);
        assert_eq!(scheduler.sweep(at(9, 2, 0)), 1);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cancel_twice_and_unknown() {
        let scheduler = CronScheduler::default();
        let (_, a) = counter();
        let (count_b, b) = counter();
        let first = scheduler.add(CronEntry::new("a", Schedule::every_minute(), a));
        scheduler.add(CronEntry::new("b", Schedule::every_minute(), b));

        assert!(scheduler.cancel(first));
        assert!(!scheduler.cancel(first));
        assert!(!scheduler.cancel(CronToken(999)));
        assert_eq!(scheduler.len(), 1);
        assert_eq!(scheduler.sweep(at(0, 0, 0)), 1);
        assert_eq!(count_b.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_identical_entries_get_distinct_tokens() {
        let scheduler = CronScheduler::default();
        let (count, cmd) = counter();
        let a = scheduler.add(CronEntry::new("same", Schedule::every_minute(), cmd.clone()));
        let b = scheduler.add(CronEntry::new("same", Schedule::every_minute(), cmd));
        assert_ne!(a, b);
        scheduler.cancel(a);
        scheduler.sweep(at(0, 0, 0));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failing_command_does_not_stop_sweep() {
        let scheduler = CronScheduler::default();
        let (count, cmd) = counter();
        scheduler.add(CronEntry::new("err", Schedule::every_minute(), command(|| anyhow::bail!("nope"))));
        scheduler.add(CronEntry::new("panic", Schedule::every_minute(), command(|| panic!("bad"))));
        scheduler.add(CronEntry::new("ok", Schedule::every_minute(), cmd));

        assert_eq!(scheduler.sweep(at(1, 0, 0)), 3);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_entry_added_mid_sweep_waits_for_next_sweep() {
        let scheduler = Arc::new(CronScheduler::default());
        let (count, inner) = counter();
        let weak = Arc::downgrade(&scheduler);
        scheduler.add(CronEntry::once(
            "spawner",
            Schedule::every_minute(),
            command(move || {
                if let Some(scheduler) = weak.upgrade() {
                    scheduler.add(CronEntry::new("child", Schedule::every_minute(), inner.clone()));
                }
                Ok(())
            }),
        ));

        scheduler.sweep(at(1, 0, 0));
        assert_eq!(count.load(Ordering::SeqCst), 0);
        scheduler.sweep(at(1, 1, 0));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cancel_owned_by() {
        let scheduler = CronScheduler::default();
        let spree = Arc::new(PluginState::new("spree"));
        let (_, cmd) = counter();
        scheduler.add(CronEntry::new("a", Schedule::every_minute(), cmd.clone()).with_owner(spree.clone()));
        scheduler.add(CronEntry::new("b", Schedule::every_minute(), cmd.clone()).with_owner(spree));
        scheduler.add(CronEntry::new("core", Schedule::every_minute(), cmd));
        assert_eq!(scheduler.cancel_owned_by("spree"), 2);
        assert_eq!(scheduler.list().len(), 1);
    }

    #[test]
    fn test_runs_ordered_by_second() {
        let scheduler = CronScheduler::default();
        let order = Arc::new(Mutex::new(Vec::new()));
        for (name, second) in [("late", "45"), ("early", "5"), ("both", "0,30")] {
            let order = order.clone();
            let schedule = Schedule::every_minute().with_second(second).unwrap();
            scheduler.add(CronEntry::new(
                name,
                schedule,
                command(move || {
                    order.lock().unwrap().push(name);
                    Ok(())
                }),
            ));
        }
        assert_eq!(scheduler.sweep(at(3, 0, 0)), 4);
        assert_eq!(*order.lock().unwrap(), ["both", "early", "both", "late"]);
    }

    /// Wall clock that advances with Tokio's (pausable) clock.
    struct PausedClock {
        base: DateTime<Utc>,
        started: tokio::time::Instant,
    }

    impl Clock for PausedClock {
        fn now(&self) -> DateTime<Utc> {
            let elapsed = chrono::Duration::from_std(self.started.elapsed()).unwrap();
            self.base + elapsed
        }
    }

    fn paused_scheduler(base: DateTime<Utc>) -> Arc<CronScheduler> {
        let clock = PausedClock {
            base,
            started: tokio::time::Instant::now(),
        };
        Arc::new(CronScheduler::with_clock(SchedulerConfig::default(), Arc::new(clock)))
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_runs_once_per_minute() {
        let scheduler = paused_scheduler(at(12, 0, 0));
        let (count, cmd) = counter();
        let schedule = Schedule::new("*/1", "*", "*", "*", "*").unwrap();
        let token = scheduler.add(CronEntry::new("every", schedule, cmd));

        assert_eq!(scheduler.state(), SchedulerState::Stopped);
        scheduler.start();
        scheduler.start();
        tokio::time::sleep(Duration::from_secs(90)).await;
        assert_eq!(scheduler.state(), SchedulerState::Running);
        scheduler.stop().await;
        assert_eq!(scheduler.state(), SchedulerState::Stopped);

        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert_eq!(scheduler.get(token).unwrap().run_stats().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_waits_for_second() {
        let scheduler = paused_scheduler(at(12, 0, 0));
        let (count, cmd) = counter();
        let schedule = Schedule::every_minute().with_second(30).unwrap();
        scheduler.add(CronEntry::once("half", schedule, cmd));

        scheduler.start();
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(scheduler.is_empty());
        scheduler.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_interrupts_wait() {
        let scheduler = paused_scheduler(at(12, 0, 10));
        scheduler.start();
        tokio::task::yield_now().await;
        let started = tokio::time::Instant::now();
        scheduler.stop().await;
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(scheduler.state(), SchedulerState::Stopped);
    }

    #[test]
    fn test_next_minute_delay() {
        assert_eq!(next_minute_delay(0, 2), Duration::from_secs(62));
        assert_eq!(next_minute_delay(59, 0), Duration::from_secs(1));
        assert_eq!(
            next_minute_delay(30, u32::MAX),
            Duration::from_secs(u64::from(u32::MAX) + 30)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_mid_sweep_skips_later_seconds() {
        let scheduler = paused_scheduler(at(12, 0, 0));
        let (zero, zero_cmd) = counter();
        let (thirty, thirty_cmd) = counter();
        scheduler.add(CronEntry::new("zero", Schedule::every_minute(), zero_cmd));
        scheduler.add(CronEntry::new(
            "thirty",
            Schedule::every_minute().with_second(30).unwrap(),
            thirty_cmd,
        ));

        scheduler.start();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(zero.load(Ordering::SeqCst), 1);

        let stopping = tokio::time::Instant::now();
        scheduler.stop().await;
        assert!(stopping.elapsed() < Duration::from_secs(1));
        assert_eq!(scheduler.state(), SchedulerState::Stopped);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(zero.load(Ordering::SeqCst), 1);
        assert_eq!(thirty.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_blocking_command_does_not_stall_runtime() {
        let scheduler = Arc::new(CronScheduler::default());
        let started = Arc::new(AtomicBool::new(false));
        let flag = started.clone();
        scheduler.add(CronEntry::once(
            "slow",
            Schedule::every_minute().with_second("*").unwrap(),
            command(move || {
                flag.store(true, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(1500));
                Ok(())
            }),
        ));

        let begun = std::time::Instant::now();
        scheduler.start();
        while !started.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(begun.elapsed() < Duration::from_secs(1));

        scheduler.stop().await;
        assert_eq!(scheduler.state(), SchedulerState::Stopped);
        assert!(scheduler.is_empty());
    }

    #[tokio::test]
    async fn test_stop_timeout_keeps_running_until_loop_exits() {
        let config = SchedulerConfig {
            stop_timeout: Duration::from_millis(200),
            ..SchedulerConfig::default()
        };
        let scheduler = Arc::new(CronScheduler::new(config));
        let started = Arc::new(AtomicBool::new(false));
        let release = Arc::new(AtomicBool::new(false));
        let (started_flag, release_flag) = (started.clone(), release.clone());
        let every_second = Schedule::every_minute().with_second("*").unwrap();
        scheduler.add(CronEntry::once(
            "busy",
            every_second.clone(),
            command(move || {
                started_flag.store(true, Ordering::SeqCst);
                while !release_flag.load(Ordering::SeqCst) {
                    std::thread::sleep(Duration::from_millis(10));
                }
                Ok(())
            }),
        ));
        let (count, cmd) = counter();
        scheduler.add(CronEntry::new("after", every_second, cmd));

        scheduler.start();
        while !started.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let stopping = std::time::Instant::now();
        scheduler.stop().await;
        assert!(stopping.elapsed() < Duration::from_secs(1));
        assert_eq!(scheduler.state(), SchedulerState::Running);

        // The old loop still owns the scheduler, so this must not start a second one.
        scheduler.start();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);

        release.store(true, Ordering::SeqCst);
        tokio::time::timeout(Duration::from_secs(2), async {
            while scheduler.state() == SchedulerState::Running {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 0);

        scheduler.stop().await;
        assert_eq!(scheduler.state(), SchedulerState::Stopped);
    }
}
