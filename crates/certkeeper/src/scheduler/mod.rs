//! Background certificate renewal scheduler
//!
//! After a warm-up delay the scheduler runs one renewal check, then one per
//! check interval until stopped. Each run is bounded by a timeout; a run that
//! exceeds it is abandoned and recorded as failed, while the renewal already
//! in flight is left to finish on its own.
//!
//! ```text
//! Stopped --start()--> Running --stop()--> Stopping --(loop exits)--> Stopped
//! ```

mod stats;

use std::sync::Arc;
use std::time::Duration;

use certkeeper_config::{Config, ConfigError};
use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{AggregateError, SchedulerError};
use crate::manager::{BatchReport, RenewalSource};
use crate::notify::{self, LifecycleEvent, Notifier};

pub use stats::{SchedulerStats, SchedulerStatus};
use stats::RunOutcome;

/// Scheduler timing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerSettings {
    /// Time between checks
    pub check_interval: Duration,
    /// Upper bound on a single check
    pub run_timeout: Duration,
    /// Wait before the first check
    pub initial_delay: Duration,
    /// Warn about certificates this close to expiry that are still due after a run
    pub warn_days: u32,
}

impl SchedulerSettings {
    /// # Errors
    ///
    /// Returns the configuration error for an unparsable duration.
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        Ok(Self {
            check_interval: config.check_interval()?,
            run_timeout: config.run_timeout()?,
            initial_delay: config.initial_delay()?,
            warn_days: config.notification.warn_days(),
        })
    }
}

enum State {
    Stopped,
    Running(RunningTask),
    Stopping,
}

struct RunningTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
    interval_tx: watch::Sender<Duration>,
}

/// What a single check produced
enum RunResult {
    Completed(BatchReport),
    TimedOut,
    Crashed(String),
}

struct Inner {
    source: Arc<dyn RenewalSource>,
    notifier: Option<Arc<dyn Notifier>>,
    run_timeout: Duration,
    warn_days: u32,
    check_interval: Mutex<Duration>,
    stats: Mutex<SchedulerStats>,
}

/// Periodic renewal driver
pub struct RenewalScheduler {
    inner: Arc<Inner>,
    initial_delay: Duration,
    state: Mutex<State>,
}

impl RenewalScheduler {
    pub fn new(source: Arc<dyn RenewalSource>, settings: SchedulerSettings) -> Self {
        Self::build(source, settings, None)
    }

    /// Scheduler that sends run outcomes to `notifier`
    pub fn with_notifier(
        source: Arc<dyn RenewalSource>,
        settings: SchedulerSettings,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self::build(source, settings, Some(notifier))
    }

    fn build(
        source: Arc<dyn RenewalSource>,
        settings: SchedulerSettings,
        notifier: Option<Arc<dyn Notifier>>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                source,
                notifier,
                run_timeout: settings.run_timeout,
                warn_days: settings.warn_days,
                check_interval: Mutex::new(settings.check_interval),
                stats: Mutex::new(SchedulerStats::default()),
            }),
            initial_delay: settings.initial_delay,
            state: Mutex::new(State::Stopped),
        }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Start the background loop
    ///
    /// # Errors
    ///
    /// [`SchedulerError::AlreadyRunning`] or [`SchedulerError::Stopping`]
    /// unless the scheduler is stopped. Zero intervals are rejected with
    /// [`SchedulerError::InvalidInterval`].
    pub fn start(&self) -> Result<(), SchedulerError> {
        let mut state = self.state.lock();
        match *state {
            State::Stopped => {}
            State::Running(_) => return Err(SchedulerError::AlreadyRunning),
            State::Stopping => return Err(SchedulerError::Stopping),
        }

        let check_interval = *self.inner.check_interval.lock();
        if check_interval.is_zero() {
            return Err(SchedulerError::InvalidInterval);
        }

        let now = Utc::now();
        {
            let mut stats = self.inner.stats.lock();
            stats.start_time = Some(now);
            stats.next_run_time = after(now, self.initial_delay);
        }

        let cancel = CancellationToken::new();
        let (interval_tx, interval_rx) = watch::channel(check_interval);
        let handle = tokio::spawn(run_loop(
            Arc::clone(&self.inner),
            cancel.clone(),
            interval_rx,
            self.initial_delay,
        ));

        *state = State::Running(RunningTask {
            cancel,
            handle,
            interval_tx,
        });

        info!(
            check_interval_secs = check_interval.as_secs(),
            initial_delay_secs = self.initial_delay.as_secs(),
            run_timeout_secs = self.inner.run_timeout.as_secs(),
            "Started certificate renewal scheduler"
        );
        Ok(())
    }

    /// Stop the loop and wait for an in-flight run to finish
    ///
    /// Dropping the returned future before it completes still leaves the
    /// scheduler stopped; the cancelled loop then winds down detached.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::NotRunning`] if the scheduler is stopped,
    /// [`SchedulerError::Stopping`] if another stop is in progress.
    pub async fn stop(&self) -> Result<(), SchedulerError> {
        let task = {
            let mut state = self.state.lock();
            match std::mem::replace(&mut *state, State::Stopping) {
                State::Running(task) => task,
                State::Stopped => {
                    *state = State::Stopped;
                    return Err(SchedulerError::NotRunning);
                }
                State::Stopping => return Err(SchedulerError::Stopping),
            }
        };

        let stopped = StopGuard(self);
        info!("Stopping certificate renewal scheduler");
        task.cancel.cancel();
        if let Err(e) = task.handle.await {
            error!(error = %e, "Scheduler task ended abnormally");
        }
        drop(stopped);

        info!("Certificate renewal scheduler stopped");
        Ok(())
    }

    /// Run one check now, outside the timer
    ///
    /// Statistics are not touched. Returns the number of certificates renewed.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::Renewal`] naming failed domains,
    /// [`SchedulerError::Timeout`] if the run exceeded its bound.
    pub async fn run_once(&self) -> Result<usize, SchedulerError> {
        info!("Running manual certificate renewal check");

        let cancel = CancellationToken::new();
        match self.inner.execute(&cancel).await {
            RunResult::Completed(report) => {
                self.inner.notify_outcome(&report).await;
                if report.cancelled {
                    return Err(SchedulerError::Cancelled);
                }
                let renewed = report.renewed.len();
                match AggregateError::from_failures(report.failures, report.attempted) {
                    Some(aggregate) => Err(aggregate.into()),
                    None => Ok(renewed),
                }
            }
            RunResult::TimedOut => Err(SchedulerError::Timeout(self.inner.run_timeout)),
            RunResult::Crashed(reason) => {
                error!(reason = %reason, "Manual renewal check crashed");
                Err(SchedulerError::Aborted(reason))
            }
        }
    }

    /// Change the check interval of a running scheduler
    ///
    /// The next check happens one full `interval` from now. A run in progress
    /// is not interrupted.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::InvalidInterval`] for a zero interval,
    /// [`SchedulerError::NotRunning`] unless running.
    pub fn reschedule(&self, interval: Duration) -> Result<(), SchedulerError> {
        if interval.is_zero() {
            return Err(SchedulerError::InvalidInterval);
        }

        let state = self.state.lock();
        let State::Running(task) = &*state else {
            return Err(SchedulerError::NotRunning);
        };

        task.interval_tx
            .send(interval)
            .map_err(|_| SchedulerError::NotRunning)?;
        *self.inner.check_interval.lock() = interval;
        self.inner.stats.lock().next_run_time = after(Utc::now(), interval);

        info!(check_interval_secs = interval.as_secs(), "Rescheduled renewal checks");
        Ok(())
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    pub fn is_running(&self) -> bool {
        matches!(*self.state.lock(), State::Running(_))
    }

    pub fn stats(&self) -> SchedulerStats {
        self.inner.stats.lock().clone()
    }

    pub fn next_run_time(&self) -> Option<DateTime<Utc>> {
        self.inner.stats.lock().next_run_time
    }

    /// Time since the last start, while running
    pub fn uptime(&self) -> Option<Duration> {
        if !self.is_running() {
            return None;
        }
        let start = self.inner.stats.lock().start_time?;
        (Utc::now() - start).to_std().ok()
    }

    /// Zero the counters; `start_time` is kept
    pub fn reset_stats(&self) {
        self.inner.stats.lock().reset();
        debug!("Reset scheduler statistics");
    }

    pub fn status(&self) -> SchedulerStatus {
        let stats = self.stats();
        SchedulerStatus {
            is_running: self.is_running(),
            uptime: self.uptime(),
            next_run_time: stats.next_run_time,
            last_run_time: stats.last_run_time,
            check_interval: *self.inner.check_interval.lock(),
            stats,
        }
    }
}

/// Leaves `Stopping` for `Stopped` when dropped
struct StopGuard<'a>(&'a RenewalScheduler);

impl Drop for StopGuard<'_> {
    fn drop(&mut self) {
        self.0.inner.stats.lock().next_run_time = None;
        *self.0.state.lock() = State::Stopped;
    }
}

impl std::fmt::Debug for RenewalScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenewalScheduler")
            .field("is_running", &self.is_running())
            .field("check_interval", &*self.inner.check_interval.lock())
            .field("run_timeout", &self.inner.run_timeout)
            .field("has_notifier", &self.inner.notifier.is_some())
            .finish()
    }
}

// =============================================================================
// Run loop
// =============================================================================

async fn run_loop(
    inner: Arc<Inner>,
    cancel: CancellationToken,
    mut interval_rx: watch::Receiver<Duration>,
    initial_delay: Duration,
) {
    tokio::select! {
        _ = cancel.cancelled() => return,
        _ = tokio::time::sleep(initial_delay) => {}
    }

    inner.scheduled_run(&cancel).await;

    let mut ticker = new_ticker(*interval_rx.borrow_and_update());
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            changed = interval_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let period = *interval_rx.borrow_and_update();
                debug!(check_interval_secs = period.as_secs(), "Applying new check interval");
                ticker = new_ticker(period);
            }
            _ = ticker.tick() => {
                inner.scheduled_run(&cancel).await;
            }
        }
    }

    debug!("Scheduler loop exited");
}

/// Roughly 30 years, for periods too long to schedule
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// First tick one period from now
fn new_ticker(period: Duration) -> Interval {
    let start = Instant::now()
        .checked_add(period)
        .unwrap_or_else(|| Instant::now() + FAR_FUTURE);
    let mut ticker = interval_at(start, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

/// Wall-clock time `d` after `from`; `None` past the representable range
fn after(from: DateTime<Utc>, d: Duration) -> Option<DateTime<Utc>> {
    TimeDelta::from_std(d)
        .ok()
        .and_then(|delta| from.checked_add_signed(delta))
}

impl Inner {
    /// One timer-driven check, recorded in the statistics
    async fn scheduled_run(&self, cancel: &CancellationToken) {
        let started_at = Utc::now();
        let start = Instant::now();

        let outcome = match self.execute(cancel).await {
            RunResult::Completed(report) => {
                self.notify_outcome(&report).await;
                let renewed = report.renewed.len();
                if report.cancelled {
                    info!(renewed, "Renewal run cancelled by shutdown");
                    RunOutcome::Cancelled { renewed }
                } else if report.failures.is_empty() {
                    RunOutcome::Succeeded { renewed }
                } else {
                    RunOutcome::Failed { renewed }
                }
            }
            RunResult::TimedOut => {
                error!(
                    timeout_secs = self.run_timeout.as_secs(),
                    "Renewal run timed out"
                );
                RunOutcome::Failed { renewed: 0 }
            }
            RunResult::Crashed(reason) => {
                error!(reason = %reason, "Renewal run crashed");
                RunOutcome::Failed { renewed: 0 }
            }
        };

        let elapsed = start.elapsed();
        let next = after(Utc::now(), *self.check_interval.lock());
        {
            let mut stats = self.stats.lock();
            stats.record(outcome, started_at, elapsed);
            if !cancel.is_cancelled() {
                stats.next_run_time = next;
            }
        }

        match outcome {
            RunOutcome::Failed { renewed } => warn!(
                renewed,
                elapsed_ms = elapsed.as_millis() as u64,
                "Renewal run finished with failures"
            ),
            _ => info!(
                elapsed_ms = elapsed.as_millis() as u64,
                next_run = ?next,
                "Renewal run finished"
            ),
        }
    }

    /// Run the batch under the per-run timeout
    ///
    /// On timeout the batch keeps its current renewal but is told to stop
    /// before the next domain; its late report is only logged.
    async fn execute(&self, cancel: &CancellationToken) -> RunResult {
        let run_token = cancel.child_token();
        let source = Arc::clone(&self.source);
        let batch_token = run_token.clone();
        let mut batch = tokio::spawn(async move {
            let report = source.renew_due(&batch_token).await;
            if batch_token.is_cancelled() {
                debug!(
                    renewed = report.renewed.len(),
                    failed = report.failures.len(),
                    "Abandoned renewal batch wound down"
                );
            }
            report
        });

        match tokio::time::timeout(self.run_timeout, &mut batch).await {
            Ok(Ok(report)) => RunResult::Completed(report),
            Ok(Err(e)) => RunResult::Crashed(e.to_string()),
            Err(_) => {
                run_token.cancel();
                RunResult::TimedOut
            }
        }
    }

    async fn notify_outcome(&self, report: &BatchReport) {
        let Some(notifier) = &self.notifier else {
            return;
        };

        let health = self.source.check_certificate_health();

        for domain in &report.renewed {
            if let Some(h) = health.get(domain) {
                let event = LifecycleEvent::Renewed {
                    domain: domain.clone(),
                    expires_at: h.expires_at,
                };
                notify::deliver(notifier.as_ref(), &event).await;
            }
        }

        for failure in &report.failures {
            let event = LifecycleEvent::RenewalFailed {
                domain: failure.domain.clone(),
                error: failure.error.to_string(),
            };
            notify::deliver(notifier.as_ref(), &event).await;
        }

        for (domain, h) in &health {
            if h.needs_renewal && h.days_until_expiry <= i64::from(self.warn_days) {
                let event = LifecycleEvent::ExpiringSoon {
                    domain: domain.clone(),
                    expires_at: h.expires_at,
                    days: h.days_until_expiry,
                };
                notify::deliver(notifier.as_ref(), &event).await;
            }
        }
    }
}
