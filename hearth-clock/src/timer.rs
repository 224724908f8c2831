//! Timer service driven by the framework clock
//!
//! Timers never sleep; the framework calls [`TimerService::tick`] after
//! advancing the clock and every due timer/schedule fires. Coincident
//! due-times fire in insertion order, a panicking callback is caught and
//! logged without cancelling its timer, and closing a handle guarantees
//! no further firings after `close` returns.

use crate::clock::FrameworkClock;
use crate::cron::{CronExpr, CronParseError};
use hearth_types::Timestamp;
use parking_lot::Mutex;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Identifier of a timer or schedule registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(pub u64);

static TIMER_COUNTER: AtomicU64 = AtomicU64::new(1);

impl TimerId {
    fn next() -> Self {
        Self(TIMER_COUNTER.fetch_add(1, Ordering::SeqCst))
    }
}

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timer:{}", self.0)
    }
}

/// Errors from timer/schedule registration.
#[derive(Debug, Error)]
pub enum TimerError {
    /// Periods must be strictly positive.
    #[error("timer period must be positive, got {0} ms")]
    InvalidPeriod(i64),
    /// The cron expression did not parse.
    #[error(transparent)]
    Cron(#[from] CronParseError),
    /// The cron expression never fires.
    #[error("cron expression never matches")]
    NeverFires,
}

type Callback = Box<dyn FnMut(Timestamp) + Send>;

enum Cadence {
    /// Fixed period in milliseconds, re-armed relative to the due time.
    Periodic(i64),
    /// Cron schedule; the next due time comes from the expression.
    Cron(CronExpr),
}

struct Entry {
    id: TimerId,
    cadence: Cadence,
    next_due: Timestamp,
    /// Insertion order, used to break due-time ties.
    seq: u64,
    /// Cleared by `close`; checked before every firing and reinsert.
    alive: Arc<AtomicBool>,
    callback: Callback,
}

#[derive(Default)]
struct Inner {
    entries: Vec<Entry>,
    seq: u64,
}

/// Registry of periodic timers and cron schedules.
///
/// Shared by cloning; all clones observe the same registrations.
#[derive(Clone)]
pub struct TimerService {
    clock: Arc<dyn FrameworkClock>,
    inner: Arc<Mutex<Inner>>,
}

impl TimerService {
    /// Create a timer service on the given clock.
    pub fn new(clock: Arc<dyn FrameworkClock>) -> Self {
        Self {
            clock,
            inner: Arc::new(Mutex::new(Inner::default())),
        }
    }

    /// The clock this service runs on.
    pub fn clock(&self) -> &Arc<dyn FrameworkClock> {
        &self.clock
    }

    /// Register a periodic timer. The first firing is one period from
    /// now; per-registration state belongs in the closure.
    pub fn create_timer(
        &self,
        period_ms: i64,
        listener: impl FnMut(Timestamp) + Send + 'static,
    ) -> Result<TimerHandle, TimerError> {
        if period_ms <= 0 {
            return Err(TimerError::InvalidPeriod(period_ms));
        }
        let id = TimerId::next();
        let alive = Arc::new(AtomicBool::new(true));
        let mut inner = self.inner.lock();
        inner.seq += 1;
        let seq = inner.seq;
        inner.entries.push(Entry {
            id,
            cadence: Cadence::Periodic(period_ms),
            next_due: self.clock.now().plus_millis(period_ms),
            seq,
            alive: alive.clone(),
            callback: Box::new(listener),
        });
        debug!(timer = %id, period_ms, "timer created");
        Ok(TimerHandle {
            id,
            inner: self.inner.clone(),
            alive,
        })
    }

    /// Register a cron schedule (`"min hour dom month dow"`).
    pub fn schedule(
        &self,
        cron_expr: &str,
        runnable: impl FnMut(Timestamp) + Send + 'static,
    ) -> Result<ScheduleHandle, TimerError> {
        let expr = CronExpr::parse(cron_expr)?;
        let now = self.clock.now();
        let next_due = expr.next_after(now).ok_or(TimerError::NeverFires)?;
        let id = TimerId::next();
        let alive = Arc::new(AtomicBool::new(true));
        let mut inner = self.inner.lock();
        inner.seq += 1;
        let seq = inner.seq;
        inner.entries.push(Entry {
            id,
            cadence: Cadence::Cron(expr),
            next_due,
            seq,
            alive: alive.clone(),
            callback: Box::new(runnable),
        });
        debug!(timer = %id, cron = cron_expr, "schedule created");
        Ok(ScheduleHandle(TimerHandle {
            id,
            inner: self.inner.clone(),
            alive,
        }))
    }

    /// Fire everything due at or before the clock's current time.
    ///
    /// Entries fire one at a time ordered by (due time, insertion
    /// order); the registry lock is released around each callback so
    /// callbacks may create or close timers. Missed periods collapse
    /// into a single firing.
    ///
    /// Returns the number of callbacks invoked.
    pub fn tick(&self) -> usize {
        let mut fired = 0;
        loop {
            let now = self.clock.now();
            let entry = {
                let mut inner = self.inner.lock();
                let due_idx = inner
                    .entries
                    .iter()
                    .enumerate()
                    .filter(|(_, e)| e.next_due <= now)
                    .min_by_key(|(_, e)| (e.next_due, e.seq))
                    .map(|(i, _)| i);
                match due_idx {
                    Some(i) => inner.entries.swap_remove(i),
                    None => break,
                }
            };
            let mut entry = entry;
            let due = entry.next_due;
            if entry.alive.load(Ordering::SeqCst) {
                let result = catch_unwind(AssertUnwindSafe(|| (entry.callback)(due)));
                fired += 1;
                if result.is_err() {
                    warn!(timer = %entry.id, "timer callback panicked; timer kept");
                }
            }
            // Re-arm and reinsert unless closed (possibly from inside
            // the callback itself).
            let next_due = match &entry.cadence {
                Cadence::Periodic(period) => {
                    let mut due = entry.next_due;
                    while due <= now {
                        due = due.plus_millis(*period);
                    }
                    Some(due)
                }
                Cadence::Cron(expr) => expr.next_after(now),
            };
            match next_due {
                Some(next_due) if entry.alive.load(Ordering::SeqCst) => {
                    entry.next_due = next_due;
                    self.inner.lock().entries.push(entry);
                }
                Some(_) => {}
                None => {
                    debug!(timer = %entry.id, "schedule exhausted");
                    entry.alive.store(false, Ordering::SeqCst);
                }
            }
        }
        fired
    }

    /// Number of open registrations.
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Whether no registrations are open.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Handle to a periodic timer; closing stops all further firings.
/// Clones close the same registration.
#[derive(Clone)]
pub struct TimerHandle {
    id: TimerId,
    inner: Arc<Mutex<Inner>>,
    alive: Arc<AtomicBool>,
}

impl TimerHandle {
    /// The registration id (for diagnostics).
    pub fn id(&self) -> TimerId {
        self.id
    }

    /// Whether the timer is still registered.
    pub fn is_open(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Deregister synchronously. No callback runs after this returns.
    /// Idempotent.
    pub fn close(&self) {
        if !self.alive.swap(false, Ordering::SeqCst) {
            return;
        }
        let mut inner = self.inner.lock();
        inner.entries.retain(|e| e.id != self.id);
        debug!(timer = %self.id, "timer closed");
    }
}

/// Handle to a cron schedule; closing stops all further firings.
/// Clones close the same registration.
#[derive(Clone)]
pub struct ScheduleHandle(TimerHandle);

impl ScheduleHandle {
    /// The registration id (for diagnostics).
    pub fn id(&self) -> TimerId {
        self.0.id()
    }

    /// Whether the schedule is still registered.
    pub fn is_open(&self) -> bool {
        self.0.is_open()
    }

    /// Deregister synchronously. Idempotent.
    pub fn close(&self) {
        self.0.close();
    }
}
