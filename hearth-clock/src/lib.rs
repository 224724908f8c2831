//! Framework clock and timer service for hearth
//!
//! All time-dependent behavior in hearth runs against a [`FrameworkClock`]
//! rather than the wall clock, so accelerated-time tests and real
//! deployments share identical consumer code. The [`TimerService`] fires
//! periodic timers and cron schedules when the framework drives it with
//! [`TimerService::tick`].

mod clock;
mod cron;
mod timer;

pub use clock::{FrameworkClock, SimulationClock, SystemClock};
pub use cron::{CronExpr, CronParseError};
pub use timer::{ScheduleHandle, TimerError, TimerHandle, TimerId, TimerService};
