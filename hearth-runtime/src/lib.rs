//! Runtime coordinator for hearth
//!
//! The [`Runtime`] owns the resource graph, the event broker and
//! access arbiter, the pattern engine, the channel binding layer and
//! the timer service, and wires them together with a turn-based
//! dispatch pump: mutations enqueue change records, the pump routes
//! them to resource listeners first and the pattern engine second, and
//! then drains every consumer's queue. Applications implement
//! [`Application`] and interact solely through their [`AppContext`].

mod app;
mod runtime;

pub use app::{AppContext, Application, RuntimeError};
pub use runtime::{ReplayOp, Runtime, RuntimeStats};
