//! Structural pattern matching for hearth
//!
//! A consumer declares a *pattern*: a root resource type plus named
//! slots, each a relative navigation path with a required type and a
//! required/optional flag. The [`PatternEngine`] maintains, per demand,
//! the set of graph locations that currently satisfy the pattern
//! completely, promoting and demoting candidates incrementally as the
//! graph mutates. Match and match-lost callbacks are delivered through
//! the owning consumer's broker queue.

mod engine;
mod spec;

pub use engine::{
    AcceptFn, CallbackPatternListener, DemandReport, MatchState, MatchView, PartialReport,
    PatternEngine, PatternError, PatternListener,
};
pub use spec::{PatternSpec, SlotRequirement, SlotSpec};
