//! Event delivery and access arbitration for hearth
//!
//! The [`EventBroker`] gives every registered consumer one FIFO queue;
//! mutating callers only ever *enqueue*, and queues are drained by the
//! framework's dispatch pump so a slow or failing consumer callback can
//! never block a mutation or another consumer. The [`AccessArbiter`]
//! grants shared/exclusive write access per storage cell with
//! priority-based preemption, delivering revocations through the same
//! queues.

mod arbiter;
mod broker;

pub use arbiter::{AccessArbiter, AccessError, AccessMode, AccessPriority, GrantSnapshot};
pub use broker::{BrokerError, Event, EventBroker, PatternEvent};
