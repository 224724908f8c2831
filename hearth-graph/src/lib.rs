//! Resource graph store for hearth
//!
//! The graph is a tree of strongly-typed storage cells augmented with
//! non-tree *reference* edges (aliases sharing the target's storage) and
//! *decorators* (dynamically attached children outside a type's declared
//! schema). Every mutation appends an ordered [`ChangeRecord`] consumed
//! by the event broker and the pattern engine, and independently
//! tailable by the persistence collaborator.

mod change;
mod error;
mod schema;
mod store;

pub use change::{ChangeKind, ChangeLog, ChangeRecord, CursorId};
pub use error::GraphError;
pub use schema::{SlotDescriptor, TypeDescriptor, TypeKind, TypeRegistry};
pub use store::{ResourceGraph, SharedGraph};
