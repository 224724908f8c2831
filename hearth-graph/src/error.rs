//! Error types for the resource graph store
//!
//! Structural errors are returned synchronously to the caller of the
//! store API; they indicate caller bugs, not recoverable runtime
//! conditions.

use hearth_types::{ResourcePath, ValueKind};
use thiserror::Error;

/// Errors raised by [`crate::ResourceGraph`] operations.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum GraphError {
    /// Operation on a location or path that does not exist (including
    /// paths through dangling references).
    #[error("resource not found: {0}")]
    NotFound(String),

    /// A sibling with the same name exists and cannot be unified with
    /// the request (e.g. a dangling reference or an owned child where a
    /// reference was asked for).
    #[error("resource already exists with a conflicting shape: {0}")]
    AlreadyExists(String),

    /// Create-time type incompatibility with an existing resource or a
    /// declared slot.
    #[error("type conflict at {path}: existing {existing}, requested {requested}")]
    TypeConflict {
        path: String,
        existing: String,
        requested: String,
    },

    /// The type name is not registered.
    #[error("unknown resource type: {0}")]
    UnknownType(String),

    /// The parent type does not declare a child of this name; use a
    /// decorator for undeclared children.
    #[error("type {parent_type} declares no sub-resource {name:?}")]
    UndeclaredChild { parent_type: String, name: String },

    /// Value write with the wrong kind for the cell.
    #[error("value kind mismatch at {path}: cell holds {expected:?}, got {got:?}")]
    ValueKindMismatch {
        path: String,
        expected: ValueKind,
        got: ValueKind,
    },

    /// Value access on a composite (struct or list) cell.
    #[error("resource {0} is not a value resource")]
    NotAValue(String),

    /// List operation on a non-list cell.
    #[error("resource {0} is not a list resource")]
    NotAList(String),

    /// List element index out of range.
    #[error("list index {index} out of bounds (len {len}) at {path}")]
    IndexOutOfBounds {
        path: String,
        index: usize,
        len: usize,
    },

    /// Reference creation that would alias a cell into its own subtree.
    #[error("reference from {from} to {to} would form a cycle")]
    CycleDetected { from: String, to: String },
}

impl GraphError {
    /// Shorthand for [`GraphError::NotFound`] from a path.
    pub fn not_found(path: &ResourcePath) -> Self {
        GraphError::NotFound(path.to_string())
    }
}
