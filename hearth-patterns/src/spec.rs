//! Declarative pattern specifications

use hearth_types::ResourcePath;
use serde::{Deserialize, Serialize};

/// How strongly a slot is demanded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SlotRequirement {
    /// The slot must resolve to an existing, active, type-compatible
    /// resource for the pattern to be complete.
    Required,
    /// The slot never blocks completeness; it is resolved
    /// opportunistically and exposed when present.
    Optional,
    /// Like `Required`, and additionally the demanding consumer must
    /// not be locked out by a foreign exclusive grant on the slot.
    RequiredWritable,
}

/// One named sub-resource slot of a pattern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlotSpec {
    /// Name the slot is reported under in match callbacks.
    pub name: String,
    /// Fixed navigation path relative to the candidate root.
    pub rel_path: ResourcePath,
    /// Required type (structural compatibility).
    pub type_name: String,
    pub requirement: SlotRequirement,
}

/// A consumer-declared dependency constellation: a root type plus
/// named slots. Consumer-defined validity predicates are supplied at
/// demand registration, not here, so specs stay serializable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternSpec {
    /// Type candidate roots must be compatible with.
    pub root_type: String,
    pub slots: Vec<SlotSpec>,
}

impl PatternSpec {
    /// A pattern with no slots: any active resource of `root_type`.
    pub fn new(root_type: impl Into<String>) -> Self {
        Self {
            root_type: root_type.into(),
            slots: Vec::new(),
        }
    }

    /// Add a required slot.
    pub fn require(
        mut self,
        name: impl Into<String>,
        rel_path: ResourcePath,
        type_name: impl Into<String>,
    ) -> Self {
        self.slots.push(SlotSpec {
            name: name.into(),
            rel_path,
            type_name: type_name.into(),
            requirement: SlotRequirement::Required,
        });
        self
    }

    /// Add an optional slot.
    pub fn optional(
        mut self,
        name: impl Into<String>,
        rel_path: ResourcePath,
        type_name: impl Into<String>,
    ) -> Self {
        self.slots.push(SlotSpec {
            name: name.into(),
            rel_path,
            type_name: type_name.into(),
            requirement: SlotRequirement::Optional,
        });
        self
    }

    /// Add a required slot that must also be writable by the
    /// demanding consumer.
    pub fn require_writable(
        mut self,
        name: impl Into<String>,
        rel_path: ResourcePath,
        type_name: impl Into<String>,
    ) -> Self {
        self.slots.push(SlotSpec {
            name: name.into(),
            rel_path,
            type_name: type_name.into(),
            requirement: SlotRequirement::RequiredWritable,
        });
        self
    }

    /// Look up a slot by name.
    pub fn slot(&self, name: &str) -> Option<&SlotSpec> {
        self.slots.iter().find(|s| s.name == name)
    }
}
