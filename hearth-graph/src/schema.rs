//! Resource type descriptors and the structural type registry
//!
//! Types are descriptors resolved at graph-construction time, not an
//! inheritance hierarchy: compatibility is checked structurally (same
//! kind, declared slots agree by name and type) at `create` and by the
//! pattern engine.

use crate::error::GraphError;
use hearth_types::ValueKind;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// What a cell of this type carries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TypeKind {
    /// A leaf holding one [`hearth_types::Value`] of the given kind.
    Value(ValueKind),
    /// A composite with named sub-resources declared in `slots`.
    Struct,
    /// An ordered list of same-typed elements.
    List {
        /// Type name of the elements.
        elem: String,
    },
}

/// One declared sub-resource of a struct type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotDescriptor {
    pub name: String,
    pub type_name: String,
    /// Optional slots are not required by the declared parent type.
    pub optional: bool,
}

impl SlotDescriptor {
    pub fn required(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
            optional: false,
        }
    }

    pub fn optional(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
            optional: true,
        }
    }
}

/// A named resource type: value kind or composite schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeDescriptor {
    pub name: String,
    pub kind: TypeKind,
    /// Declared sub-resources; only meaningful for `Struct`.
    pub slots: Vec<SlotDescriptor>,
}

impl TypeDescriptor {
    /// A leaf value type.
    pub fn value(name: impl Into<String>, kind: ValueKind) -> Self {
        Self {
            name: name.into(),
            kind: TypeKind::Value(kind),
            slots: Vec::new(),
        }
    }

    /// A composite type with the given declared slots.
    pub fn composite(name: impl Into<String>, slots: Vec<SlotDescriptor>) -> Self {
        Self {
            name: name.into(),
            kind: TypeKind::Struct,
            slots,
        }
    }

    /// A list type owning elements of `elem`.
    pub fn list(name: impl Into<String>, elem: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: TypeKind::List { elem: elem.into() },
            slots: Vec::new(),
        }
    }

    /// Look up a declared slot by name.
    pub fn slot(&self, name: &str) -> Option<&SlotDescriptor> {
        self.slots.iter().find(|s| s.name == name)
    }

    /// The value kind, for leaf types.
    pub fn value_kind(&self) -> Option<ValueKind> {
        match self.kind {
            TypeKind::Value(kind) => Some(kind),
            _ => None,
        }
    }
}

/// Registry of resource type descriptors.
///
/// Registration is idempotent for identical descriptors and rejects
/// re-registration under the same name with a different shape (a
/// resource's type is immutable once created, so the descriptor must
/// be, too).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TypeRegistry {
    types: HashMap<String, TypeDescriptor>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a descriptor. Identical re-registration is a no-op.
    pub fn register(&mut self, descriptor: TypeDescriptor) -> Result<(), GraphError> {
        if let Some(existing) = self.types.get(&descriptor.name) {
            if *existing != descriptor {
                return Err(GraphError::TypeConflict {
                    path: descriptor.name.clone(),
                    existing: existing.name.clone(),
                    requested: descriptor.name,
                });
            }
            return Ok(());
        }
        self.types.insert(descriptor.name.clone(), descriptor);
        Ok(())
    }

    /// Look up a descriptor by name.
    pub fn get(&self, name: &str) -> Option<&TypeDescriptor> {
        self.types.get(name)
    }

    /// Like [`TypeRegistry::get`] but raising [`GraphError::UnknownType`].
    pub fn require(&self, name: &str) -> Result<&TypeDescriptor, GraphError> {
        self.types
            .get(name)
            .ok_or_else(|| GraphError::UnknownType(name.to_string()))
    }

    /// Structural compatibility of `requested` against `existing`.
    ///
    /// Kinds must agree; for structs, every slot declared by
    /// `requested` must exist in `existing` with the same type (width
    /// subtyping: the existing type may declare more).
    pub fn compatible(&self, existing: &str, requested: &str) -> bool {
        if existing == requested {
            return true;
        }
        let (Some(a), Some(b)) = (self.types.get(existing), self.types.get(requested)) else {
            return false;
        };
        match (&a.kind, &b.kind) {
            (TypeKind::Value(ka), TypeKind::Value(kb)) => ka == kb,
            (TypeKind::List { elem: ea }, TypeKind::List { elem: eb }) => {
                self.compatible(ea, eb)
            }
            (TypeKind::Struct, TypeKind::Struct) => b.slots.iter().all(|want| {
                a.slot(&want.name)
                    .is_some_and(|have| self.compatible(&have.type_name, &want.type_name))
            }),
            _ => false,
        }
    }

    /// Number of registered types.
    pub fn len(&self) -> usize {
        self.types.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> TypeRegistry {
        let mut reg = TypeRegistry::new();
        reg.register(TypeDescriptor::value("float", ValueKind::Float))
            .unwrap();
        reg.register(TypeDescriptor::value("bool", ValueKind::Bool))
            .unwrap();
        reg.register(TypeDescriptor::composite(
            "sensor",
            vec![
                SlotDescriptor::required("reading", "float"),
                SlotDescriptor::optional("enabled", "bool"),
            ],
        ))
        .unwrap();
        reg
    }

    #[test]
    fn test_register_idempotent_and_conflicting() {
        let mut reg = registry();
        // Identical re-registration is fine.
        reg.register(TypeDescriptor::value("float", ValueKind::Float))
            .unwrap();
        // Different shape under the same name is not.
        assert!(matches!(
            reg.register(TypeDescriptor::value("float", ValueKind::Int)),
            Err(GraphError::TypeConflict { .. })
        ));
    }

    #[test]
    fn test_value_compatibility_is_by_kind() {
        let mut reg = registry();
        reg.register(TypeDescriptor::value("temperature", ValueKind::Float))
            .unwrap();
        assert!(reg.compatible("float", "temperature"));
        assert!(!reg.compatible("float", "bool"));
    }

    #[test]
    fn test_struct_width_subtyping() {
        let mut reg = registry();
        reg.register(TypeDescriptor::composite(
            "readable",
            vec![SlotDescriptor::required("reading", "float")],
        ))
        .unwrap();
        // sensor declares everything readable wants.
        assert!(reg.compatible("sensor", "readable"));
        // ...but not the other way around.
        assert!(!reg.compatible("readable", "sensor"));
    }

    #[test]
    fn test_unknown_type() {
        let reg = registry();
        assert!(matches!(
            reg.require("missing"),
            Err(GraphError::UnknownType(_))
        ));
        assert!(!reg.compatible("float", "missing"));
    }
}
