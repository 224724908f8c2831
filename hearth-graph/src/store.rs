//! The resource graph store
//!
//! Cells live in an arena keyed by [`Location`]; the tree structure is
//! kept as named child links on each cell. A child link is either
//! *owned* (the normal parent/child edge) or a *reference*: an alias
//! to another cell's location with shared identity, not ownership.
//! Traversal follows owned edges and resolves reference edges one hop;
//! it never chains through aliases, so reference handling stays flat.

use crate::change::{ChangeKind, ChangeLog, ChangeRecord, CursorId};
use crate::error::GraphError;
use crate::schema::{TypeDescriptor, TypeKind, TypeRegistry};
use hearth_clock::FrameworkClock;
use hearth_types::{Location, Quality, ResourcePath, Timestamp, Value, ValueKind};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tracing::debug;

/// The graph as shared by the upper layers.
pub type SharedGraph = Arc<RwLock<ResourceGraph>>;

/// A named edge from a cell to a child location.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChildLink {
    /// Structural parent/child edge; the child is owned and deleted
    /// with its parent.
    Owned(Location),
    /// Alias edge to another cell's storage. May dangle after the
    /// target is deleted; resolution then fails until re-attached.
    Reference(Location),
}

impl ChildLink {
    fn target(self) -> Location {
        match self {
            ChildLink::Owned(loc) | ChildLink::Reference(loc) => loc,
        }
    }

    fn is_owned(self) -> bool {
        matches!(self, ChildLink::Owned(_))
    }
}

/// One storage cell.
#[derive(Debug)]
struct Cell {
    name: String,
    type_name: String,
    parent: Option<Location>,
    children: BTreeMap<String, ChildLink>,
    /// Element order for list cells; elements also appear in
    /// `children` under their synthetic names.
    elements: Vec<Location>,
    next_elem: u64,
    /// Present for value-kind cells, `None` for composites.
    value: Option<Value>,
    active: bool,
    decorator: bool,
    optional: bool,
    quality: Quality,
    last_updated: Option<Timestamp>,
}

fn default_value(kind: ValueKind) -> Value {
    match kind {
        ValueKind::Bool => Value::Bool(false),
        ValueKind::Int => Value::Int(0),
        ValueKind::Float => Value::Float(0.0),
        ValueKind::Time => Value::Time(0),
        ValueKind::Str => Value::Str(String::new()),
        ValueKind::Bytes => Value::Bytes(Vec::new()),
        ValueKind::BoolArray => Value::BoolArray(Vec::new()),
        ValueKind::IntArray => Value::IntArray(Vec::new()),
        ValueKind::FloatArray => Value::FloatArray(Vec::new()),
        ValueKind::StringArray => Value::StringArray(Vec::new()),
    }
}

/// The shared, hierarchical, strongly-typed resource graph.
pub struct ResourceGraph {
    registry: TypeRegistry,
    clock: Arc<dyn FrameworkClock>,
    cells: HashMap<Location, Cell>,
    roots: BTreeMap<String, Location>,
    by_type: HashMap<String, BTreeSet<Location>>,
    log: ChangeLog,
    next_cell: u64,
}

impl ResourceGraph {
    /// Create an empty graph over the given type registry and clock.
    pub fn new(registry: TypeRegistry, clock: Arc<dyn FrameworkClock>) -> Self {
        Self {
            registry,
            clock,
            cells: HashMap::new(),
            roots: BTreeMap::new(),
            by_type: HashMap::new(),
            log: ChangeLog::new(),
            next_cell: 1,
        }
    }

    /// Convenience constructor wrapping the graph for sharing.
    pub fn shared(registry: TypeRegistry, clock: Arc<dyn FrameworkClock>) -> SharedGraph {
        Arc::new(RwLock::new(Self::new(registry, clock)))
    }

    /// The type registry.
    pub fn registry(&self) -> &TypeRegistry {
        &self.registry
    }

    /// Register a type descriptor (idempotent for identical shapes).
    pub fn register_type(&mut self, descriptor: TypeDescriptor) -> Result<(), GraphError> {
        self.registry.register(descriptor)
    }

    // ------------------------------------------------------------------
    // Creation

    /// Exists-or-create a resource under `parent` (or at the root).
    ///
    /// If a sibling with the same name already exists and its type can
    /// serve `type_name`, its location is returned and nothing is
    /// logged, since multiple consumers may race to declare the same shared
    /// resource. An incompatible existing type fails with
    /// [`GraphError::TypeConflict`].
    pub fn create(
        &mut self,
        parent: Option<Location>,
        name: &str,
        type_name: &str,
    ) -> Result<Location, GraphError> {
        let descriptor = self.registry.require(type_name)?.clone();
        let Some(parent_loc) = parent else {
            if let Some(&existing) = self.roots.get(name) {
                return self.unify_existing(existing, type_name);
            }
            let loc = self.insert_cell(None, name, &descriptor, false, false);
            self.roots.insert(name.to_string(), loc);
            self.record(loc, ChangeKind::Created);
            return Ok(loc);
        };

        let parent_cell = self
            .cells
            .get(&parent_loc)
            .ok_or_else(|| GraphError::NotFound(parent_loc.to_string()))?;
        let parent_type = self.registry.require(&parent_cell.type_name)?;
        if matches!(parent_type.kind, TypeKind::List { .. }) {
            return Err(GraphError::UndeclaredChild {
                parent_type: parent_cell.type_name.clone(),
                name: name.to_string(),
            });
        }
        let slot = parent_type.slot(name).cloned();
        let Some(slot) = slot else {
            return Err(GraphError::UndeclaredChild {
                parent_type: parent_cell.type_name.clone(),
                name: name.to_string(),
            });
        };
        if !self.registry.compatible(type_name, &slot.type_name) {
            return Err(GraphError::TypeConflict {
                path: self.path_of(parent_loc)?.child(name).to_string(),
                existing: slot.type_name,
                requested: type_name.to_string(),
            });
        }

        let existing_link = self
            .cells
            .get(&parent_loc)
            .and_then(|c| c.children.get(name))
            .copied();
        if let Some(link) = existing_link {
            let target = link.target();
            if !self.cells.contains_key(&target) {
                return Err(GraphError::AlreadyExists(format!(
                    "{} (dangling reference)",
                    self.path_of(parent_loc)?.child(name)
                )));
            }
            return self.unify_existing(target, type_name);
        }

        let loc = self.insert_cell(Some(parent_loc), name, &descriptor, false, slot.optional);
        if let Some(cell) = self.cells.get_mut(&parent_loc) {
            cell.children.insert(name.to_string(), ChildLink::Owned(loc));
        }
        self.record(loc, ChangeKind::Created);
        Ok(loc)
    }

    /// Attach a dynamically named child outside the parent's declared
    /// schema. Exists-or-create like [`ResourceGraph::create`].
    pub fn add_decorator(
        &mut self,
        parent: Location,
        name: &str,
        type_name: &str,
    ) -> Result<Location, GraphError> {
        let descriptor = self.registry.require(type_name)?.clone();
        let parent_cell = self
            .cells
            .get(&parent)
            .ok_or_else(|| GraphError::NotFound(parent.to_string()))?;
        let parent_type = self.registry.require(&parent_cell.type_name)?;
        if parent_type.slot(name).is_some() {
            return Err(GraphError::AlreadyExists(format!(
                "{} is a declared sub-resource of {}",
                name, parent_cell.type_name
            )));
        }
        if let Some(link) = parent_cell.children.get(name).copied() {
            let target = link.target();
            if !self.cells.contains_key(&target) {
                return Err(GraphError::AlreadyExists(format!(
                    "{} (dangling reference)",
                    self.path_of(parent)?.child(name)
                )));
            }
            return self.unify_existing(target, type_name);
        }
        let loc = self.insert_cell(Some(parent), name, &descriptor, true, true);
        if let Some(cell) = self.cells.get_mut(&parent) {
            cell.children.insert(name.to_string(), ChildLink::Owned(loc));
        }
        self.record(loc, ChangeKind::Created);
        Ok(loc)
    }

    /// Create or retarget a named reference child aliasing `target`.
    ///
    /// Returns the target location (which the path now resolves to).
    /// Referencing the cell itself or one of its ancestors fails with
    /// [`GraphError::CycleDetected`]; shadowing an owned child fails
    /// with [`GraphError::AlreadyExists`].
    pub fn add_reference(
        &mut self,
        parent: Location,
        name: &str,
        target: Location,
    ) -> Result<Location, GraphError> {
        if !self.cells.contains_key(&parent) {
            return Err(GraphError::NotFound(parent.to_string()));
        }
        let target_cell = self
            .cells
            .get(&target)
            .ok_or_else(|| GraphError::NotFound(target.to_string()))?;
        let target_type = target_cell.type_name.clone();

        // Cycle guard: the alias must not point at the cell itself or
        // any ancestor, which would make path resolution loop.
        let mut probe = Some(parent);
        while let Some(loc) = probe {
            if loc == target {
                return Err(GraphError::CycleDetected {
                    from: self.path_of(parent)?.child(name).to_string(),
                    to: self.path_of(target)?.to_string(),
                });
            }
            probe = self.cells.get(&loc).and_then(|c| c.parent);
        }

        let parent_cell = self
            .cells
            .get(&parent)
            .ok_or_else(|| GraphError::NotFound(parent.to_string()))?;
        let parent_type = self.registry.require(&parent_cell.type_name)?;
        if let Some(slot) = parent_type.slot(name) {
            if !self.registry.compatible(&target_type, &slot.type_name) {
                return Err(GraphError::TypeConflict {
                    path: self.path_of(parent)?.child(name).to_string(),
                    existing: slot.type_name.clone(),
                    requested: target_type,
                });
            }
        }
        match parent_cell.children.get(name) {
            Some(ChildLink::Owned(_)) => {
                return Err(GraphError::AlreadyExists(format!(
                    "{} is an owned child",
                    self.path_of(parent)?.child(name)
                )));
            }
            Some(ChildLink::Reference(_)) | None => {}
        }
        if let Some(cell) = self.cells.get_mut(&parent) {
            cell.children
                .insert(name.to_string(), ChildLink::Reference(target));
        }
        self.record(parent, ChangeKind::ReferenceChanged);
        Ok(target)
    }

    /// Append an element to a list cell.
    pub fn list_add(&mut self, list: Location) -> Result<Location, GraphError> {
        let cell = self
            .cells
            .get(&list)
            .ok_or_else(|| GraphError::NotFound(list.to_string()))?;
        let list_type = self.registry.require(&cell.type_name)?;
        let TypeKind::List { elem } = &list_type.kind else {
            return Err(GraphError::NotAList(self.path_of(list)?.to_string()));
        };
        let elem_descriptor = self.registry.require(elem)?.clone();
        let name = format!("el{}", cell.next_elem);
        let loc = self.insert_cell(Some(list), &name, &elem_descriptor, false, true);
        if let Some(cell) = self.cells.get_mut(&list) {
            cell.next_elem += 1;
            cell.children.insert(name, ChildLink::Owned(loc));
            cell.elements.push(loc);
        }
        self.record(loc, ChangeKind::Created);
        Ok(loc)
    }

    /// Remove (and delete) the element at `index` from a list cell.
    pub fn list_remove(&mut self, list: Location, index: usize) -> Result<(), GraphError> {
        let cell = self
            .cells
            .get(&list)
            .ok_or_else(|| GraphError::NotFound(list.to_string()))?;
        if !matches!(
            self.registry.require(&cell.type_name)?.kind,
            TypeKind::List { .. }
        ) {
            return Err(GraphError::NotAList(self.path_of(list)?.to_string()));
        }
        let len = cell.elements.len();
        let Some(&elem) = cell.elements.get(index) else {
            return Err(GraphError::IndexOutOfBounds {
                path: self.path_of(list)?.to_string(),
                index,
                len,
            });
        };
        self.delete(elem)
    }

    /// Element locations of a list cell, in list order.
    pub fn list_elements(&self, list: Location) -> Result<Vec<Location>, GraphError> {
        let cell = self
            .cells
            .get(&list)
            .ok_or_else(|| GraphError::NotFound(list.to_string()))?;
        if !matches!(
            self.registry.require(&cell.type_name)?.kind,
            TypeKind::List { .. }
        ) {
            return Err(GraphError::NotAList(self.path_of(list)?.to_string()));
        }
        Ok(cell.elements.clone())
    }

    /// Number of elements in a list cell.
    pub fn list_len(&self, list: Location) -> Result<usize, GraphError> {
        self.list_elements(list).map(|e| e.len())
    }

    // ------------------------------------------------------------------
    // Deletion

    /// Delete a resource and its owned subtree.
    ///
    /// Fires `Deleted` records bottom-up (children before parents).
    /// References pointing at any deleted cell are left dangling; they
    /// resolve to nothing until re-attached. This loose coupling is
    /// deliberate: callers that re-create structure may retarget them.
    pub fn delete(&mut self, location: Location) -> Result<(), GraphError> {
        let base_path = self.path_of(location)?;

        // Collect the owned subtree with pre-deletion paths.
        let mut stack = vec![(location, base_path)];
        let mut order: Vec<(Location, ResourcePath)> = Vec::new();
        while let Some((loc, path)) = stack.pop() {
            if let Some(cell) = self.cells.get(&loc) {
                for (name, link) in &cell.children {
                    if let ChildLink::Owned(child) = link {
                        stack.push((*child, path.child(name)));
                    }
                }
            }
            order.push((loc, path));
        }

        // Detach from the structural parent (or the root table).
        let (name, parent) = {
            let cell = self
                .cells
                .get(&location)
                .ok_or_else(|| GraphError::NotFound(location.to_string()))?;
            (cell.name.clone(), cell.parent)
        };
        match parent {
            Some(parent_loc) => {
                if let Some(parent_cell) = self.cells.get_mut(&parent_loc) {
                    parent_cell.children.remove(&name);
                    parent_cell.elements.retain(|l| *l != location);
                }
            }
            None => {
                self.roots.remove(&name);
            }
        }

        debug!(path = %order[0].1, subtree = order.len(), "deleted");
        let now = self.clock.now();
        for (loc, path) in order.iter().rev() {
            if let Some(cell) = self.cells.remove(loc) {
                if let Some(set) = self.by_type.get_mut(&cell.type_name) {
                    set.remove(loc);
                }
                self.log
                    .append(*loc, cell.parent, path.clone(), ChangeKind::Deleted, now);
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Values

    /// Read the current value of a value-kind cell.
    pub fn get_value(&self, location: Location) -> Result<Value, GraphError> {
        let cell = self
            .cells
            .get(&location)
            .ok_or_else(|| GraphError::NotFound(location.to_string()))?;
        cell.value
            .clone()
            .ok_or_else(|| GraphError::NotAValue(self.path_string(location)))
    }

    /// Write a value with `Good` quality.
    ///
    /// Writes are permitted regardless of activation state; a record is
    /// logged on every write, value change or not.
    pub fn set_value(&mut self, location: Location, value: Value) -> Result<(), GraphError> {
        self.set_value_with_quality(location, value, Quality::Good)
    }

    /// Write a value stamping the given sample quality.
    pub fn set_value_with_quality(
        &mut self,
        location: Location,
        value: Value,
        quality: Quality,
    ) -> Result<(), GraphError> {
        let now = self.clock.now();
        let path = self.path_string(location);
        let cell = self
            .cells
            .get_mut(&location)
            .ok_or_else(|| GraphError::NotFound(location.to_string()))?;
        let Some(current) = &cell.value else {
            return Err(GraphError::NotAValue(path));
        };
        if current.kind() != value.kind() {
            return Err(GraphError::ValueKindMismatch {
                path,
                expected: current.kind(),
                got: value.kind(),
            });
        }
        cell.value = Some(value);
        cell.quality = quality;
        cell.last_updated = Some(now);
        self.record(location, ChangeKind::ValueChanged);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Activation

    /// Activate a cell, optionally cascading through owned children.
    /// Already-active cells produce no record.
    pub fn activate(&mut self, location: Location, cascade: bool) -> Result<(), GraphError> {
        self.set_active(location, cascade, true)
    }

    /// Deactivate a cell, optionally cascading through owned children.
    pub fn deactivate(&mut self, location: Location, cascade: bool) -> Result<(), GraphError> {
        self.set_active(location, cascade, false)
    }

    fn set_active(
        &mut self,
        location: Location,
        cascade: bool,
        active: bool,
    ) -> Result<(), GraphError> {
        if !self.cells.contains_key(&location) {
            return Err(GraphError::NotFound(location.to_string()));
        }
        let mut affected = vec![location];
        if cascade {
            let mut stack = vec![location];
            while let Some(loc) = stack.pop() {
                if let Some(cell) = self.cells.get(&loc) {
                    for link in cell.children.values() {
                        if let ChildLink::Owned(child) = link {
                            affected.push(*child);
                            stack.push(*child);
                        }
                    }
                }
            }
        }
        let kind = if active {
            ChangeKind::Activated
        } else {
            ChangeKind::Deactivated
        };
        for loc in affected {
            let changed = match self.cells.get_mut(&loc) {
                Some(cell) if cell.active != active => {
                    cell.active = active;
                    true
                }
                _ => false,
            };
            if changed {
                self.record(loc, kind);
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Navigation and introspection

    /// Resolve a path from the root, following reference edges one hop.
    /// Returns `None` for missing paths and dangling references.
    pub fn resolve(&self, path: &ResourcePath) -> Option<Location> {
        let segments = path.segments();
        let mut loc = *self.roots.get(&segments[0])?;
        for name in &segments[1..] {
            loc = self.child(loc, name)?;
        }
        Some(loc)
    }

    /// Like [`ResourceGraph::resolve`] but raising [`GraphError::NotFound`].
    pub fn resolve_required(&self, path: &ResourcePath) -> Result<Location, GraphError> {
        self.resolve(path).ok_or_else(|| GraphError::not_found(path))
    }

    /// Resolve a relative path from `base`, appending every location
    /// traversed (including `base` and the final cell) to `trace`.
    /// On failure the trace covers the prefix that did resolve.
    pub fn resolve_from_with_trace(
        &self,
        base: Location,
        rel: &ResourcePath,
        trace: &mut Vec<Location>,
    ) -> Option<Location> {
        trace.push(base);
        let mut loc = base;
        for name in rel.segments() {
            loc = self.child(loc, name)?;
            trace.push(loc);
        }
        Some(loc)
    }

    /// Resolve a relative path from `base`.
    pub fn resolve_from(&self, base: Location, rel: &ResourcePath) -> Option<Location> {
        let mut trace = Vec::new();
        self.resolve_from_with_trace(base, rel, &mut trace)
    }

    /// Resolve one named child, one-hop through references.
    pub fn child(&self, location: Location, name: &str) -> Option<Location> {
        let target = self.cells.get(&location)?.children.get(name)?.target();
        self.cells.contains_key(&target).then_some(target)
    }

    /// Resolvable children as (name, location) pairs, dangling
    /// references skipped.
    pub fn children(&self, location: Location) -> Vec<(String, Location)> {
        let Some(cell) = self.cells.get(&location) else {
            return Vec::new();
        };
        cell.children
            .iter()
            .filter_map(|(name, link)| {
                let target = link.target();
                self.cells
                    .contains_key(&target)
                    .then(|| (name.clone(), target))
            })
            .collect()
    }

    /// Whether the named child edge is a reference.
    pub fn is_reference(&self, location: Location, name: &str) -> bool {
        self.cells
            .get(&location)
            .and_then(|c| c.children.get(name))
            .is_some_and(|link| !link.is_owned())
    }

    /// The canonical path of a location (through owned edges only).
    pub fn path_of(&self, location: Location) -> Result<ResourcePath, GraphError> {
        let mut segments = Vec::new();
        let mut probe = Some(location);
        while let Some(loc) = probe {
            let cell = self
                .cells
                .get(&loc)
                .ok_or_else(|| GraphError::NotFound(location.to_string()))?;
            segments.push(cell.name.clone());
            probe = cell.parent;
        }
        segments.reverse();
        ResourcePath::new(segments).map_err(|_| GraphError::NotFound(location.to_string()))
    }

    fn path_string(&self, location: Location) -> String {
        self.path_of(location)
            .map(|p| p.to_string())
            .unwrap_or_else(|_| location.to_string())
    }

    /// All locations whose type can serve `type_name`, in location order.
    pub fn find_by_type(&self, type_name: &str) -> Vec<Location> {
        let mut out = Vec::new();
        for (cell_type, locations) in &self.by_type {
            if self.registry.compatible(cell_type, type_name) {
                out.extend(locations.iter().copied());
            }
        }
        out.sort_unstable();
        out
    }

    /// Whether the location exists (is a live cell).
    pub fn exists(&self, location: Location) -> bool {
        self.cells.contains_key(&location)
    }

    /// Whether the cell is active. Missing cells are inactive.
    pub fn is_active(&self, location: Location) -> bool {
        self.cells.get(&location).is_some_and(|c| c.active)
    }

    /// The cell's type name.
    pub fn type_name(&self, location: Location) -> Option<&str> {
        self.cells.get(&location).map(|c| c.type_name.as_str())
    }

    /// The cell's value kind, for leaf cells.
    pub fn value_kind(&self, location: Location) -> Option<ValueKind> {
        self.cells
            .get(&location)
            .and_then(|c| c.value.as_ref())
            .map(|v| v.kind())
    }

    /// Quality stamped by the last write.
    pub fn quality(&self, location: Location) -> Option<Quality> {
        self.cells.get(&location).map(|c| c.quality)
    }

    /// Framework time of the last value write.
    pub fn last_updated(&self, location: Location) -> Option<Timestamp> {
        self.cells.get(&location).and_then(|c| c.last_updated)
    }

    /// Whether the cell was attached as a decorator.
    pub fn is_decorator(&self, location: Location) -> bool {
        self.cells.get(&location).is_some_and(|c| c.decorator)
    }

    /// Whether the cell is optional in its declared parent type.
    pub fn is_optional(&self, location: Location) -> bool {
        self.cells.get(&location).is_some_and(|c| c.optional)
    }

    /// Number of live cells.
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    /// Whether the graph has no cells.
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    // ------------------------------------------------------------------
    // Change log access

    /// Open a cursor positioned at the tail of the change log.
    pub fn open_cursor(&mut self) -> CursorId {
        self.log.open_cursor()
    }

    /// Read and advance a cursor.
    pub fn read_changes(&mut self, cursor: CursorId) -> Vec<ChangeRecord> {
        self.log.read(cursor)
    }

    /// Close a cursor, releasing its retention hold.
    pub fn close_cursor(&mut self, cursor: CursorId) -> bool {
        self.log.close_cursor(cursor)
    }

    /// Whether records are pending for the cursor.
    pub fn has_pending_changes(&self, cursor: CursorId) -> bool {
        self.log.has_pending(cursor)
    }

    // ------------------------------------------------------------------
    // Internals

    fn unify_existing(
        &mut self,
        existing: Location,
        requested: &str,
    ) -> Result<Location, GraphError> {
        let existing_type = self
            .cells
            .get(&existing)
            .ok_or_else(|| GraphError::NotFound(existing.to_string()))?
            .type_name
            .clone();
        if self.registry.compatible(&existing_type, requested) {
            Ok(existing)
        } else {
            Err(GraphError::TypeConflict {
                path: self.path_string(existing),
                existing: existing_type,
                requested: requested.to_string(),
            })
        }
    }

    fn insert_cell(
        &mut self,
        parent: Option<Location>,
        name: &str,
        descriptor: &TypeDescriptor,
        decorator: bool,
        optional: bool,
    ) -> Location {
        let loc = Location(self.next_cell);
        self.next_cell += 1;
        self.cells.insert(
            loc,
            Cell {
                name: name.to_string(),
                type_name: descriptor.name.clone(),
                parent,
                children: BTreeMap::new(),
                elements: Vec::new(),
                next_elem: 0,
                value: descriptor.value_kind().map(default_value),
                active: false,
                decorator,
                optional,
                quality: Quality::Good,
                last_updated: None,
            },
        );
        self.by_type
            .entry(descriptor.name.clone())
            .or_default()
            .insert(loc);
        loc
    }

    fn record(&mut self, location: Location, kind: ChangeKind) {
        let parent = self.cells.get(&location).and_then(|c| c.parent);
        let Ok(path) = self.path_of(location) else {
            return;
        };
        let now = self.clock.now();
        self.log.append(location, parent, path, kind, now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::SlotDescriptor;
    use hearth_clock::SimulationClock;

    fn registry() -> TypeRegistry {
        let mut reg = TypeRegistry::new();
        reg.register(TypeDescriptor::value("float", ValueKind::Float))
            .unwrap();
        reg.register(TypeDescriptor::value("bool", ValueKind::Bool))
            .unwrap();
        reg.register(TypeDescriptor::value("string", ValueKind::Str))
            .unwrap();
        reg.register(TypeDescriptor::composite(
            "meter",
            vec![
                SlotDescriptor::required("reading", "float"),
                SlotDescriptor::optional("enabled", "bool"),
            ],
        ))
        .unwrap();
        reg.register(TypeDescriptor::list("meters", "meter")).unwrap();
        reg
    }

    fn graph() -> ResourceGraph {
        ResourceGraph::new(registry(), Arc::new(SimulationClock::new()))
    }

    fn path(text: &str) -> ResourcePath {
        ResourcePath::parse(text).unwrap()
    }

    #[test]
    fn test_create_and_resolve() {
        let mut g = graph();
        let meter = g.create(None, "meter", "meter").unwrap();
        let reading = g.create(Some(meter), "reading", "float").unwrap();

        assert_eq!(g.resolve(&path("meter")), Some(meter));
        assert_eq!(g.resolve(&path("meter/reading")), Some(reading));
        assert_eq!(g.path_of(reading).unwrap(), path("meter/reading"));
        assert_eq!(g.type_name(reading), Some("float"));
    }

    #[test]
    fn test_create_is_idempotent() {
        let mut g = graph();
        let meter = g.create(None, "meter", "meter").unwrap();
        let first = g.create(Some(meter), "reading", "float").unwrap();
        let second = g.create(Some(meter), "reading", "float").unwrap();
        assert_eq!(first, second);
        assert_eq!(g.children(meter).len(), 1);
    }

    #[test]
    fn test_create_type_conflict() {
        let mut g = graph();
        let meter = g.create(None, "meter", "meter").unwrap();
        assert!(matches!(
            g.create(Some(meter), "reading", "bool"),
            Err(GraphError::TypeConflict { .. })
        ));
        // Same at root level against an existing root.
        g.create(None, "flag", "bool").unwrap();
        assert!(matches!(
            g.create(None, "flag", "float"),
            Err(GraphError::TypeConflict { .. })
        ));
    }

    #[test]
    fn test_create_undeclared_child_rejected() {
        let mut g = graph();
        let meter = g.create(None, "meter", "meter").unwrap();
        assert!(matches!(
            g.create(Some(meter), "bogus", "float"),
            Err(GraphError::UndeclaredChild { .. })
        ));
    }

    #[test]
    fn test_set_and_get_value() {
        let mut g = graph();
        let meter = g.create(None, "meter", "meter").unwrap();
        let reading = g.create(Some(meter), "reading", "float").unwrap();

        assert_eq!(g.get_value(reading).unwrap(), Value::Float(0.0));
        g.set_value(reading, Value::Float(21.5)).unwrap();
        assert_eq!(g.get_value(reading).unwrap(), Value::Float(21.5));

        assert!(matches!(
            g.set_value(reading, Value::Bool(true)),
            Err(GraphError::ValueKindMismatch { .. })
        ));
        assert!(matches!(
            g.get_value(meter),
            Err(GraphError::NotAValue(_))
        ));
    }

    #[test]
    fn test_set_value_on_missing_location() {
        let mut g = graph();
        assert!(matches!(
            g.set_value(Location(999), Value::Float(1.0)),
            Err(GraphError::NotFound(_))
        ));
    }

    #[test]
    fn test_delete_then_get_value_not_found() {
        let mut g = graph();
        let meter = g.create(None, "meter", "meter").unwrap();
        let reading = g.create(Some(meter), "reading", "float").unwrap();
        g.delete(meter).unwrap();

        assert!(matches!(
            g.get_value(reading),
            Err(GraphError::NotFound(_))
        ));
        assert_eq!(g.resolve(&path("meter")), None);
        assert!(g.is_empty());
    }

    #[test]
    fn test_delete_fires_bottom_up() {
        let mut g = graph();
        let cursor = g.open_cursor();
        let meter = g.create(None, "meter", "meter").unwrap();
        g.create(Some(meter), "reading", "float").unwrap();
        g.read_changes(cursor);

        g.delete(meter).unwrap();
        let records = g.read_changes(cursor);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].path, path("meter/reading"));
        assert_eq!(records[0].kind, ChangeKind::Deleted);
        assert_eq!(records[1].path, path("meter"));
    }

    #[test]
    fn test_activation_cascade() {
        let mut g = graph();
        let meter = g.create(None, "meter", "meter").unwrap();
        let reading = g.create(Some(meter), "reading", "float").unwrap();

        g.activate(meter, false).unwrap();
        assert!(g.is_active(meter));
        assert!(!g.is_active(reading));

        g.activate(meter, true).unwrap();
        assert!(g.is_active(reading));

        g.deactivate(meter, true).unwrap();
        assert!(!g.is_active(meter));
        assert!(!g.is_active(reading));
    }

    #[test]
    fn test_activation_is_idempotent_in_the_log() {
        let mut g = graph();
        let meter = g.create(None, "meter", "meter").unwrap();
        let cursor = g.open_cursor();
        g.activate(meter, false).unwrap();
        g.activate(meter, false).unwrap();
        let records = g.read_changes(cursor);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].kind, ChangeKind::Activated);
    }

    #[test]
    fn test_reference_shares_storage() {
        let mut g = graph();
        let meter = g.create(None, "meter", "meter").unwrap();
        let reading = g.create(Some(meter), "reading", "float").unwrap();
        let display = g.create(None, "display", "meter").unwrap();

        let aliased = g.add_reference(display, "reading", reading).unwrap();
        assert_eq!(aliased, reading);
        assert_eq!(g.resolve(&path("display/reading")), Some(reading));
        assert!(g.is_reference(display, "reading"));

        // Mutating through either path mutates the same cell.
        g.set_value(aliased, Value::Float(7.0)).unwrap();
        assert_eq!(g.get_value(reading).unwrap(), Value::Float(7.0));
    }

    #[test]
    fn test_reference_dangles_after_target_delete() {
        let mut g = graph();
        let meter = g.create(None, "meter", "meter").unwrap();
        let reading = g.create(Some(meter), "reading", "float").unwrap();
        let display = g.create(None, "display", "meter").unwrap();
        g.add_reference(display, "reading", reading).unwrap();

        g.delete(meter).unwrap();
        // The alias edge survives but resolves to nothing.
        assert_eq!(g.resolve(&path("display/reading")), None);
        assert!(g.exists(display));
    }

    #[test]
    fn test_reference_cycle_rejected() {
        let mut g = graph();
        let meter = g.create(None, "meter", "meter").unwrap();
        assert!(matches!(
            g.add_reference(meter, "enabled", meter),
            Err(GraphError::CycleDetected { .. })
        ));
    }

    #[test]
    fn test_reference_retarget() {
        let mut g = graph();
        let m1 = g.create(None, "m1", "meter").unwrap();
        let r1 = g.create(Some(m1), "reading", "float").unwrap();
        let m2 = g.create(None, "m2", "meter").unwrap();
        let r2 = g.create(Some(m2), "reading", "float").unwrap();
        let display = g.create(None, "display", "meter").unwrap();

        g.add_reference(display, "reading", r1).unwrap();
        g.add_reference(display, "reading", r2).unwrap();
        assert_eq!(g.resolve(&path("display/reading")), Some(r2));
    }

    #[test]
    fn test_decorator() {
        let mut g = graph();
        let meter = g.create(None, "meter", "meter").unwrap();
        let note = g.add_decorator(meter, "note", "string").unwrap();
        assert!(g.is_decorator(note));
        assert_eq!(g.resolve(&path("meter/note")), Some(note));

        // Declared slots cannot be decorated over.
        assert!(matches!(
            g.add_decorator(meter, "reading", "float"),
            Err(GraphError::AlreadyExists(_))
        ));
        // Idempotent for compatible re-decoration.
        assert_eq!(g.add_decorator(meter, "note", "string").unwrap(), note);
    }

    #[test]
    fn test_list_operations() {
        let mut g = graph();
        let meters = g.create(None, "meters", "meters").unwrap();
        let a = g.list_add(meters).unwrap();
        let b = g.list_add(meters).unwrap();
        assert_eq!(g.list_len(meters).unwrap(), 2);
        assert_eq!(g.list_elements(meters).unwrap(), vec![a, b]);

        g.list_remove(meters, 0).unwrap();
        assert_eq!(g.list_elements(meters).unwrap(), vec![b]);
        assert!(!g.exists(a));

        assert!(matches!(
            g.list_remove(meters, 5),
            Err(GraphError::IndexOutOfBounds { .. })
        ));
        // Element names stay stable across removal.
        let c = g.list_add(meters).unwrap();
        assert_ne!(g.path_of(b).unwrap(), g.path_of(c).unwrap());
    }

    #[test]
    fn test_find_by_type_uses_structural_compatibility() {
        let mut g = graph();
        g.register_type(TypeDescriptor::composite(
            "readable",
            vec![SlotDescriptor::required("reading", "float")],
        ))
        .unwrap();
        let meter = g.create(None, "meter", "meter").unwrap();
        g.create(None, "flag", "bool").unwrap();

        assert_eq!(g.find_by_type("meter"), vec![meter]);
        // meter declares everything readable wants.
        assert_eq!(g.find_by_type("readable"), vec![meter]);
    }

    #[test]
    fn test_change_log_order() {
        let mut g = graph();
        let cursor = g.open_cursor();
        let meter = g.create(None, "meter", "meter").unwrap();
        let reading = g.create(Some(meter), "reading", "float").unwrap();
        g.set_value(reading, Value::Float(1.0)).unwrap();
        g.activate(reading, false).unwrap();

        let kinds: Vec<ChangeKind> = g.read_changes(cursor).iter().map(|r| r.kind).collect();
        assert_eq!(
            kinds,
            vec![
                ChangeKind::Created,
                ChangeKind::Created,
                ChangeKind::ValueChanged,
                ChangeKind::Activated,
            ]
        );
    }

    #[test]
    fn test_quality_and_timestamps() {
        let clock = Arc::new(SimulationClock::new());
        let mut g = ResourceGraph::new(registry(), clock.clone());
        let meter = g.create(None, "meter", "meter").unwrap();
        let reading = g.create(Some(meter), "reading", "float").unwrap();

        clock.advance(500);
        g.set_value_with_quality(reading, Value::Float(1.0), Quality::Bad)
            .unwrap();
        assert_eq!(g.quality(reading), Some(Quality::Bad));
        assert_eq!(g.last_updated(reading), Some(Timestamp(500)));
    }

    #[test]
    fn test_resolve_from_with_trace() {
        let mut g = graph();
        let meter = g.create(None, "meter", "meter").unwrap();
        let reading = g.create(Some(meter), "reading", "float").unwrap();

        let mut trace = Vec::new();
        let resolved = g.resolve_from_with_trace(meter, &path("reading"), &mut trace);
        assert_eq!(resolved, Some(reading));
        assert_eq!(trace, vec![meter, reading]);

        // A failing resolution keeps the visited prefix.
        let mut trace = Vec::new();
        let resolved = g.resolve_from_with_trace(meter, &path("enabled"), &mut trace);
        assert_eq!(resolved, None);
        assert_eq!(trace, vec![meter]);
    }
}
