//! The incremental pattern matching engine
//!
//! State machine per (demand, candidate root): an untracked root is
//! `Absent`; it becomes `Partial` when a resource of the demanded root
//! type exists, and `Complete` when the root is active, every required
//! slot resolves to an existing, active, type-compatible cell and the
//! consumer's validity predicate holds. Entry to `Complete` delivers
//! one match callback; exit delivers one match-lost callback.
//!
//! Re-evaluation is incremental: every candidate records the set of
//! locations its slot resolution traversed (its *footprint*), and a
//! change re-evaluates only the (demand, candidate) pairs whose
//! footprint intersects the changed location, never the whole demand
//! set.

use crate::spec::{PatternSpec, SlotRequirement};
use hearth_broker::{AccessArbiter, BrokerError, Event, EventBroker, PatternEvent};
use hearth_graph::{ChangeKind, ChangeRecord, GraphError, ResourceGraph};
use hearth_types::{ConsumerId, DemandId, ListenerHandle, Location, ResourcePath, Value};
use std::collections::{BTreeSet, HashMap, HashSet};
use thiserror::Error;
use tracing::{debug, warn};

/// Errors from demand registration and pattern creation.
#[derive(Debug, Error)]
pub enum PatternError {
    /// The demanded root type is not registered in the graph.
    #[error("unknown root type: {0}")]
    UnknownRootType(String),

    /// The owning consumer could not be registered with the broker.
    #[error(transparent)]
    Broker(#[from] BrokerError),

    /// Pattern creation touched the graph and failed structurally.
    #[error(transparent)]
    Graph(#[from] GraphError),
}

/// Tracked state of a candidate root for one demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum MatchState {
    /// The root exists but the pattern is not complete.
    Partial,
    /// All requirements hold; the consumer has been told.
    Complete,
}

/// Read-through view of a (possibly partial) match, handed to validity
/// predicates.
pub struct MatchView<'a> {
    graph: &'a ResourceGraph,
    root: Location,
    slots: &'a [(String, Location)],
}

impl<'a> MatchView<'a> {
    /// The candidate root location.
    pub fn root(&self) -> Location {
        self.root
    }

    /// The resolved location of a slot, if it resolved.
    pub fn slot(&self, name: &str) -> Option<Location> {
        self.slots
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, loc)| *loc)
    }

    /// Read a slot's current value through the graph.
    pub fn value(&self, name: &str) -> Option<Value> {
        self.graph.get_value(self.slot(name)?).ok()
    }

    /// The underlying graph, for predicates that need more context.
    pub fn graph(&self) -> &ResourceGraph {
        self.graph
    }
}

/// Consumer-defined validity predicate, evaluated after structural
/// completeness and re-evaluated on value changes in the footprint.
pub type AcceptFn = Box<dyn Fn(&MatchView<'_>) -> bool + Send>;

/// Callbacks a demand's owner receives when matches come and go.
pub trait PatternListener: Send {
    /// A candidate entered `Complete`.
    fn pattern_available(&mut self, event: &PatternEvent) {
        let _ = event;
    }

    /// A previously reported match was lost.
    fn pattern_unavailable(&mut self, event: &PatternEvent) {
        let _ = event;
    }
}

/// A [`PatternListener`] built from two closures.
pub struct CallbackPatternListener<A, U>
where
    A: FnMut(&PatternEvent) + Send,
    U: FnMut(&PatternEvent) + Send,
{
    on_available: A,
    on_unavailable: U,
}

impl<A, U> CallbackPatternListener<A, U>
where
    A: FnMut(&PatternEvent) + Send,
    U: FnMut(&PatternEvent) + Send,
{
    pub fn new(on_available: A, on_unavailable: U) -> Self {
        Self {
            on_available,
            on_unavailable,
        }
    }
}

impl<A, U> PatternListener for CallbackPatternListener<A, U>
where
    A: FnMut(&PatternEvent) + Send,
    U: FnMut(&PatternEvent) + Send,
{
    fn pattern_available(&mut self, event: &PatternEvent) {
        (self.on_available)(event);
    }

    fn pattern_unavailable(&mut self, event: &PatternEvent) {
        (self.on_unavailable)(event);
    }
}

/// A candidate stuck in `Partial`, with the slot names that keep it
/// from completing (`"@active"` marks an inactive root, `"accept()"`
/// a failing validity predicate).
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct PartialReport {
    pub root: Location,
    pub unmet: Vec<String>,
}

/// Administrative view of one registered demand.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct DemandReport {
    pub demand: DemandId,
    pub consumer: ConsumerId,
    /// The broker registration match callbacks are delivered to.
    pub listener: ListenerHandle,
    pub root_type: String,
    pub complete: Vec<Location>,
    pub partial: Vec<PartialReport>,
}

struct Candidate {
    state: MatchState,
    /// Resolved slots from the latest evaluation.
    slots: Vec<(String, Location)>,
    /// Locations traversed while resolving slots; changes here wake
    /// the candidate up.
    footprint: Vec<Location>,
    unmet: Vec<String>,
}

struct Demand {
    consumer: ConsumerId,
    spec: PatternSpec,
    listener: ListenerHandle,
    accept: AcceptFn,
    candidates: HashMap<Location, Candidate>,
}

struct Evaluation {
    complete: bool,
    slots: Vec<(String, Location)>,
    footprint: Vec<Location>,
    unmet: Vec<String>,
}

fn evaluate(
    spec: &PatternSpec,
    accept: &AcceptFn,
    consumer: ConsumerId,
    graph: &ResourceGraph,
    arbiter: Option<&AccessArbiter>,
    root: Location,
) -> Evaluation {
    let mut footprint = vec![root];
    let mut slots = Vec::new();
    let mut unmet = Vec::new();

    if !graph.is_active(root) {
        unmet.push("@active".to_string());
    }
    for slot in &spec.slots {
        let mut trace = Vec::new();
        let resolved = graph.resolve_from_with_trace(root, &slot.rel_path, &mut trace);
        footprint.extend(trace);
        match resolved {
            Some(loc) => {
                slots.push((slot.name.clone(), loc));
                if slot.requirement == SlotRequirement::Optional {
                    continue;
                }
                let type_ok = graph
                    .type_name(loc)
                    .is_some_and(|t| graph.registry().compatible(t, &slot.type_name));
                let write_ok = match (slot.requirement, arbiter) {
                    (SlotRequirement::RequiredWritable, Some(arbiter)) => {
                        arbiter.check_write(consumer, loc).is_ok()
                    }
                    _ => true,
                };
                if !(type_ok && graph.is_active(loc) && write_ok) {
                    unmet.push(slot.name.clone());
                }
            }
            None => {
                if slot.requirement != SlotRequirement::Optional {
                    unmet.push(slot.name.clone());
                }
            }
        }
    }
    footprint.sort_unstable();
    footprint.dedup();

    let structurally_complete = unmet.is_empty();
    let complete = structurally_complete
        && accept(&MatchView {
            graph,
            root,
            slots: &slots,
        });
    if structurally_complete && !complete {
        unmet.push("accept()".to_string());
    }
    Evaluation {
        complete,
        slots,
        footprint,
        unmet,
    }
}

/// The demand registry and incremental matcher.
#[derive(Default)]
pub struct PatternEngine {
    demands: HashMap<DemandId, Demand>,
    /// Location -> (demand, candidate root) pairs whose footprint
    /// covers it.
    footprint: HashMap<Location, HashSet<(DemandId, Location)>>,
    evaluations: u64,
}

impl PatternEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a demand and compute its initial match set over the
    /// whole graph. Match callbacks are enqueued on the consumer's
    /// broker queue (not invoked inline).
    #[allow(clippy::too_many_arguments)]
    pub fn register_demand(
        &mut self,
        graph: &ResourceGraph,
        broker: &EventBroker,
        arbiter: Option<&AccessArbiter>,
        consumer: ConsumerId,
        spec: PatternSpec,
        listener: Box<dyn PatternListener>,
        accept: AcceptFn,
    ) -> Result<DemandId, PatternError> {
        if graph.registry().get(&spec.root_type).is_none() {
            return Err(PatternError::UnknownRootType(spec.root_type));
        }
        let mut listener = listener;
        let handle = broker.add_listener(consumer, move |event| match event {
            Event::PatternAvailable(pe) => listener.pattern_available(pe),
            Event::PatternUnavailable(pe) => listener.pattern_unavailable(pe),
            _ => {}
        })?;

        let id = DemandId::new();
        let roots = graph.find_by_type(&spec.root_type);
        self.demands.insert(
            id,
            Demand {
                consumer,
                spec,
                listener: handle,
                accept,
                candidates: HashMap::new(),
            },
        );
        debug!(demand = %id, %consumer, candidates = roots.len(), "demand registered");
        for root in roots {
            self.reevaluate_pair(graph, broker, arbiter, id, root);
        }
        Ok(id)
    }

    /// Withdraw a demand: all matches and listener registrations are
    /// removed and any queued-but-undelivered callbacks are purged.
    /// No callback for this demand runs after this returns.
    pub fn withdraw_demand(&mut self, broker: &EventBroker, id: DemandId) -> bool {
        let Some(demand) = self.demands.remove(&id) else {
            return false;
        };
        for (root, candidate) in &demand.candidates {
            for loc in &candidate.footprint {
                let empty = self
                    .footprint
                    .get_mut(loc)
                    .map(|set| {
                        set.remove(&(id, *root));
                        set.is_empty()
                    })
                    .unwrap_or(false);
                if empty {
                    self.footprint.remove(loc);
                }
            }
        }
        broker.remove_listener(&demand.listener);
        debug!(demand = %id, "demand withdrawn");
        true
    }

    /// Withdraw every demand and clear all state.
    pub fn close(&mut self, broker: &EventBroker) {
        let ids: Vec<DemandId> = self.demands.keys().copied().collect();
        for id in ids {
            self.withdraw_demand(broker, id);
        }
    }

    /// Withdraw all demands owned by a consumer (on shutdown).
    pub fn withdraw_consumer(&mut self, broker: &EventBroker, consumer: ConsumerId) {
        let ids: Vec<DemandId> = self
            .demands
            .iter()
            .filter(|(_, d)| d.consumer == consumer)
            .map(|(id, _)| *id)
            .collect();
        for id in ids {
            self.withdraw_demand(broker, id);
        }
    }

    /// Feed a batch of graph changes through the matcher. Only the
    /// (demand, candidate) pairs whose footprint intersects a changed
    /// location are re-evaluated.
    pub fn apply_changes(
        &mut self,
        graph: &ResourceGraph,
        broker: &EventBroker,
        arbiter: Option<&AccessArbiter>,
        records: &[ChangeRecord],
    ) {
        let mut pairs: BTreeSet<(DemandId, Location)> = BTreeSet::new();
        for record in records {
            match record.kind {
                ChangeKind::Created => {
                    if let Some(parent) = record.parent {
                        if let Some(set) = self.footprint.get(&parent) {
                            pairs.extend(set.iter().copied());
                        }
                    }
                    // A freshly created cell may itself be a new
                    // candidate root for some demands.
                    if let Some(type_name) = graph.type_name(record.location) {
                        for (id, demand) in &self.demands {
                            if graph
                                .registry()
                                .compatible(type_name, &demand.spec.root_type)
                                && !demand.candidates.contains_key(&record.location)
                            {
                                pairs.insert((*id, record.location));
                            }
                        }
                    }
                }
                ChangeKind::Deleted => {
                    if let Some(set) = self.footprint.get(&record.location) {
                        pairs.extend(set.iter().copied());
                    }
                    if let Some(parent) = record.parent {
                        if let Some(set) = self.footprint.get(&parent) {
                            pairs.extend(set.iter().copied());
                        }
                    }
                    for (id, demand) in &self.demands {
                        if demand.candidates.contains_key(&record.location) {
                            pairs.insert((*id, record.location));
                        }
                    }
                }
                ChangeKind::ValueChanged
                | ChangeKind::Activated
                | ChangeKind::Deactivated
                | ChangeKind::ReferenceChanged => {
                    if let Some(set) = self.footprint.get(&record.location) {
                        pairs.extend(set.iter().copied());
                    }
                }
            }
        }
        for (id, root) in pairs {
            self.reevaluate_pair(graph, broker, arbiter, id, root);
        }
    }

    /// Force a full re-evaluation of one demand (e.g. after access
    /// grants changed).
    pub fn reevaluate_demand(
        &mut self,
        graph: &ResourceGraph,
        broker: &EventBroker,
        arbiter: Option<&AccessArbiter>,
        id: DemandId,
    ) {
        let Some(demand) = self.demands.get(&id) else {
            return;
        };
        let mut roots: BTreeSet<Location> = demand.candidates.keys().copied().collect();
        roots.extend(graph.find_by_type(&demand.spec.root_type));
        for root in roots {
            self.reevaluate_pair(graph, broker, arbiter, id, root);
        }
    }

    /// Administrative introspection: every demand with its complete
    /// matches and the candidates stuck in `Partial`.
    pub fn reports(&self) -> Vec<DemandReport> {
        let mut reports: Vec<DemandReport> = self
            .demands
            .iter()
            .map(|(id, demand)| {
                let mut complete = Vec::new();
                let mut partial = Vec::new();
                for (root, candidate) in &demand.candidates {
                    match candidate.state {
                        MatchState::Complete => complete.push(*root),
                        MatchState::Partial => partial.push(PartialReport {
                            root: *root,
                            unmet: candidate.unmet.clone(),
                        }),
                    }
                }
                complete.sort_unstable();
                partial.sort_by_key(|p| p.root);
                DemandReport {
                    demand: *id,
                    consumer: demand.consumer,
                    listener: demand.listener.clone(),
                    root_type: demand.spec.root_type.clone(),
                    complete,
                    partial,
                }
            })
            .collect();
        reports.sort_by_key(|r| r.demand);
        reports
    }

    /// The current match state of a candidate, if tracked.
    pub fn state(&self, id: DemandId, root: Location) -> Option<MatchState> {
        self.demands
            .get(&id)?
            .candidates
            .get(&root)
            .map(|c| c.state)
    }

    /// Total candidate evaluations performed (diagnostic; bounded by
    /// changes actually touching demand footprints).
    pub fn evaluation_count(&self) -> u64 {
        self.evaluations
    }

    /// Number of registered demands.
    pub fn len(&self) -> usize {
        self.demands.len()
    }

    /// Whether no demands are registered.
    pub fn is_empty(&self) -> bool {
        self.demands.is_empty()
    }

    /// Materialize a pattern's required slots under `root_path`
    /// (exists-or-create per slot), so a consumer can declare the
    /// structure and then activate it.
    pub fn create_from_spec(
        graph: &mut ResourceGraph,
        spec: &PatternSpec,
        root_path: &ResourcePath,
    ) -> Result<Location, PatternError> {
        let parent = match root_path.parent() {
            Some(parent_path) => Some(graph.resolve_required(&parent_path)?),
            None => None,
        };
        let root = graph.create(parent, root_path.name(), &spec.root_type)?;
        for slot in &spec.slots {
            if slot.requirement == SlotRequirement::Optional {
                continue;
            }
            let mut current = root;
            let segments = slot.rel_path.segments();
            for (i, segment) in segments.iter().enumerate() {
                let is_last = i + 1 == segments.len();
                let type_name = if is_last {
                    slot.type_name.clone()
                } else {
                    let parent_type = graph
                        .type_name(current)
                        .map(str::to_string)
                        .unwrap_or_default();
                    let declared = graph
                        .registry()
                        .get(&parent_type)
                        .and_then(|d| d.slot(segment))
                        .map(|s| s.type_name.clone());
                    declared.ok_or_else(|| GraphError::UndeclaredChild {
                        parent_type,
                        name: segment.clone(),
                    })?
                };
                current = graph.create(Some(current), segment, &type_name)?;
            }
        }
        Ok(root)
    }

    fn reevaluate_pair(
        &mut self,
        graph: &ResourceGraph,
        broker: &EventBroker,
        arbiter: Option<&AccessArbiter>,
        id: DemandId,
        root: Location,
    ) {
        self.evaluations += 1;
        let Some(demand) = self.demands.get_mut(&id) else {
            return;
        };

        let root_ok = graph
            .type_name(root)
            .is_some_and(|t| graph.registry().compatible(t, &demand.spec.root_type));
        if !root_ok {
            // The root is gone (or no longer serves the demanded
            // type): drop the candidate entirely.
            let Some(old) = demand.candidates.remove(&root) else {
                return;
            };
            let consumer = demand.consumer;
            let listener = demand.listener.clone();
            for loc in &old.footprint {
                let empty = self
                    .footprint
                    .get_mut(loc)
                    .map(|set| {
                        set.remove(&(id, root));
                        set.is_empty()
                    })
                    .unwrap_or(false);
                if empty {
                    self.footprint.remove(loc);
                }
            }
            if old.state == MatchState::Complete {
                let event = Event::PatternUnavailable(PatternEvent {
                    demand: id,
                    root,
                    slots: old.slots,
                });
                if let Err(err) = broker.deliver(consumer, &listener, event) {
                    warn!(demand = %id, %err, "match-lost callback not deliverable");
                }
            }
            return;
        }

        let eval = evaluate(&demand.spec, &demand.accept, demand.consumer, graph, arbiter, root);
        let consumer = demand.consumer;
        let listener = demand.listener.clone();
        let old = demand.candidates.insert(
            root,
            Candidate {
                state: if eval.complete {
                    MatchState::Complete
                } else {
                    MatchState::Partial
                },
                slots: eval.slots.clone(),
                footprint: eval.footprint.clone(),
                unmet: eval.unmet,
            },
        );

        // Swap footprint index entries from the old evaluation to the
        // new one.
        if let Some(old) = &old {
            for loc in &old.footprint {
                let empty = self
                    .footprint
                    .get_mut(loc)
                    .map(|set| {
                        set.remove(&(id, root));
                        set.is_empty()
                    })
                    .unwrap_or(false);
                if empty {
                    self.footprint.remove(loc);
                }
            }
        }
        for loc in &eval.footprint {
            self.footprint.entry(*loc).or_default().insert((id, root));
        }

        let was_complete = old.map(|c| c.state == MatchState::Complete).unwrap_or(false);
        if eval.complete && !was_complete {
            let event = Event::PatternAvailable(PatternEvent {
                demand: id,
                root,
                slots: eval.slots,
            });
            if let Err(err) = broker.deliver(consumer, &listener, event) {
                warn!(demand = %id, %err, "match callback not deliverable");
            }
        } else if !eval.complete && was_complete {
            let event = Event::PatternUnavailable(PatternEvent {
                demand: id,
                root,
                slots: eval.slots,
            });
            if let Err(err) = broker.deliver(consumer, &listener, event) {
                warn!(demand = %id, %err, "match-lost callback not deliverable");
            }
        }
    }
}
