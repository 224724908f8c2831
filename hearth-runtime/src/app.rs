//! The consumer (application) contract and its gated context
//!
//! Every interaction of an application with the framework flows
//! through its [`AppContext`], which carries the application's
//! [`ConsumerId`]: writes are gated by the access arbiter, listeners
//! and demands are registered on the application's own queue, and
//! everything registered through the context is cleaned up when the
//! application stops.

use hearth_broker::{
    AccessArbiter, AccessError, AccessMode, AccessPriority, BrokerError, Event, EventBroker,
};
use hearth_channels::{
    BindingId, ChannelBindings, ChannelError, ChannelLocator, Direction, ErrorSink, Transform,
};
use hearth_clock::{FrameworkClock, ScheduleHandle, TimerError, TimerHandle, TimerService};
use hearth_graph::{ChangeRecord, GraphError, SharedGraph};
use hearth_patterns::{AcceptFn, PatternEngine, PatternError, PatternListener, PatternSpec};
use hearth_types::{
    ConsumerId, DemandId, ListenerHandle, Location, ResourcePath, StopReason, Timestamp, Value,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Unified error surface of the application-facing API.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error(transparent)]
    Access(#[from] AccessError),
    #[error(transparent)]
    Broker(#[from] BrokerError),
    #[error(transparent)]
    Pattern(#[from] PatternError),
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Timer(#[from] TimerError),
}

/// A framework consumer.
///
/// `on_start` runs on the application's own queue once registration
/// completes; `on_stop` runs there as the final callback, after which
/// no callback of this application runs again.
pub trait Application: Send {
    fn on_start(&mut self, ctx: &AppContext);

    fn on_stop(&mut self, reason: StopReason) {
        let _ = reason;
    }
}

/// Which route table a resource listener lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RouteKind {
    /// `ValueChanged` records for exactly the listened location.
    Value,
    /// Structural records (created/deleted/activation/reference) for
    /// the location or its direct children.
    Structure,
}

#[derive(Default)]
pub(crate) struct Routes {
    pub(crate) value: HashMap<Location, Vec<(ConsumerId, ListenerHandle)>>,
    pub(crate) structure: HashMap<Location, Vec<(ConsumerId, ListenerHandle)>>,
    pub(crate) by_handle: HashMap<ListenerHandle, (Location, RouteKind)>,
}

impl Routes {
    fn insert(
        &mut self,
        kind: RouteKind,
        location: Location,
        consumer: ConsumerId,
        handle: ListenerHandle,
    ) {
        let table = match kind {
            RouteKind::Value => &mut self.value,
            RouteKind::Structure => &mut self.structure,
        };
        table.entry(location).or_default().push((consumer, handle.clone()));
        self.by_handle.insert(handle, (location, kind));
    }

    pub(crate) fn remove(&mut self, handle: &ListenerHandle) -> bool {
        let Some((location, kind)) = self.by_handle.remove(handle) else {
            return false;
        };
        let table = match kind {
            RouteKind::Value => &mut self.value,
            RouteKind::Structure => &mut self.structure,
        };
        if let Some(entries) = table.get_mut(&location) {
            entries.retain(|(_, h)| h != handle);
            if entries.is_empty() {
                table.remove(&location);
            }
        }
        true
    }
}

/// Registrations to tear down when an application stops. Demands are
/// not tracked here; the pattern engine withdraws them by consumer.
#[derive(Default)]
pub(crate) struct Cleanup {
    pub(crate) listeners: Vec<ListenerHandle>,
    pub(crate) bindings: Vec<BindingId>,
    pub(crate) timers: Vec<TimerHandle>,
    pub(crate) schedules: Vec<ScheduleHandle>,
}

/// Capability-scoped handle an application uses for everything.
#[derive(Clone)]
pub struct AppContext {
    pub(crate) consumer: ConsumerId,
    pub(crate) graph: SharedGraph,
    pub(crate) broker: Arc<EventBroker>,
    pub(crate) arbiter: Arc<AccessArbiter>,
    pub(crate) patterns: Arc<Mutex<PatternEngine>>,
    pub(crate) channels: Arc<ChannelBindings>,
    pub(crate) timers: TimerService,
    pub(crate) clock: Arc<dyn FrameworkClock>,
    pub(crate) routes: Arc<Mutex<Routes>>,
    pub(crate) cleanup: Arc<Mutex<HashMap<ConsumerId, Cleanup>>>,
}

impl AppContext {
    /// The application's consumer identity.
    pub fn consumer(&self) -> ConsumerId {
        self.consumer
    }

    /// Current framework time.
    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    // ------------------------------------------------------------------
    // Resource management

    /// Exists-or-create a resource (see the graph store contract).
    pub fn create(
        &self,
        parent: Option<Location>,
        name: &str,
        type_name: &str,
    ) -> Result<Location, RuntimeError> {
        Ok(self.graph.write().create(parent, name, type_name)?)
    }

    /// Delete a resource and its owned subtree.
    pub fn delete(&self, location: Location) -> Result<(), RuntimeError> {
        Ok(self.graph.write().delete(location)?)
    }

    /// Resolve a path from the root.
    pub fn resolve(&self, path: &ResourcePath) -> Option<Location> {
        self.graph.read().resolve(path)
    }

    /// Read a value.
    pub fn get_value(&self, location: Location) -> Result<Value, RuntimeError> {
        Ok(self.graph.read().get_value(location)?)
    }

    /// Write a value, gated by the access arbiter: fails with
    /// `AccessDenied` while another consumer holds exclusive access.
    pub fn set_value(&self, location: Location, value: Value) -> Result<(), RuntimeError> {
        self.arbiter.check_write(self.consumer, location)?;
        Ok(self.graph.write().set_value(location, value)?)
    }

    pub fn activate(&self, location: Location, cascade: bool) -> Result<(), RuntimeError> {
        Ok(self.graph.write().activate(location, cascade)?)
    }

    pub fn deactivate(&self, location: Location, cascade: bool) -> Result<(), RuntimeError> {
        Ok(self.graph.write().deactivate(location, cascade)?)
    }

    /// Attach a decorator child.
    pub fn add_decorator(
        &self,
        parent: Location,
        name: &str,
        type_name: &str,
    ) -> Result<Location, RuntimeError> {
        Ok(self.graph.write().add_decorator(parent, name, type_name)?)
    }

    /// Create or retarget a reference child.
    pub fn add_reference(
        &self,
        parent: Location,
        name: &str,
        target: Location,
    ) -> Result<Location, RuntimeError> {
        Ok(self.graph.write().add_reference(parent, name, target)?)
    }

    /// Append an element to a list resource.
    pub fn list_add(&self, list: Location) -> Result<Location, RuntimeError> {
        Ok(self.graph.write().list_add(list)?)
    }

    /// Remove a list element by index.
    pub fn list_remove(&self, list: Location, index: usize) -> Result<(), RuntimeError> {
        Ok(self.graph.write().list_remove(list, index)?)
    }

    // ------------------------------------------------------------------
    // Listeners

    /// Listen for value changes of one cell. The callback runs on this
    /// application's queue, in change order.
    pub fn add_value_listener(
        &self,
        location: Location,
        mut callback: impl FnMut(&ChangeRecord) + Send + 'static,
    ) -> Result<ListenerHandle, RuntimeError> {
        let handle = self.broker.add_listener(self.consumer, move |event| {
            if let Event::Resource(record) = event {
                callback(record);
            }
        })?;
        self.routes
            .lock()
            .insert(RouteKind::Value, location, self.consumer, handle.clone());
        self.track(|c| c.listeners.push(handle.clone()));
        Ok(handle)
    }

    /// Listen for structural changes of one cell and its direct
    /// children (creation, deletion, activation, references).
    pub fn add_structure_listener(
        &self,
        location: Location,
        mut callback: impl FnMut(&ChangeRecord) + Send + 'static,
    ) -> Result<ListenerHandle, RuntimeError> {
        let handle = self.broker.add_listener(self.consumer, move |event| {
            if let Event::Resource(record) = event {
                callback(record);
            }
        })?;
        self.routes
            .lock()
            .insert(RouteKind::Structure, location, self.consumer, handle.clone());
        self.track(|c| c.listeners.push(handle.clone()));
        Ok(handle)
    }

    /// Remove a listener. Synchronous-and-complete: queued deliveries
    /// are purged and no callback runs after this returns.
    pub fn remove_listener(&self, handle: &ListenerHandle) -> bool {
        self.routes.lock().remove(handle);
        let removed = self.broker.remove_listener(handle);
        self.track(|c| c.listeners.retain(|h| h != handle));
        removed
    }

    // ------------------------------------------------------------------
    // Access arbitration

    /// Request an access mode on a location. `on_revoked` runs on this
    /// application's queue if a higher-priority consumer preempts the
    /// grant.
    pub fn request_access(
        &self,
        location: Location,
        mode: AccessMode,
        priority: AccessPriority,
        on_revoked: Option<Box<dyn FnMut(Location) + Send>>,
    ) -> Result<bool, RuntimeError> {
        let revoke_listener = match on_revoked {
            Some(mut callback) => {
                let handle = self.broker.add_listener(self.consumer, move |event| {
                    if let Event::AccessRevoked { location } = event {
                        callback(*location);
                    }
                })?;
                self.track(|c| c.listeners.push(handle.clone()));
                Some(handle)
            }
            None => None,
        };
        Ok(self.arbiter.request_access(
            &self.broker,
            self.consumer,
            location,
            mode,
            priority,
            revoke_listener,
        ))
    }

    /// Release this application's grant on a location.
    pub fn release_access(&self, location: Location) {
        self.arbiter.release(self.consumer, location);
    }

    // ------------------------------------------------------------------
    // Patterns

    /// Register a pattern demand. Match callbacks arrive on this
    /// application's queue.
    pub fn register_pattern(
        &self,
        spec: PatternSpec,
        listener: Box<dyn PatternListener>,
        accept: AcceptFn,
    ) -> Result<DemandId, RuntimeError> {
        let mut engine = self.patterns.lock();
        let graph = self.graph.read();
        let demand = engine.register_demand(
            &graph,
            &self.broker,
            Some(&self.arbiter),
            self.consumer,
            spec,
            listener,
            accept,
        )?;
        drop(graph);
        drop(engine);
        Ok(demand)
    }

    /// Withdraw a demand. No match callback runs after this returns.
    pub fn withdraw_pattern(&self, demand: DemandId) -> bool {
        self.patterns.lock().withdraw_demand(&self.broker, demand)
    }

    /// Materialize a pattern's required structure under `root_path`.
    pub fn create_from_spec(
        &self,
        spec: &PatternSpec,
        root_path: &ResourcePath,
    ) -> Result<Location, RuntimeError> {
        let mut graph = self.graph.write();
        Ok(PatternEngine::create_from_spec(&mut graph, spec, root_path)?)
    }

    // ------------------------------------------------------------------
    // Channels

    /// Map a hardware channel to a resource cell.
    pub fn map_channel(
        &self,
        locator: ChannelLocator,
        location: Location,
        direction: Direction,
        period_ms: i64,
        transform: Transform,
        error_sink: Option<ErrorSink>,
    ) -> Result<BindingId, RuntimeError> {
        let id = self.channels.map_channel(
            locator,
            location,
            direction,
            period_ms,
            transform,
            error_sink,
        )?;
        self.track(|c| c.bindings.push(id));
        Ok(id)
    }

    /// Unmap every binding of a channel. No driver call happens for
    /// the channel after this returns.
    pub fn unmap_channel(&self, locator: &ChannelLocator) -> usize {
        self.channels.unmap_channel(locator)
    }

    /// Unmap only the bindings of a channel to one resource.
    pub fn unmap_channel_resource(&self, locator: &ChannelLocator, location: Location) -> usize {
        self.channels.unmap_channel_resource(locator, location)
    }

    // ------------------------------------------------------------------
    // Timers

    /// Create a periodic timer on the framework clock.
    pub fn create_timer(
        &self,
        period_ms: i64,
        listener: impl FnMut(Timestamp) + Send + 'static,
    ) -> Result<TimerHandle, RuntimeError> {
        let handle = self.timers.create_timer(period_ms, listener)?;
        self.track(|c| c.timers.push(handle.clone()));
        Ok(handle)
    }

    /// Schedule a cron expression on the framework clock.
    pub fn schedule(
        &self,
        cron_expr: &str,
        runnable: impl FnMut(Timestamp) + Send + 'static,
    ) -> Result<ScheduleHandle, RuntimeError> {
        let handle = self.timers.schedule(cron_expr, runnable)?;
        self.track(|c| c.schedules.push(handle.clone()));
        Ok(handle)
    }

    fn track(&self, f: impl FnOnce(&mut Cleanup)) {
        let mut cleanup = self.cleanup.lock();
        f(cleanup.entry(self.consumer).or_default());
    }
}
