//! The runtime coordinator and its dispatch pump

use crate::app::{AppContext, Application, Cleanup, RouteKind, Routes, RuntimeError};
use hearth_broker::{AccessArbiter, EventBroker, Event, GrantSnapshot};
use hearth_channels::ChannelBindings;
use hearth_clock::{FrameworkClock, SimulationClock, SystemClock, TimerService};
use hearth_graph::{
    ChangeKind, ChangeRecord, CursorId, ResourceGraph, SharedGraph, TypeRegistry,
};
use hearth_patterns::{DemandReport, PatternEngine};
use hearth_types::{
    ConsumerId, ListenerHandle, Location, ResourcePath, StopReason, Value,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// One startup-replay operation supplied by the persistence
/// collaborator. The core mandates no file format; it only replays.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ReplayOp {
    Create {
        path: ResourcePath,
        type_name: String,
    },
    SetValue {
        path: ResourcePath,
        value: Value,
    },
    Activate {
        path: ResourcePath,
        cascade: bool,
    },
}

/// Counters over the whole runtime, for administration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeStats {
    pub applications: usize,
    pub cells: usize,
    pub demands: usize,
    pub bindings: usize,
    pub timers: usize,
}

struct AppEntry {
    name: String,
    app: Arc<Mutex<Box<dyn Application>>>,
    lifecycle: ListenerHandle,
}

/// The framework: owns every subsystem and drives the dispatch pump.
pub struct Runtime {
    graph: SharedGraph,
    broker: Arc<EventBroker>,
    arbiter: Arc<AccessArbiter>,
    patterns: Arc<Mutex<PatternEngine>>,
    channels: Arc<ChannelBindings>,
    timers: TimerService,
    clock: Arc<dyn FrameworkClock>,
    sim_clock: Option<Arc<SimulationClock>>,
    routes: Arc<Mutex<Routes>>,
    cleanup: Arc<Mutex<HashMap<ConsumerId, Cleanup>>>,
    apps: Mutex<HashMap<ConsumerId, AppEntry>>,
    pump_cursor: CursorId,
}

impl Runtime {
    /// A runtime on the wall clock.
    pub fn new(registry: TypeRegistry) -> Self {
        Self::with_clock(registry, Arc::new(SystemClock), None)
    }

    /// A runtime on a simulation clock, for accelerated-time testing.
    /// Consumer code is identical to the wall-clock runtime.
    pub fn simulated(registry: TypeRegistry) -> Self {
        let sim = Arc::new(SimulationClock::new());
        Self::with_clock(registry, sim.clone(), Some(sim))
    }

    fn with_clock(
        registry: TypeRegistry,
        clock: Arc<dyn FrameworkClock>,
        sim_clock: Option<Arc<SimulationClock>>,
    ) -> Self {
        let graph = ResourceGraph::shared(registry, clock.clone());
        let pump_cursor = graph.write().open_cursor();
        let broker = Arc::new(EventBroker::new());
        let arbiter = Arc::new(AccessArbiter::new());
        let timers = TimerService::new(clock.clone());
        let channels = Arc::new(ChannelBindings::new(
            graph.clone(),
            broker.clone(),
            arbiter.clone(),
            timers.clone(),
        ));
        Self {
            graph,
            broker,
            arbiter,
            patterns: Arc::new(Mutex::new(PatternEngine::new())),
            channels,
            timers,
            clock,
            sim_clock,
            routes: Arc::new(Mutex::new(Routes::default())),
            cleanup: Arc::new(Mutex::new(HashMap::new())),
            apps: Mutex::new(HashMap::new()),
            pump_cursor,
        }
    }

    /// The shared resource graph.
    pub fn graph(&self) -> &SharedGraph {
        &self.graph
    }

    /// The channel binding layer (driver registration lives here).
    pub fn channels(&self) -> &Arc<ChannelBindings> {
        &self.channels
    }

    /// The framework clock.
    pub fn clock(&self) -> &Arc<dyn FrameworkClock> {
        &self.clock
    }

    // ------------------------------------------------------------------
    // Application lifecycle

    /// Register an application. Its `on_start` is enqueued on the new
    /// consumer's queue and runs on the next pump.
    pub fn register_app(
        &self,
        name: impl Into<String>,
        app: Box<dyn Application>,
    ) -> Result<ConsumerId, RuntimeError> {
        let name = name.into();
        let consumer = ConsumerId::new();
        self.broker.register_consumer(consumer);

        let ctx = self.context_for(consumer);
        let app = Arc::new(Mutex::new(app));
        let app_for_listener = app.clone();
        let lifecycle = self.broker.add_listener(consumer, move |event| match event {
            Event::Started => app_for_listener.lock().on_start(&ctx),
            Event::Stopped(reason) => app_for_listener.lock().on_stop(*reason),
            _ => {}
        })?;
        self.broker.deliver(consumer, &lifecycle, Event::Started)?;

        info!(app = %name, %consumer, "application registered");
        self.apps.lock().insert(
            consumer,
            AppEntry {
                name,
                app,
                lifecycle,
            },
        );
        Ok(consumer)
    }

    /// Stop an application: pending events are drained, `on_stop`
    /// fires as the final callback, and every registration made
    /// through its context (grants, demands, listeners, bindings,
    /// timers) is released. No callback of this application runs
    /// after this returns.
    pub fn stop_app(&self, consumer: ConsumerId, reason: StopReason) -> bool {
        let Some(entry) = self.apps.lock().remove(&consumer) else {
            return false;
        };
        info!(app = %entry.name, %consumer, ?reason, "stopping application");

        // Final callback, after everything already queued.
        if let Err(err) = self
            .broker
            .deliver(consumer, &entry.lifecycle, Event::Stopped(reason))
        {
            warn!(%consumer, %err, "stop event not deliverable");
        }
        self.broker.dispatch(consumer);

        // Tear down in registration-reverse dependency order.
        let cleanup = self.cleanup.lock().remove(&consumer).unwrap_or_default();
        for handle in &cleanup.timers {
            handle.close();
        }
        for handle in &cleanup.schedules {
            handle.close();
        }
        for binding in &cleanup.bindings {
            let _ = self.channels.unmap_binding(*binding);
        }
        {
            let mut patterns = self.patterns.lock();
            patterns.withdraw_consumer(&self.broker, consumer);
        }
        {
            let mut routes = self.routes.lock();
            for handle in &cleanup.listeners {
                routes.remove(handle);
            }
        }
        self.arbiter.release_all(consumer);
        self.broker.remove_consumer(consumer);
        drop(entry.app);
        true
    }

    /// A context for interacting with the framework outside any
    /// application (tooling, tests, the management layer).
    pub fn admin_context(&self) -> AppContext {
        let consumer = ConsumerId::new();
        self.broker.register_consumer(consumer);
        self.context_for(consumer)
    }

    fn context_for(&self, consumer: ConsumerId) -> AppContext {
        AppContext {
            consumer,
            graph: self.graph.clone(),
            broker: self.broker.clone(),
            arbiter: self.arbiter.clone(),
            patterns: self.patterns.clone(),
            channels: self.channels.clone(),
            timers: self.timers.clone(),
            clock: self.clock.clone(),
            routes: self.routes.clone(),
            cleanup: self.cleanup.clone(),
        }
    }

    // ------------------------------------------------------------------
    // The pump

    /// Process pending graph changes and drain every consumer queue.
    ///
    /// Per batch the order is fixed: resource listeners are enqueued
    /// first, then the pattern engine re-evaluates, then channel
    /// write-backs run, so a consumer always observes the raw change
    /// before any derived pattern callback. The pump loops until
    /// callbacks stop producing new changes.
    pub fn advance(&self) -> usize {
        let mut delivered = 0;
        loop {
            let records = self.graph.write().read_changes(self.pump_cursor);
            if records.is_empty() {
                let dispatched = self.broker.dispatch_all();
                delivered += dispatched;
                if dispatched == 0 {
                    break;
                }
                continue;
            }
            self.route_records(&records);
            {
                let mut patterns = self.patterns.lock();
                let graph = self.graph.read();
                patterns.apply_changes(&graph, &self.broker, Some(&self.arbiter), &records);
            }
            self.channels.handle_changes(&records);
            delivered += self.broker.dispatch_all();
        }
        delivered
    }

    /// Advance the simulation clock by `ms`, fire due timers (which
    /// drives channel sampling), then pump. On a wall-clock runtime
    /// the clock is left alone and only due timers fire.
    pub fn advance_time(&self, ms: i64) -> usize {
        if let Some(sim) = &self.sim_clock {
            sim.advance(ms);
        }
        self.timers.tick();
        self.advance()
    }

    fn route_records(&self, records: &[ChangeRecord]) {
        for record in records {
            let targets: Vec<(ConsumerId, ListenerHandle, RouteKind)> = {
                let routes = self.routes.lock();
                let mut out = Vec::new();
                if record.kind == ChangeKind::ValueChanged {
                    if let Some(entries) = routes.value.get(&record.location) {
                        out.extend(
                            entries
                                .iter()
                                .map(|(c, h)| (*c, h.clone(), RouteKind::Value)),
                        );
                    }
                } else {
                    if let Some(entries) = routes.structure.get(&record.location) {
                        out.extend(
                            entries
                                .iter()
                                .map(|(c, h)| (*c, h.clone(), RouteKind::Structure)),
                        );
                    }
                    if let Some(parent) = record.parent {
                        if let Some(entries) = routes.structure.get(&parent) {
                            out.extend(
                                entries
                                    .iter()
                                    .map(|(c, h)| (*c, h.clone(), RouteKind::Structure)),
                            );
                        }
                    }
                }
                out
            };
            for (consumer, handle, _) in targets {
                if let Err(err) =
                    self.broker
                        .deliver(consumer, &handle, Event::Resource(record.clone()))
                {
                    debug!(%consumer, %err, "resource event not deliverable");
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Persistence collaborator

    /// Populate the graph by replaying externally-supplied operations
    /// (load-at-start). Structural errors abort the replay.
    pub fn replay(&self, ops: impl IntoIterator<Item = ReplayOp>) -> Result<(), RuntimeError> {
        let mut graph = self.graph.write();
        for op in ops {
            match op {
                ReplayOp::Create { path, type_name } => {
                    let parent = match path.parent() {
                        Some(parent_path) => Some(graph.resolve_required(&parent_path)?),
                        None => None,
                    };
                    graph.create(parent, path.name(), &type_name)?;
                }
                ReplayOp::SetValue { path, value } => {
                    let location = graph.resolve_required(&path)?;
                    graph.set_value(location, value)?;
                }
                ReplayOp::Activate { path, cascade } => {
                    let location = graph.resolve_required(&path)?;
                    graph.activate(location, cascade)?;
                }
            }
        }
        Ok(())
    }

    /// Open a change-stream cursor for write-ahead tailing.
    pub fn change_cursor(&self) -> CursorId {
        self.graph.write().open_cursor()
    }

    /// Read and advance a change-stream cursor.
    pub fn read_change_stream(&self, cursor: CursorId) -> Vec<ChangeRecord> {
        self.graph.write().read_changes(cursor)
    }

    // ------------------------------------------------------------------
    // Administration

    /// Per-demand match/partial introspection.
    pub fn pattern_reports(&self) -> Vec<DemandReport> {
        self.patterns.lock().reports()
    }

    /// Grant table of one location.
    pub fn grant_snapshot(&self, location: Location) -> GrantSnapshot {
        self.arbiter.snapshot(location)
    }

    /// Runtime-wide counters.
    pub fn stats(&self) -> RuntimeStats {
        RuntimeStats {
            applications: self.apps.lock().len(),
            cells: self.graph.read().len(),
            demands: self.patterns.lock().len(),
            bindings: self.channels.len(),
            timers: self.timers.len(),
        }
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        let consumers: Vec<ConsumerId> = self.apps.lock().keys().copied().collect();
        for consumer in consumers {
            self.stop_app(consumer, StopReason::Normal);
        }
        self.patterns.lock().close(&self.broker);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hearth_graph::{SlotDescriptor, TypeDescriptor};
    use hearth_patterns::{CallbackPatternListener, PatternSpec};
    use hearth_types::ValueKind;
    use std::sync::Mutex as StdMutex;

    fn registry() -> TypeRegistry {
        let mut reg = TypeRegistry::new();
        reg.register(TypeDescriptor::value("float", ValueKind::Float))
            .unwrap();
        reg.register(TypeDescriptor::value("bool", ValueKind::Bool))
            .unwrap();
        reg.register(TypeDescriptor::composite(
            "meter",
            vec![
                SlotDescriptor::required("reading", "float"),
                SlotDescriptor::optional("enabled", "bool"),
            ],
        ))
        .unwrap();
        reg
    }

    struct NullApp;
    impl Application for NullApp {
        fn on_start(&mut self, _ctx: &AppContext) {}
    }

    #[test]
    fn test_on_start_runs_on_pump() {
        let rt = Runtime::simulated(registry());
        let started = Arc::new(StdMutex::new(false));

        struct StartApp(Arc<StdMutex<bool>>);
        impl Application for StartApp {
            fn on_start(&mut self, _ctx: &AppContext) {
                *self.0.lock().unwrap() = true;
            }
        }

        rt.register_app("start-app", Box::new(StartApp(started.clone())))
            .unwrap();
        assert!(!*started.lock().unwrap());
        rt.advance();
        assert!(*started.lock().unwrap());
    }

    #[test]
    fn test_value_listener_sees_sequential_writes_in_order() {
        let rt = Runtime::simulated(registry());
        let ctx = rt.admin_context();
        let meter = ctx.create(None, "meter", "meter").unwrap();
        let reading = ctx.create(Some(meter), "reading", "float").unwrap();
        rt.advance();

        let seen = Arc::new(StdMutex::new(Vec::new()));
        let seen2 = seen.clone();
        let ctx_listener = rt.admin_context();
        let ctx_for_values = ctx_listener.clone();
        ctx_listener
            .add_value_listener(reading, move |record| {
                if let Ok(Value::Float(v)) = ctx_for_values.get_value(record.location) {
                    seen2.lock().unwrap().push(v);
                }
            })
            .unwrap();

        for v in [1.0, 2.0, 3.0] {
            ctx.set_value(reading, Value::Float(v)).unwrap();
            rt.advance();
        }
        assert_eq!(*seen.lock().unwrap(), vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_raw_change_precedes_pattern_callback() {
        let rt = Runtime::simulated(registry());
        let ctx = rt.admin_context();
        let meter = ctx.create(None, "meter", "meter").unwrap();
        let reading = ctx.create(Some(meter), "reading", "float").unwrap();
        rt.advance();

        let order = Arc::new(StdMutex::new(Vec::new()));
        let order_value = order.clone();
        let order_match = order.clone();
        ctx.add_structure_listener(reading, move |record| {
            if record.kind == ChangeKind::Activated {
                order_value.lock().unwrap().push("raw");
            }
        })
        .unwrap();
        ctx.register_pattern(
            PatternSpec::new("meter").require(
                "reading",
                ResourcePath::parse("reading").unwrap(),
                "float",
            ),
            Box::new(CallbackPatternListener::new(
                move |_: &hearth_broker::PatternEvent| order_match.lock().unwrap().push("match"),
                |_: &hearth_broker::PatternEvent| {},
            )),
            Box::new(|_| true),
        )
        .unwrap();

        ctx.activate(meter, true).unwrap();
        rt.advance();
        assert_eq!(*order.lock().unwrap(), vec!["raw", "match"]);
    }

    #[test]
    fn test_stop_app_cleans_everything_up() {
        let rt = Runtime::simulated(registry());

        struct MeterApp;
        impl Application for MeterApp {
            fn on_start(&mut self, ctx: &AppContext) {
                let meter = ctx.create(None, "meter", "meter").unwrap();
                let reading = ctx.create(Some(meter), "reading", "float").unwrap();
                ctx.add_value_listener(reading, |_| {}).unwrap();
                ctx.register_pattern(
                    PatternSpec::new("meter"),
                    Box::new(CallbackPatternListener::new(
                        |_: &hearth_broker::PatternEvent| {},
                        |_: &hearth_broker::PatternEvent| {},
                    )),
                    Box::new(|_| true),
                )
                .unwrap();
                ctx.create_timer(1000, |_| {}).unwrap();
            }
        }

        let consumer = rt.register_app("meter-app", Box::new(MeterApp)).unwrap();
        rt.advance();
        assert_eq!(rt.stats().demands, 1);
        assert_eq!(rt.stats().timers, 1);

        let stopped = rt.stop_app(consumer, StopReason::Normal);
        assert!(stopped);
        let stats = rt.stats();
        assert_eq!(stats.applications, 0);
        assert_eq!(stats.demands, 0);
        assert_eq!(stats.timers, 0);
        // The graph itself survives the application.
        assert!(stats.cells > 0);
    }

    #[test]
    fn test_on_stop_receives_reason() {
        let rt = Runtime::simulated(registry());
        let reason_seen = Arc::new(StdMutex::new(None));

        struct StopApp(Arc<StdMutex<Option<StopReason>>>);
        impl Application for StopApp {
            fn on_start(&mut self, _ctx: &AppContext) {}
            fn on_stop(&mut self, reason: StopReason) {
                *self.0.lock().unwrap() = Some(reason);
            }
        }

        let consumer = rt
            .register_app("stop-app", Box::new(StopApp(reason_seen.clone())))
            .unwrap();
        rt.advance();
        rt.stop_app(consumer, StopReason::Error);
        assert_eq!(*reason_seen.lock().unwrap(), Some(StopReason::Error));
    }

    #[test]
    fn test_replay_then_change_stream() {
        let rt = Runtime::simulated(registry());
        let tail = rt.change_cursor();
        rt.replay(vec![
            ReplayOp::Create {
                path: ResourcePath::parse("meter").unwrap(),
                type_name: "meter".to_string(),
            },
            ReplayOp::Create {
                path: ResourcePath::parse("meter/reading").unwrap(),
                type_name: "float".to_string(),
            },
            ReplayOp::SetValue {
                path: ResourcePath::parse("meter/reading").unwrap(),
                value: Value::Float(9.5),
            },
            ReplayOp::Activate {
                path: ResourcePath::parse("meter").unwrap(),
                cascade: true,
            },
        ])
        .unwrap();
        rt.advance();

        let reading = rt
            .graph()
            .read()
            .resolve(&ResourcePath::parse("meter/reading").unwrap())
            .unwrap();
        assert_eq!(
            rt.graph().read().get_value(reading).unwrap(),
            Value::Float(9.5)
        );

        let kinds: Vec<ChangeKind> = rt
            .read_change_stream(tail)
            .iter()
            .map(|r| r.kind)
            .collect();
        assert_eq!(
            kinds,
            vec![
                ChangeKind::Created,
                ChangeKind::Created,
                ChangeKind::ValueChanged,
                ChangeKind::Activated,
                ChangeKind::Activated,
            ]
        );
    }

    #[test]
    fn test_set_value_gated_by_arbiter() {
        let rt = Runtime::simulated(registry());
        let owner = rt.admin_context();
        let other = rt.admin_context();
        let meter = owner.create(None, "meter", "meter").unwrap();
        let reading = owner.create(Some(meter), "reading", "float").unwrap();

        assert!(owner
            .request_access(
                reading,
                hearth_broker::AccessMode::Exclusive,
                hearth_broker::AccessPriority::Highest,
                None
            )
            .unwrap());
        assert!(other.set_value(reading, Value::Float(1.0)).is_err());
        assert!(owner.set_value(reading, Value::Float(1.0)).is_ok());

        owner.release_access(reading);
        assert!(other.set_value(reading, Value::Float(2.0)).is_ok());
    }

    #[test]
    fn test_replay_ops_round_trip_as_json() {
        let op = ReplayOp::SetValue {
            path: ResourcePath::parse("meter/reading").unwrap(),
            value: Value::Float(1.5),
        };
        let json = serde_json::to_string(&op).unwrap();
        let back: ReplayOp = serde_json::from_str(&json).unwrap();
        assert_eq!(back, op);
    }

    #[test]
    fn test_stats_count_apps() {
        let rt = Runtime::simulated(registry());
        rt.register_app("a", Box::new(NullApp)).unwrap();
        rt.register_app("b", Box::new(NullApp)).unwrap();
        rt.advance();
        assert_eq!(rt.stats().applications, 2);
    }
}
