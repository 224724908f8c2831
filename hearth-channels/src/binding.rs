//! Channel-to-resource bindings
//!
//! A binding maps one channel locator to one graph cell with a
//! direction, sampling period and linear transform
//! (`resource = raw * scale + offset`). Input sampling runs on the
//! framework timer service; write-back runs when the runtime pump
//! feeds value changes through [`ChannelBindings::handle_changes`].

use crate::driver::{ChannelDriver, ChannelLocator, DriverError};
use hearth_broker::{AccessArbiter, AccessMode, AccessPriority, EventBroker};
use hearth_clock::{TimerError, TimerHandle, TimerService};
use hearth_graph::{ChangeKind, ChangeRecord, GraphError, SharedGraph};
use hearth_types::{ConsumerId, Location, Quality, Timestamp, Value};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Identity of one channel binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BindingId(pub u64);

static BINDING_COUNTER: AtomicU64 = AtomicU64::new(1);

impl BindingId {
    fn next() -> Self {
        Self(BINDING_COUNTER.fetch_add(1, Ordering::SeqCst))
    }
}

impl fmt::Display for BindingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "binding:{}", self.0)
    }
}

/// Data flow direction of a binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    /// Hardware to resource (periodic sampling).
    Input,
    /// Resource to hardware (write-back on value change).
    Output,
    /// Both directions.
    InOut,
}

impl Direction {
    fn samples(self) -> bool {
        matches!(self, Direction::Input | Direction::InOut)
    }

    fn writes_back(self) -> bool {
        matches!(self, Direction::Output | Direction::InOut)
    }
}

/// Linear scaling between raw hardware values and resource values.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Transform {
    pub scale: f64,
    pub offset: f64,
}

impl Transform {
    /// Identity transform.
    pub fn identity() -> Self {
        Self {
            scale: 1.0,
            offset: 0.0,
        }
    }

    pub fn new(scale: f64, offset: f64) -> Self {
        Self { scale, offset }
    }

    /// Raw hardware value to resource value.
    pub fn apply(&self, raw: f64) -> f64 {
        raw * self.scale + self.offset
    }

    /// Resource value back to raw hardware value.
    pub fn invert(&self, resource: f64) -> f64 {
        (resource - self.offset) / self.scale
    }
}

/// Per-binding failure counters, queryable as a health signal.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BindingHealth {
    pub consecutive_failures: u64,
    pub last_success: Option<Timestamp>,
    pub last_error: Option<String>,
}

/// Callback receiving write-back failures.
pub type ErrorSink = Box<dyn Fn(&ChannelLocator, &DriverError) + Send + Sync>;

/// Errors from binding management.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// The mapped resource failed structurally.
    #[error(transparent)]
    Graph(#[from] GraphError),

    /// The sampling timer could not be created.
    #[error(transparent)]
    Timer(#[from] TimerError),

    /// Passed through from the driver (e.g. during address listing).
    #[error(transparent)]
    Driver(#[from] DriverError),

    /// A zero scale cannot be inverted for write-back.
    #[error("transform scale must be non-zero")]
    ZeroScale,

    /// The mapped cell does not hold a numeric value kind.
    #[error("resource {0} is not numeric")]
    NotNumeric(Location),

    /// No driver is registered for the interface.
    #[error("no driver registered for interface {0:?}")]
    UnknownInterface(String),

    /// The binding id is not mapped.
    #[error("unknown binding: {0}")]
    UnknownBinding(BindingId),
}

type SharedDriver = Arc<Mutex<Box<dyn ChannelDriver>>>;

struct BindingState {
    locator: ChannelLocator,
    location: Location,
    direction: Direction,
    transform: Transform,
    timer: Option<TimerHandle>,
    health: Arc<Mutex<BindingHealth>>,
    error_sink: Option<ErrorSink>,
    /// Raw value last written into the graph by sampling; write-back
    /// skips records echoing it so an `InOut` binding does not push
    /// its own samples back out.
    last_sampled_raw: Arc<Mutex<Option<f64>>>,
}

/// Registry of drivers and channel bindings.
pub struct ChannelBindings {
    graph: SharedGraph,
    broker: Arc<EventBroker>,
    arbiter: Arc<AccessArbiter>,
    timers: TimerService,
    /// Consumer identity the layer writes under; grants are requested
    /// at the fixed driver priority.
    driver_consumer: ConsumerId,
    drivers: Mutex<HashMap<String, SharedDriver>>,
    bindings: Mutex<HashMap<BindingId, BindingState>>,
}

impl ChannelBindings {
    /// The fixed arbitration priority the channel layer writes at.
    pub const DRIVER_PRIORITY: AccessPriority = AccessPriority::DeviceSpecific;

    pub fn new(
        graph: SharedGraph,
        broker: Arc<EventBroker>,
        arbiter: Arc<AccessArbiter>,
        timers: TimerService,
    ) -> Self {
        let driver_consumer = ConsumerId::new();
        broker.register_consumer(driver_consumer);
        Self {
            graph,
            broker,
            arbiter,
            timers,
            driver_consumer,
            drivers: Mutex::new(HashMap::new()),
            bindings: Mutex::new(HashMap::new()),
        }
    }

    /// The consumer identity the binding layer acts as.
    pub fn driver_consumer(&self) -> ConsumerId {
        self.driver_consumer
    }

    /// Register a driver for an interface id, replacing any previous
    /// driver for the same interface.
    pub fn register_driver(&self, interface: impl Into<String>, driver: Box<dyn ChannelDriver>) {
        self.drivers
            .lock()
            .insert(interface.into(), Arc::new(Mutex::new(driver)));
    }

    /// Channels the interface's driver currently knows.
    pub fn known_addresses(&self, interface: &str) -> Result<Vec<ChannelLocator>, ChannelError> {
        let driver = self
            .drivers
            .lock()
            .get(interface)
            .cloned()
            .ok_or_else(|| ChannelError::UnknownInterface(interface.to_string()))?;
        let driver = driver.lock();
        Ok(driver.list_known_addresses(interface)?)
    }

    /// Map a channel to a resource cell.
    ///
    /// Input (and in/out) bindings start sampling on a periodic
    /// framework timer immediately; each successful sample writes
    /// `raw * scale + offset` into the cell at driver priority, with
    /// the sample's quality. A failed read skips the tick and is
    /// retried on the next period.
    pub fn map_channel(
        &self,
        locator: ChannelLocator,
        location: Location,
        direction: Direction,
        period_ms: i64,
        transform: Transform,
        error_sink: Option<ErrorSink>,
    ) -> Result<BindingId, ChannelError> {
        if transform.scale == 0.0 {
            return Err(ChannelError::ZeroScale);
        }
        let kind = {
            let graph = self.graph.read();
            if !graph.exists(location) {
                return Err(ChannelError::Graph(GraphError::NotFound(
                    location.to_string(),
                )));
            }
            graph.value_kind(location)
        };
        let Some(kind) = kind else {
            return Err(ChannelError::NotNumeric(location));
        };
        if Value::from_f64(kind, 0.0).is_none() {
            return Err(ChannelError::NotNumeric(location));
        }
        let driver = self
            .drivers
            .lock()
            .get(&locator.interface)
            .cloned()
            .ok_or_else(|| ChannelError::UnknownInterface(locator.interface.clone()))?;

        let id = BindingId::next();
        let health = Arc::new(Mutex::new(BindingHealth::default()));
        let last_sampled_raw = Arc::new(Mutex::new(None));

        let timer = if direction.samples() {
            let graph = self.graph.clone();
            let arbiter = self.arbiter.clone();
            let consumer = self.driver_consumer;
            let sample_locator = locator.clone();
            let sample_health = health.clone();
            let sample_last_raw = last_sampled_raw.clone();
            let handle = self.timers.create_timer(period_ms, move |now| {
                let result = {
                    let mut driver = driver.lock();
                    driver
                        .read_channels(std::slice::from_ref(&sample_locator))
                        .into_iter()
                        .next()
                        .unwrap_or_else(|| {
                            Err(DriverError::UnknownChannel(sample_locator.to_string()))
                        })
                };
                match result {
                    Ok(sample) => {
                        if arbiter.check_write(consumer, location).is_err() {
                            // A higher-priority writer owns the cell;
                            // sampling resumes once it lets go.
                            debug!(channel = %sample_locator, %location, "sample skipped, cell exclusively held");
                            return;
                        }
                        let value = transform.apply(sample.raw);
                        let Some(value) = Value::from_f64(kind, value) else {
                            return;
                        };
                        *sample_last_raw.lock() = Some(sample.raw);
                        let write = write_cell(&graph, location, value, sample.quality);
                        let mut health = sample_health.lock();
                        match write {
                            Ok(()) => {
                                health.consecutive_failures = 0;
                                health.last_success = Some(now);
                            }
                            Err(err) => {
                                health.consecutive_failures += 1;
                                health.last_error = Some(err.to_string());
                            }
                        }
                    }
                    Err(err) => {
                        let mut health = sample_health.lock();
                        health.consecutive_failures += 1;
                        health.last_error = Some(err.to_string());
                        debug!(channel = %sample_locator, %err, "channel read failed, retrying next period");
                    }
                }
            })?;
            Some(handle)
        } else {
            None
        };

        // Coexist with other shared writers; a higher-priority
        // exclusive grab (e.g. management override) pauses sampling
        // via the check in the timer callback.
        self.arbiter.request_access(
            &self.broker,
            self.driver_consumer,
            location,
            AccessMode::Shared,
            Self::DRIVER_PRIORITY,
            None,
        );

        debug!(binding = %id, channel = %locator, %location, ?direction, "channel mapped");
        self.bindings.lock().insert(
            id,
            BindingState {
                locator,
                location,
                direction,
                transform,
                timer,
                health,
                error_sink,
                last_sampled_raw,
            },
        );
        Ok(id)
    }

    /// Remove every binding of a channel. Timers are closed before
    /// returning: no further driver call happens for the channel.
    pub fn unmap_channel(&self, locator: &ChannelLocator) -> usize {
        self.unmap_where(|state| state.locator == *locator)
    }

    /// Remove only the binding(s) of a channel to one resource.
    pub fn unmap_channel_resource(&self, locator: &ChannelLocator, location: Location) -> usize {
        self.unmap_where(|state| state.locator == *locator && state.location == location)
    }

    /// Remove one binding by id, with the same synchronous guarantee
    /// as [`ChannelBindings::unmap_channel`].
    pub fn unmap_binding(&self, id: BindingId) -> Result<(), ChannelError> {
        let state = self
            .bindings
            .lock()
            .remove(&id)
            .ok_or(ChannelError::UnknownBinding(id))?;
        if let Some(timer) = &state.timer {
            timer.close();
        }
        self.arbiter.release(self.driver_consumer, state.location);
        debug!(binding = %id, channel = %state.locator, "binding unmapped");
        Ok(())
    }

    fn unmap_where(&self, predicate: impl Fn(&BindingState) -> bool) -> usize {
        let removed: Vec<BindingState> = {
            let mut bindings = self.bindings.lock();
            let ids: Vec<BindingId> = bindings
                .iter()
                .filter(|(_, state)| predicate(state))
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| bindings.remove(&id))
                .collect()
        };
        let count = removed.len();
        for state in removed {
            if let Some(timer) = &state.timer {
                timer.close();
            }
            self.arbiter.release(self.driver_consumer, state.location);
            debug!(channel = %state.locator, location = %state.location, "channel unmapped");
        }
        count
    }

    /// Health counters of a binding.
    pub fn health(&self, id: BindingId) -> Result<BindingHealth, ChannelError> {
        self.bindings
            .lock()
            .get(&id)
            .map(|state| state.health.lock().clone())
            .ok_or(ChannelError::UnknownBinding(id))
    }

    /// Number of active bindings.
    pub fn len(&self) -> usize {
        self.bindings.lock().len()
    }

    /// Whether no bindings are mapped.
    pub fn is_empty(&self) -> bool {
        self.bindings.lock().is_empty()
    }

    /// Feed graph changes through the write-back side: a value change
    /// on an output-bound cell is inverse-transformed and pushed to
    /// the driver. A failed write goes to the binding's error sink and
    /// the in-graph value is left unchanged.
    pub fn handle_changes(&self, records: &[ChangeRecord]) {
        for record in records {
            if record.kind != ChangeKind::ValueChanged {
                continue;
            }
            let targets: Vec<(ChannelLocator, Transform, Arc<Mutex<Option<f64>>>, BindingId)> = {
                let bindings = self.bindings.lock();
                bindings
                    .iter()
                    .filter(|(_, state)| {
                        state.direction.writes_back() && state.location == record.location
                    })
                    .map(|(id, state)| {
                        (
                            state.locator.clone(),
                            state.transform,
                            state.last_sampled_raw.clone(),
                            *id,
                        )
                    })
                    .collect()
            };
            if targets.is_empty() {
                continue;
            }
            let value = self.graph.read().get_value(record.location).ok();
            let Some(value) = value.as_ref().and_then(Value::as_f64) else {
                continue;
            };
            for (locator, transform, last_raw, id) in targets {
                let raw = transform.invert(value);
                if last_raw.lock().is_some_and(|sampled| sampled == raw) {
                    // This change is the echo of our own sample.
                    continue;
                }
                let driver = self.drivers.lock().get(&locator.interface).cloned();
                let Some(driver) = driver else {
                    continue;
                };
                let result = driver.lock().write_channel(&locator, raw);
                if let Err(err) = result {
                    warn!(channel = %locator, %err, "channel write failed");
                    let bindings = self.bindings.lock();
                    if let Some(state) = bindings.get(&id) {
                        let mut health = state.health.lock();
                        health.consecutive_failures += 1;
                        health.last_error = Some(err.to_string());
                        if let Some(sink) = &state.error_sink {
                            sink(&locator, &err);
                        }
                    }
                }
            }
        }
    }
}

fn write_cell(
    graph: &SharedGraph,
    location: Location,
    value: Value,
    quality: Quality,
) -> Result<(), GraphError> {
    graph.write().set_value_with_quality(location, value, quality)
}
