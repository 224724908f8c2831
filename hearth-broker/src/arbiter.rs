//! Priority-arbitrated access grants per storage cell
//!
//! Device drivers and management consumers contend for write ownership
//! of the same cells. Exclusive grants exclude every other write grant
//! on a location; shared grants coexist. A strictly higher-priority
//! request preempts the current holders, whose revocation events are
//! enqueued *before* the new grant is recorded, so a revoked consumer
//! observes the revocation before any effect of the new holder. Equal
//! priority is first-come-first-served: the later request is denied.

use crate::broker::{Event, EventBroker};
use hearth_types::{ConsumerId, ListenerHandle, Location};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use tracing::debug;

/// Kind of access a consumer requests on a location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccessMode {
    /// Read access only; never blocks and never blocks others.
    ReadOnly,
    /// Write access coexisting with other shared writers.
    Shared,
    /// Sole write access, excluding every other grant.
    Exclusive,
}

/// Ordered priority ranks for access arbitration.
///
/// The channel layer writes at the fixed [`AccessPriority::DeviceSpecific`]
/// ("driver") rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AccessPriority {
    Lowest,
    GenericManagement,
    DeviceGroup,
    DeviceSpecific,
    Highest,
}

/// Arbitration refusal.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AccessError {
    /// Another consumer holds exclusive write access.
    #[error("write access to {location} denied for {consumer}")]
    AccessDenied {
        consumer: ConsumerId,
        location: Location,
    },
}

#[derive(Debug, Clone)]
struct Grant {
    consumer: ConsumerId,
    priority: AccessPriority,
    /// Listener to notify when the grant is preempted.
    revoke_listener: Option<ListenerHandle>,
}

#[derive(Debug, Clone, Default)]
struct CellGrants {
    exclusive: Option<Grant>,
    shared: Vec<Grant>,
}

/// Introspection snapshot of the grants on one location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrantSnapshot {
    pub exclusive: Option<(ConsumerId, AccessPriority)>,
    pub shared: Vec<(ConsumerId, AccessPriority)>,
}

/// Grants exclusive/shared write access per location with
/// priority-based preemption.
pub struct AccessArbiter {
    grants: Mutex<HashMap<Location, CellGrants>>,
}

impl Default for AccessArbiter {
    fn default() -> Self {
        Self::new()
    }
}

impl AccessArbiter {
    pub fn new() -> Self {
        Self {
            grants: Mutex::new(HashMap::new()),
        }
    }

    /// Request an access mode on a location.
    ///
    /// Returns whether the grant was given. `revoke_listener`, if
    /// provided, receives an [`Event::AccessRevoked`] through `broker`
    /// when a later, higher-priority request preempts this grant.
    pub fn request_access(
        &self,
        broker: &EventBroker,
        consumer: ConsumerId,
        location: Location,
        mode: AccessMode,
        priority: AccessPriority,
        revoke_listener: Option<ListenerHandle>,
    ) -> bool {
        if mode == AccessMode::ReadOnly {
            // Reads are never arbitrated.
            return true;
        }
        let mut grants = self.grants.lock();
        let cell = grants.entry(location).or_default();

        // Grants this request must displace: the foreign exclusive
        // holder always; foreign shared holders only for an exclusive
        // request.
        let mut blocking: Vec<&Grant> = Vec::new();
        if let Some(excl) = &cell.exclusive {
            if excl.consumer != consumer {
                blocking.push(excl);
            }
        }
        if mode == AccessMode::Exclusive {
            blocking.extend(cell.shared.iter().filter(|g| g.consumer != consumer));
        }
        if blocking.iter().any(|g| g.priority >= priority) {
            debug!(%consumer, %location, ?mode, "access request denied");
            return false;
        }

        // Revoke the displaced holders before recording the grant, so
        // the revocation is observable first on their queues.
        let displaced: Vec<Grant> = {
            let mut out = Vec::new();
            if cell.exclusive.as_ref().is_some_and(|g| g.consumer != consumer) {
                if let Some(g) = cell.exclusive.take() {
                    out.push(g);
                }
            }
            if mode == AccessMode::Exclusive {
                let (foreign, own): (Vec<Grant>, Vec<Grant>) = cell
                    .shared
                    .drain(..)
                    .partition(|g| g.consumer != consumer);
                cell.shared = own;
                out.extend(foreign);
            }
            out
        };
        for grant in &displaced {
            if let Some(listener) = &grant.revoke_listener {
                if let Err(err) = broker.deliver(
                    grant.consumer,
                    listener,
                    Event::AccessRevoked { location },
                ) {
                    debug!(consumer = %grant.consumer, %err, "revocation not deliverable");
                }
            }
            debug!(holder = %grant.consumer, %location, "access grant preempted");
        }

        let grant = Grant {
            consumer,
            priority,
            revoke_listener,
        };
        match mode {
            AccessMode::Exclusive => {
                cell.shared.retain(|g| g.consumer != consumer);
                cell.exclusive = Some(grant);
            }
            AccessMode::Shared => {
                if cell.exclusive.as_ref().is_some_and(|g| g.consumer == consumer) {
                    // Downgrading from exclusive.
                    cell.exclusive = None;
                }
                cell.shared.retain(|g| g.consumer != consumer);
                cell.shared.push(grant);
            }
            AccessMode::ReadOnly => {}
        }
        true
    }

    /// Whether `consumer` may write `location` right now: denied iff a
    /// different consumer holds exclusive access.
    pub fn check_write(
        &self,
        consumer: ConsumerId,
        location: Location,
    ) -> Result<(), AccessError> {
        let grants = self.grants.lock();
        match grants.get(&location).and_then(|c| c.exclusive.as_ref()) {
            Some(excl) if excl.consumer != consumer => Err(AccessError::AccessDenied {
                consumer,
                location,
            }),
            _ => Ok(()),
        }
    }

    /// Release the consumer's grant on one location.
    pub fn release(&self, consumer: ConsumerId, location: Location) {
        let mut grants = self.grants.lock();
        if let Some(cell) = grants.get_mut(&location) {
            if cell.exclusive.as_ref().is_some_and(|g| g.consumer == consumer) {
                cell.exclusive = None;
            }
            cell.shared.retain(|g| g.consumer != consumer);
            if cell.exclusive.is_none() && cell.shared.is_empty() {
                grants.remove(&location);
            }
        }
    }

    /// Release every grant held by the consumer (automatic on
    /// consumer shutdown).
    pub fn release_all(&self, consumer: ConsumerId) {
        let mut grants = self.grants.lock();
        grants.retain(|_, cell| {
            if cell.exclusive.as_ref().is_some_and(|g| g.consumer == consumer) {
                cell.exclusive = None;
            }
            cell.shared.retain(|g| g.consumer != consumer);
            cell.exclusive.is_some() || !cell.shared.is_empty()
        });
    }

    /// Snapshot of the grants on a location, for administration.
    pub fn snapshot(&self, location: Location) -> GrantSnapshot {
        let grants = self.grants.lock();
        let cell = grants.get(&location);
        GrantSnapshot {
            exclusive: cell
                .and_then(|c| c.exclusive.as_ref())
                .map(|g| (g.consumer, g.priority)),
            shared: cell
                .map(|c| c.shared.iter().map(|g| (g.consumer, g.priority)).collect())
                .unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex as StdMutex};

    fn setup() -> (EventBroker, AccessArbiter, ConsumerId, ConsumerId) {
        let broker = EventBroker::new();
        let arbiter = AccessArbiter::new();
        let a = ConsumerId::new();
        let b = ConsumerId::new();
        broker.register_consumer(a);
        broker.register_consumer(b);
        (broker, arbiter, a, b)
    }

    #[test]
    fn test_shared_grants_coexist() {
        let (broker, arbiter, a, b) = setup();
        let loc = Location(1);
        assert!(arbiter.request_access(
            &broker,
            a,
            loc,
            AccessMode::Shared,
            AccessPriority::Lowest,
            None
        ));
        assert!(arbiter.request_access(
            &broker,
            b,
            loc,
            AccessMode::Shared,
            AccessPriority::Lowest,
            None
        ));
        assert!(arbiter.check_write(a, loc).is_ok());
        assert!(arbiter.check_write(b, loc).is_ok());
    }

    #[test]
    fn test_exclusive_blocks_other_writers() {
        let (broker, arbiter, a, b) = setup();
        let loc = Location(1);
        assert!(arbiter.request_access(
            &broker,
            a,
            loc,
            AccessMode::Exclusive,
            AccessPriority::DeviceSpecific,
            None
        ));
        assert!(arbiter.check_write(a, loc).is_ok());
        assert!(matches!(
            arbiter.check_write(b, loc),
            Err(AccessError::AccessDenied { .. })
        ));
        // Equal priority: first-come-first-served.
        assert!(!arbiter.request_access(
            &broker,
            b,
            loc,
            AccessMode::Exclusive,
            AccessPriority::DeviceSpecific,
            None
        ));
    }

    #[test]
    fn test_higher_priority_preempts_with_revocation_first() {
        let (broker, arbiter, low, high) = setup();
        let loc = Location(7);

        let events = Arc::new(StdMutex::new(Vec::new()));
        let events2 = events.clone();
        let revoke = broker
            .add_listener(low, move |event| {
                if let Event::AccessRevoked { location } = event {
                    events2.lock().unwrap().push(*location);
                }
            })
            .unwrap();

        assert!(arbiter.request_access(
            &broker,
            low,
            loc,
            AccessMode::Exclusive,
            AccessPriority::GenericManagement,
            Some(revoke)
        ));
        assert!(arbiter.request_access(
            &broker,
            high,
            loc,
            AccessMode::Exclusive,
            AccessPriority::Highest,
            None
        ));

        // The revocation is already queued before the new grant is
        // observable anywhere.
        assert_eq!(broker.pending(low), 1);
        broker.dispatch(low);
        assert_eq!(*events.lock().unwrap(), vec![loc]);

        assert!(arbiter.check_write(high, loc).is_ok());
        assert!(arbiter.check_write(low, loc).is_err());
    }

    #[test]
    fn test_lower_priority_cannot_preempt() {
        let (broker, arbiter, a, b) = setup();
        let loc = Location(1);
        assert!(arbiter.request_access(
            &broker,
            a,
            loc,
            AccessMode::Exclusive,
            AccessPriority::Highest,
            None
        ));
        assert!(!arbiter.request_access(
            &broker,
            b,
            loc,
            AccessMode::Exclusive,
            AccessPriority::DeviceSpecific,
            None
        ));
        assert!(arbiter.check_write(a, loc).is_ok());
    }

    #[test]
    fn test_read_only_always_granted() {
        let (broker, arbiter, a, b) = setup();
        let loc = Location(1);
        arbiter.request_access(
            &broker,
            a,
            loc,
            AccessMode::Exclusive,
            AccessPriority::Highest,
            None,
        );
        assert!(arbiter.request_access(
            &broker,
            b,
            loc,
            AccessMode::ReadOnly,
            AccessPriority::Lowest,
            None
        ));
    }

    #[test]
    fn test_release_all_on_shutdown() {
        let (broker, arbiter, a, b) = setup();
        let loc = Location(1);
        arbiter.request_access(
            &broker,
            a,
            loc,
            AccessMode::Exclusive,
            AccessPriority::Highest,
            None,
        );
        assert!(arbiter.check_write(b, loc).is_err());

        arbiter.release_all(a);
        assert!(arbiter.check_write(b, loc).is_ok());
        assert_eq!(arbiter.snapshot(loc).exclusive, None);
    }

    #[test]
    fn test_exclusive_displaces_shared_holders() {
        let (broker, arbiter, shared, excl) = setup();
        let loc = Location(3);

        let revoked = Arc::new(StdMutex::new(0usize));
        let revoked2 = revoked.clone();
        let listener = broker
            .add_listener(shared, move |event| {
                if matches!(event, Event::AccessRevoked { .. }) {
                    *revoked2.lock().unwrap() += 1;
                }
            })
            .unwrap();

        assert!(arbiter.request_access(
            &broker,
            shared,
            loc,
            AccessMode::Shared,
            AccessPriority::Lowest,
            Some(listener)
        ));
        assert!(arbiter.request_access(
            &broker,
            excl,
            loc,
            AccessMode::Exclusive,
            AccessPriority::DeviceSpecific,
            None
        ));
        broker.dispatch(shared);
        assert_eq!(*revoked.lock().unwrap(), 1);
        assert_eq!(arbiter.snapshot(loc).shared, vec![]);
    }
}
