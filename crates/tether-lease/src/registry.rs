//! The reservation registry: the single point of serialization for the
//! shared resource.
//!
//! All transitions of the resource slot, the reservation list, and the
//! pending-eviction timer happen inside one critical section. Opening and
//! closing the resource never happen while the lock is held: an acquire that
//! finds the slot `Closed` moves it to `Opening`, performs the open on the
//! blocking pool, and publishes the result; concurrent acquires wait on a
//! change notification instead of the mutex.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tether_core::{LeaseConfig, TaskId};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    error::{LeaseError, ResourceError, Result},
    node::{NodeKey, NodeList, Unlinked},
    resource::{Resource, ResourceFactory},
    signal::TaskSignals,
    timer::{Timer, TimerHandle, TokioTimer},
};

/// Handle identifying one outstanding reservation.
///
/// Carries the arena slot, the slot generation, and the registry epoch so a
/// release can tell a double release from one invalidated by a forced reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReservationId {
    index: usize,
    generation: u32,
    epoch: u64,
}

impl ReservationId {
    fn key(&self) -> NodeKey {
        NodeKey {
            index: self.index,
            generation: self.generation,
        }
    }
}

impl fmt::Display for ReservationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}@{}", self.index, self.generation, self.epoch)
    }
}

/// Coarse lifecycle of the shared resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceState {
    /// No resource and no reservations.
    Closed,
    /// An acquire is opening the resource.
    Opening,
    /// Open with at least one outstanding reservation.
    Open,
    /// Open, unreferenced, waiting out the grace period.
    Idle,
}

impl fmt::Display for ResourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResourceState::Closed => "closed",
            ResourceState::Opening => "opening",
            ResourceState::Open => "open",
            ResourceState::Idle => "idle",
        };
        write!(f, "{s}")
    }
}

/// Point-in-time snapshot of the registry.
#[derive(Debug, Clone, Serialize)]
pub struct RegistryStatus {
    pub state: ResourceState,
    /// Number of outstanding reservations.
    pub outstanding: usize,
    /// Tasks holding a reservation, newest first.
    pub tasks: Vec<TaskId>,
    /// Successful opens since the registry was created.
    pub opens: u64,
    /// Closes attempted since the registry was created.
    pub closes: u64,
    /// Bumped by every forced reset.
    pub epoch: u64,
    /// When the currently open resource was opened.
    pub opened_at: Option<DateTime<Utc>>,
}

struct Eviction {
    ticket: u64,
    handle: TimerHandle,
}

enum Slot<R> {
    Closed,
    /// The opener holds the paired `watch::Sender` and drops it when done.
    Opening {
        ticket: u64,
        ready: watch::Receiver<()>,
    },
    Open {
        resource: Arc<R>,
        eviction: Option<Eviction>,
    },
}

pub(crate) struct State<R> {
    slot: Slot<R>,
    nodes: NodeList<Arc<TaskSignals>>,
    epoch: u64,
    next_ticket: u64,
    opens: u64,
    closes: u64,
    opened_at: Option<DateTime<Utc>>,
}

impl<R> State<R> {
    fn new() -> Self {
        Self {
            slot: Slot::Closed,
            nodes: NodeList::new(),
            epoch: 0,
            next_ticket: 0,
            opens: 0,
            closes: 0,
            opened_at: None,
        }
    }

    fn ticket(&mut self) -> u64 {
        self.next_ticket += 1;
        self.next_ticket
    }

    /// Clear the slot, handing back the open resource (if any) for closing.
    fn take_open(&mut self) -> Option<Arc<R>> {
        match std::mem::replace(&mut self.slot, Slot::Closed) {
            Slot::Open { resource, eviction } => {
                if let Some(e) = eviction {
                    e.handle.cancel();
                }
                self.closes += 1;
                self.opened_at = None;
                Some(resource)
            }
            Slot::Opening { .. } | Slot::Closed => None,
        }
    }
}

enum AcquireStep {
    /// Queue behind the in-flight open started in `epoch`.
    Wait(watch::Receiver<()>, u64),
    Open(u64, watch::Sender<()>),
}

enum OpenOutcome<F: ResourceFactory> {
    Linked(Lease<F>),
    Failed(ResourceError),
    Orphaned(F::Resource),
}

/// Everything detached from the registry by a forced reset.
pub(crate) struct Detached<R> {
    pub(crate) tasks: Vec<Arc<TaskSignals>>,
    pub(crate) resource: Option<Arc<R>>,
}

pub(crate) struct Shared<F: ResourceFactory> {
    factory: F,
    endpoint: String,
    timer: Arc<dyn Timer>,
    grace: Duration,
    pub(crate) drain: Option<Duration>,
    state: Mutex<State<F::Resource>>,
}

impl<F: ResourceFactory> Shared<F> {
    fn lock(&self) -> MutexGuard<'_, State<F::Resource>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Timer callback: close the resource if this eviction is still the
    /// pending one and nobody re-acquired in the meantime.
    fn evict(&self, ticket: u64) {
        let resource = {
            let mut state = self.lock();
            let due = state.nodes.is_empty()
                && matches!(
                    &state.slot,
                    Slot::Open { eviction: Some(e), .. } if e.ticket == ticket
                );
            if !due {
                debug!(ticket, "stale eviction ignored");
                return;
            }
            state.take_open()
        };
        if let Some(resource) = resource {
            self.close_resource(&resource, "grace period elapsed");
        }
    }

    /// Detach every reservation and the open resource under one critical
    /// section. Any in-flight open is orphaned and discards its result.
    pub(crate) fn detach_all(&self) -> Detached<F::Resource> {
        let mut state = self.lock();
        state.epoch += 1;
        let tasks = state.nodes.drain();
        // Also clears an `Opening` slot, orphaning that open.
        let resource = state.take_open();
        Detached { tasks, resource }
    }

    pub(crate) fn close_resource(
        &self,
        resource: &F::Resource,
        reason: &str,
    ) -> Option<ResourceError> {
        info!(endpoint = %self.endpoint, reason, "closing shared resource");
        match resource.close() {
            Ok(()) => {
                info!(endpoint = %self.endpoint, "shared resource closed");
                None
            }
            Err(e) => {
                warn!(endpoint = %self.endpoint, error = %e, "failed to close shared resource");
                Some(e)
            }
        }
    }
}

impl<F: ResourceFactory> Drop for Shared<F> {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(resource) = state.take_open() {
            self.close_resource(&resource, "registry dropped");
        }
    }
}

/// Lazily opens one shared resource, hands it to every borrower, and closes it
/// once the last borrower has been gone for the grace period.
///
/// Cloning is cheap; clones share the same state.
pub struct ReservationRegistry<F: ResourceFactory> {
    pub(crate) shared: Arc<Shared<F>>,
}

impl<F: ResourceFactory> Clone for ReservationRegistry<F> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<F: ResourceFactory> ReservationRegistry<F> {
    /// Build a registry whose eviction timer runs on the current Tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    pub fn new(factory: F, config: &LeaseConfig) -> Self {
        Self::with_timer(factory, config, Arc::new(TokioTimer::current()))
    }

    pub fn with_timer(factory: F, config: &LeaseConfig, timer: Arc<dyn Timer>) -> Self {
        let endpoint = factory.describe();
        Self {
            shared: Arc::new(Shared {
                factory,
                endpoint,
                timer,
                grace: config.grace_period(),
                drain: config.cancel_drain(),
                state: Mutex::new(State::new()),
            }),
        }
    }

    pub fn factory(&self) -> &F {
        &self.shared.factory
    }

    pub fn grace_period(&self) -> Duration {
        self.shared.grace
    }

    /// Reserve the shared resource, opening it if necessary.
    ///
    /// A pending eviction is cancelled and the already-open resource reused.
    /// Open failures surface as [`LeaseError::AcquireFailed`] and leave the
    /// registry empty. An acquire queued behind an open that a forced reset
    /// cut short returns [`LeaseError::Reset`] instead of opening again.
    pub async fn acquire(&self) -> Result<Lease<F>> {
        self.acquire_for(TaskSignals::new(TaskId::new())).await
    }

    pub(crate) async fn acquire_for(&self, signals: Arc<TaskSignals>) -> Result<Lease<F>> {
        loop {
            let step = {
                let mut state = self.shared.lock();
                if signals.cancel_token().is_cancelled() {
                    debug!(task_id = %signals.id(), "acquire abandoned: task cancelled");
                    return Err(LeaseError::Cancelled);
                }
                let resource = match &mut state.slot {
                    Slot::Open { resource, eviction } => {
                        if let Some(e) = eviction.take() {
                            e.handle.cancel();
                            debug!(ticket = e.ticket, "pending eviction cancelled");
                        }
                        Some(Arc::clone(resource))
                    }
                    Slot::Opening { .. } | Slot::Closed => None,
                };
                if let Some(resource) = resource {
                    return Ok(self.link(&mut state, signals, resource));
                }
                let in_flight = match &state.slot {
                    Slot::Opening { ready, .. } => Some(ready.clone()),
                    _ => None,
                };
                match in_flight {
                    Some(ready) => AcquireStep::Wait(ready, state.epoch),
                    None => {
                        let ticket = state.ticket();
                        let (tx, rx) = watch::channel(());
                        state.slot = Slot::Opening { ticket, ready: rx };
                        AcquireStep::Open(ticket, tx)
                    }
                }
            };

            match step {
                AcquireStep::Wait(mut ready, epoch) => {
                    // Resolves once the opener drops its sender.
                    let _ = ready.changed().await;
                    // A reset while waiting cancelled the open this acquire
                    // queued behind; it must not start a fresh one.
                    let reset = self.shared.lock().epoch != epoch;
                    if reset {
                        debug!(task_id = %signals.id(), "acquire abandoned: registry reset");
                        return Err(LeaseError::Reset);
                    }
                }
                AcquireStep::Open(ticket, ready) => {
                    return self.open_and_link(ticket, ready, signals).await;
                }
            }
        }
    }

    async fn open_and_link(
        &self,
        ticket: u64,
        ready: watch::Sender<()>,
        signals: Arc<TaskSignals>,
    ) -> Result<Lease<F>> {
        let mut guard = OpeningGuard {
            shared: &self.shared,
            ticket,
            armed: true,
        };

        info!(endpoint = %self.shared.endpoint, "opening shared resource");
        let shared = Arc::clone(&self.shared);
        let opened = tokio::task::spawn_blocking(move || shared.factory.open())
            .await
            .unwrap_or_else(|e| Err(ResourceError::Open(format!("open task failed: {e}"))));

        let outcome = {
            let mut state = self.shared.lock();
            guard.armed = false;
            let still_ours = matches!(state.slot, Slot::Opening { ticket: t, .. } if t == ticket);
            match opened {
                Err(e) => {
                    if still_ours {
                        state.slot = Slot::Closed;
                    }
                    OpenOutcome::Failed(e)
                }
                Ok(resource) if !still_ours => {
                    state.opens += 1;
                    state.closes += 1;
                    OpenOutcome::Orphaned(resource)
                }
                Ok(resource) => {
                    let resource = Arc::new(resource);
                    state.opens += 1;
                    state.opened_at = Some(Utc::now());
                    state.slot = Slot::Open {
                        resource: Arc::clone(&resource),
                        eviction: None,
                    };
                    OpenOutcome::Linked(self.link(&mut state, signals, resource))
                }
            }
        };
        // Wake acquires that queued behind this open.
        drop(ready);

        match outcome {
            OpenOutcome::Linked(lease) => {
                info!(endpoint = %self.shared.endpoint, "shared resource opened");
                Ok(lease)
            }
            OpenOutcome::Failed(e) => {
                warn!(endpoint = %self.shared.endpoint, error = %e, "failed to open shared resource");
                Err(LeaseError::AcquireFailed(e))
            }
            OpenOutcome::Orphaned(resource) => {
                warn!(endpoint = %self.shared.endpoint, "registry reset while opening; discarding resource");
                let shared = Arc::clone(&self.shared);
                let _ = tokio::task::spawn_blocking(move || {
                    shared.close_resource(&resource, "reset during open")
                })
                .await;
                Err(LeaseError::Reset)
            }
        }
    }

    fn link(
        &self,
        state: &mut State<F::Resource>,
        signals: Arc<TaskSignals>,
        resource: Arc<F::Resource>,
    ) -> Lease<F> {
        let key = state.nodes.push(Arc::clone(&signals));
        let id = ReservationId {
            index: key.index,
            generation: key.generation,
            epoch: state.epoch,
        };
        signals.set_attached(true);
        debug!(
            task_id = %signals.id(),
            reservation = %id,
            outstanding = state.nodes.len(),
            "reservation acquired"
        );
        Lease {
            registry: self.clone(),
            id,
            resource,
            signals,
            released: false,
        }
    }

    /// Release a reservation. The last release starts the grace timer.
    ///
    /// Releasing twice is [`LeaseError::DoubleRelease`]; releasing after a
    /// forced reset is [`LeaseError::UseAfterForceReset`]. Neither changes
    /// any state.
    pub fn release(&self, id: ReservationId) -> Result<()> {
        let mut state = self.shared.lock();
        if id.epoch != state.epoch {
            return Err(LeaseError::UseAfterForceReset { id });
        }
        let unlinked = state
            .nodes
            .remove(id.key())
            .ok_or(LeaseError::DoubleRelease { id })?;

        let emptied = matches!(unlinked, Unlinked::Emptied(_));
        if emptied {
            self.schedule_eviction(&mut state);
        }
        let outstanding = state.nodes.len();
        drop(state);

        let signals = unlinked.into_value();
        signals.set_attached(false);
        signals.mark_finished();
        debug!(task_id = %signals.id(), reservation = %id, outstanding, "reservation released");
        Ok(())
    }

    fn schedule_eviction(&self, state: &mut State<F::Resource>) {
        let ticket = state.ticket();
        let Slot::Open { eviction, .. } = &mut state.slot else {
            return;
        };
        let weak: Weak<Shared<F>> = Arc::downgrade(&self.shared);
        let handle = self.shared.timer.schedule(
            self.shared.grace,
            Box::new(move || {
                if let Some(shared) = weak.upgrade() {
                    shared.evict(ticket);
                }
            }),
        );
        if let Some(old) = eviction.replace(Eviction { ticket, handle }) {
            old.handle.cancel();
        }
        debug!(ticket, grace = ?self.shared.grace, "eviction scheduled");
    }

    pub fn status(&self) -> RegistryStatus {
        let state = self.shared.lock();
        let resource_state = match &state.slot {
            Slot::Closed => ResourceState::Closed,
            Slot::Opening { .. } => ResourceState::Opening,
            Slot::Open {
                eviction: Some(_), ..
            } => ResourceState::Idle,
            Slot::Open { eviction: None, .. } => ResourceState::Open,
        };
        RegistryStatus {
            state: resource_state,
            outstanding: state.nodes.len(),
            tasks: state.nodes.iter().map(|s| s.id()).collect(),
            opens: state.opens,
            closes: state.closes,
            epoch: state.epoch,
            opened_at: state.opened_at,
        }
    }

    /// Verify the slot/list invariants. Test-only.
    #[cfg(test)]
    pub(crate) fn check_invariants(&self) -> std::result::Result<(), String> {
        let state = self.shared.lock();
        if !state.nodes.links_consistent() {
            return Err("reservation links are inconsistent".into());
        }
        match &state.slot {
            Slot::Open { eviction: Some(_), .. } if !state.nodes.is_empty() => {
                Err("eviction pending while reservations are outstanding".into())
            }
            Slot::Open { eviction: None, .. } if state.nodes.is_empty() => {
                Err("open resource is neither referenced nor pending eviction".into())
            }
            Slot::Closed | Slot::Opening { .. } if !state.nodes.is_empty() => {
                Err("reservations outstanding without an open resource".into())
            }
            _ => Ok(()),
        }
    }
}

/// Returns the slot to `Closed` if an open is abandoned mid-flight (the
/// acquiring future was dropped).
struct OpeningGuard<'a, F: ResourceFactory> {
    shared: &'a Shared<F>,
    ticket: u64,
    armed: bool,
}

impl<F: ResourceFactory> Drop for OpeningGuard<'_, F> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut state = self.shared.lock();
        if matches!(state.slot, Slot::Opening { ticket, .. } if ticket == self.ticket) {
            state.slot = Slot::Closed;
            debug!(ticket = self.ticket, "abandoned open rolled back");
        }
    }
}

/// A scoped reservation of the shared resource. Dropping it releases.
pub struct Lease<F: ResourceFactory> {
    registry: ReservationRegistry<F>,
    id: ReservationId,
    resource: Arc<F::Resource>,
    signals: Arc<TaskSignals>,
    released: bool,
}

impl<F: ResourceFactory> Lease<F> {
    pub fn id(&self) -> ReservationId {
        self.id
    }

    pub fn task_id(&self) -> TaskId {
        self.signals.id()
    }

    pub fn resource(&self) -> &Arc<F::Resource> {
        &self.resource
    }

    /// Cancelled when the reservation is torn down by `cancel_all`.
    pub fn cancel_token(&self) -> CancellationToken {
        self.signals.cancel_token().clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.signals.cancel_token().is_cancelled()
    }

    pub fn attached(&self) -> watch::Receiver<bool> {
        self.signals.subscribe_attached()
    }

    pub fn release(mut self) -> Result<()> {
        self.released = true;
        self.finish();
        self.registry.release(self.id)
    }

    fn finish(&self) {
        self.signals.set_attached(false);
        self.signals.mark_finished();
    }
}

impl<F: ResourceFactory> Drop for Lease<F> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.finish();
        match self.registry.release(self.id) {
            Ok(()) => {}
            Err(LeaseError::UseAfterForceReset { id }) => {
                debug!(reservation = %id, "lease dropped after forced reset")
            }
            Err(e) => warn!(error = %e, "lease release failed"),
        }
    }
}

impl<F: ResourceFactory> fmt::Debug for Lease<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("id", &self.id)
            .field("task_id", &self.signals.id())
            .finish_non_exhaustive()
    }
}
