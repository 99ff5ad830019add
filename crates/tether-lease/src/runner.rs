//! Runs units of work against the shared resource.
//!
//! Each submitted body runs on its own Tokio task: wait out the optional
//! delay, acquire a reservation, run the body with the resource, release.
//! The release happens when the [`Lease`] is dropped, so it also runs when
//! the body fails, is cancelled, or panics.

use std::any::Any;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use dashmap::DashMap;
use tether_core::TaskId;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    cancel::CancelReport,
    error::TaskError,
    registry::{Lease, ReservationRegistry},
    resource::ResourceFactory,
    signal::TaskSignals,
};

/// What a body sees while it holds the shared resource.
pub struct WorkContext<R> {
    resource: Arc<R>,
    signals: Arc<TaskSignals>,
}

impl<R> WorkContext<R> {
    pub fn resource(&self) -> &R {
        &self.resource
    }

    pub fn task_id(&self) -> TaskId {
        self.signals.id()
    }

    pub fn is_cancelled(&self) -> bool {
        self.signals.cancel_token().is_cancelled()
    }

    /// Resolves once this task has been asked to stop.
    pub async fn cancelled(&self) {
        self.signals.cancel_token().cancelled().await
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.signals.cancel_token().clone()
    }
}

/// Submits work that borrows the registry's shared resource.
pub struct WorkRunner<F: ResourceFactory> {
    registry: ReservationRegistry<F>,
    runtime: Handle,
    /// Submitted tasks that do not hold a reservation yet.
    pending: Arc<DashMap<TaskId, Arc<TaskSignals>>>,
}

impl<F: ResourceFactory> Clone for WorkRunner<F> {
    fn clone(&self) -> Self {
        Self {
            registry: self.registry.clone(),
            runtime: self.runtime.clone(),
            pending: Arc::clone(&self.pending),
        }
    }
}

impl<F: ResourceFactory> WorkRunner<F> {
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    pub fn new(registry: ReservationRegistry<F>) -> Self {
        Self::with_runtime(registry, Handle::current())
    }

    pub fn with_runtime(registry: ReservationRegistry<F>, runtime: Handle) -> Self {
        Self {
            registry,
            runtime,
            pending: Arc::new(DashMap::new()),
        }
    }

    pub fn registry(&self) -> &ReservationRegistry<F> {
        &self.registry
    }

    /// Run an async body as soon as the resource can be reserved.
    pub fn submit<T, E, W, Fut>(&self, work: W) -> TaskHandle<T, E>
    where
        T: Send + 'static,
        E: Send + 'static,
        W: FnOnce(WorkContext<F::Resource>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        self.spawn_task(None, move |ctx| async_body(ctx, work))
    }

    /// Like [`submit`](Self::submit), but acquire starts only after `delay`.
    pub fn submit_after<T, E, W, Fut>(&self, delay: Duration, work: W) -> TaskHandle<T, E>
    where
        T: Send + 'static,
        E: Send + 'static,
        W: FnOnce(WorkContext<F::Resource>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        self.spawn_task(Some(delay), move |ctx| async_body(ctx, work))
    }

    /// Run a blocking body (e.g. synchronous SQL) on the blocking pool.
    ///
    /// A blocking body cannot be interrupted; it should poll
    /// [`WorkContext::is_cancelled`] between steps.
    pub fn submit_blocking<T, E, W>(&self, work: W) -> TaskHandle<T, E>
    where
        T: Send + 'static,
        E: Send + 'static,
        W: FnOnce(WorkContext<F::Resource>) -> Result<T, E> + Send + 'static,
    {
        self.spawn_task(None, move |ctx| blocking_body(ctx, work))
    }

    pub fn submit_blocking_after<T, E, W>(&self, delay: Duration, work: W) -> TaskHandle<T, E>
    where
        T: Send + 'static,
        E: Send + 'static,
        W: FnOnce(WorkContext<F::Resource>) -> Result<T, E> + Send + 'static,
    {
        self.spawn_task(Some(delay), move |ctx| blocking_body(ctx, work))
    }

    /// Cancel every submitted task: those still waiting for their delay or
    /// for the resource, then every reservation holder via
    /// [`ReservationRegistry::cancel_all`].
    pub async fn cancel_all(&self) -> CancelReport {
        let pending_cancelled = self
            .pending
            .iter()
            .filter(|entry| entry.value().cancel())
            .count();
        let mut report = self.registry.cancel_all().await;
        report.pending_cancelled = pending_cancelled;
        report
    }

    /// Tasks submitted but not yet holding a reservation.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    fn spawn_task<T, E, B, Fut>(&self, delay: Option<Duration>, body: B) -> TaskHandle<T, E>
    where
        T: Send + 'static,
        E: Send + 'static,
        B: FnOnce(WorkContext<F::Resource>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, TaskError<E>>> + Send + 'static,
    {
        let signals = TaskSignals::new(TaskId::new());
        self.pending.insert(signals.id(), Arc::clone(&signals));
        debug!(
            task_id = %signals.id(),
            delay = ?delay.unwrap_or_default(),
            "task submitted"
        );

        let pending = PendingEntry {
            pending: Arc::clone(&self.pending),
            id: signals.id(),
        };
        let attached = signals.subscribe_attached();
        let join = self.runtime.spawn(run_task(
            self.registry.clone(),
            pending,
            Arc::clone(&signals),
            delay,
            body,
        ));

        TaskHandle {
            signals,
            attached,
            join,
        }
    }
}

/// Removes a task from the pending map once it holds a reservation or ends.
struct PendingEntry {
    pending: Arc<DashMap<TaskId, Arc<TaskSignals>>>,
    id: TaskId,
}

impl Drop for PendingEntry {
    fn drop(&mut self) {
        self.pending.remove(&self.id);
    }
}

async fn run_task<F, T, E, B, Fut>(
    registry: ReservationRegistry<F>,
    pending: PendingEntry,
    signals: Arc<TaskSignals>,
    delay: Option<Duration>,
    body: B,
) -> Result<T, TaskError<E>>
where
    F: ResourceFactory,
    B: FnOnce(WorkContext<F::Resource>) -> Fut,
    Fut: Future<Output = Result<T, TaskError<E>>>,
{
    let token = signals.cancel_token().clone();

    if let Some(delay) = delay {
        tokio::select! {
            biased;
            _ = token.cancelled() => {
                debug!(task_id = %signals.id(), "task cancelled before its delay elapsed");
                return Err(TaskError::Cancelled);
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }
    if token.is_cancelled() {
        return Err(TaskError::Cancelled);
    }

    // Acquire is not raced against cancellation: an abandoned open would
    // drop the freshly opened resource without closing it.
    let lease: Lease<F> = match registry.acquire_for(Arc::clone(&signals)).await {
        Ok(lease) => lease,
        Err(_) if token.is_cancelled() => return Err(TaskError::Cancelled),
        Err(e) => return Err(TaskError::Acquire(e)),
    };
    drop(pending);
    if token.is_cancelled() {
        return Err(TaskError::Cancelled);
    }

    let ctx = WorkContext {
        resource: Arc::clone(lease.resource()),
        signals,
    };
    let result = body(ctx).await;
    drop(lease);
    result
}

async fn async_body<R, T, E, W, Fut>(ctx: WorkContext<R>, work: W) -> Result<T, TaskError<E>>
where
    W: FnOnce(WorkContext<R>) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let token = ctx.cancel_token();
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(TaskError::Cancelled),
        result = work(ctx) => result.map_err(TaskError::Failed),
    }
}

async fn blocking_body<R, T, E, W>(ctx: WorkContext<R>, work: W) -> Result<T, TaskError<E>>
where
    R: Send + Sync + 'static,
    T: Send + 'static,
    E: Send + 'static,
    W: FnOnce(WorkContext<R>) -> Result<T, E> + Send + 'static,
{
    let token = ctx.cancel_token();
    match tokio::task::spawn_blocking(move || work(ctx)).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(_)) if token.is_cancelled() => Err(TaskError::Cancelled),
        Ok(Err(e)) => Err(TaskError::Failed(e)),
        Err(e) => Err(join_error(e)),
    }
}

fn join_error<E>(e: JoinError) -> TaskError<E> {
    if e.is_panic() {
        TaskError::Panicked(panic_message(e.into_panic()))
    } else {
        TaskError::Cancelled
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Handle to a submitted task. Await it for the body's result.
///
/// Dropping the handle does not cancel the task.
pub struct TaskHandle<T, E> {
    signals: Arc<TaskSignals>,
    attached: watch::Receiver<bool>,
    join: JoinHandle<Result<T, TaskError<E>>>,
}

impl<T, E> TaskHandle<T, E> {
    pub fn id(&self) -> TaskId {
        self.signals.id()
    }

    /// Busy indicator: true while the task holds the shared resource.
    pub fn attached(&self) -> watch::Receiver<bool> {
        self.attached.clone()
    }

    pub fn is_attached(&self) -> bool {
        *self.attached.borrow()
    }

    /// Ask the task to stop. An async body is dropped at its next await;
    /// a blocking body must observe the request itself.
    pub fn cancel(&self) {
        if self.signals.cancel() {
            debug!(task_id = %self.signals.id(), "task cancel requested");
        }
    }
}

impl<T, E> Future for TaskHandle<T, E> {
    type Output = Result<T, TaskError<E>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.join).poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(e)) => Poll::Ready(Err(join_error(e))),
        }
    }
}
