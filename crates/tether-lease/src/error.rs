//! Error types for the lease crate.

use thiserror::Error;

use crate::registry::ReservationId;

/// Failures reported by a [`crate::ResourceFactory`] or a [`crate::Resource`].
#[derive(Debug, Clone, Error)]
pub enum ResourceError {
    /// The factory could not open the backend connection.
    #[error("failed to open resource: {0}")]
    Open(String),

    /// Closing the backend connection failed. The registry still treats it as closed.
    #[error("failed to close resource: {0}")]
    Close(String),

    /// The resource was used after it had already been closed.
    #[error("resource is closed")]
    Closed,
}

/// Registry-level failures.
#[derive(Debug, Error)]
pub enum LeaseError {
    /// Opening the shared resource failed; the registry is left empty.
    #[error("acquire failed: {0}")]
    AcquireFailed(#[source] ResourceError),

    /// The reservation was already released (or never belonged to this registry).
    #[error("reservation {id} released twice")]
    DoubleRelease { id: ReservationId },

    /// The reservation was detached by a forced reset before it was released.
    #[error("reservation {id} was invalidated by a forced reset")]
    UseAfterForceReset { id: ReservationId },

    /// A forced reset happened while this acquire was opening the resource
    /// or waiting for another acquire's open.
    #[error("registry was reset while the resource was opening")]
    Reset,

    /// The acquiring task was cancelled before it got hold of the resource.
    #[error("acquire cancelled")]
    Cancelled,
}

/// Outcome of a submitted unit of work that did not produce a value.
#[derive(Debug, Error)]
pub enum TaskError<E> {
    /// The task never got hold of the resource.
    #[error("could not reserve the shared resource: {0}")]
    Acquire(#[source] LeaseError),

    /// The task was cancelled, individually or through `cancel_all`.
    #[error("task cancelled")]
    Cancelled,

    /// The work body itself returned an error.
    #[error("task failed: {0}")]
    Failed(E),

    /// The work body panicked.
    #[error("task panicked: {0}")]
    Panicked(String),
}

impl<E> TaskError<E> {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, TaskError::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, LeaseError>;
