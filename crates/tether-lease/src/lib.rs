//! `tether-lease` — lets many concurrent tasks borrow one lazily opened
//! backend resource, closing it once the last borrower has been gone for a
//! grace period.
//!
//! - [`ReservationRegistry`]: acquire/release bookkeeping and grace eviction.
//! - [`WorkRunner`]: runs bodies with a reservation held for their duration.
//! - [`ReservationRegistry::cancel_all`]: forced teardown, bypassing the grace.

pub mod cancel;
pub mod error;
mod node;
pub mod registry;
pub mod resource;
pub mod runner;
mod signal;
pub mod timer;

pub use cancel::{CancelReport, ResetReport};
pub use error::{LeaseError, ResourceError, Result, TaskError};
pub use registry::{Lease, RegistryStatus, ReservationId, ReservationRegistry, ResourceState};
pub use resource::{Resource, ResourceFactory};
pub use runner::{TaskHandle, WorkContext, WorkRunner};
pub use timer::{Timer, TimerCallback, TimerHandle, TokioTimer};
