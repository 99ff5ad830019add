//! Forced teardown: detach every reservation and close the resource now,
//! bypassing the grace period.

use std::sync::Arc;

use futures_util::future::join_all;
use serde::Serialize;
use tracing::{info, warn};

use crate::{
    registry::{ReservationRegistry, Shared},
    resource::ResourceFactory,
};

/// Result of [`ReservationRegistry::force_reset`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct ResetReport {
    /// Reservations invalidated by the reset.
    pub detached: usize,
    pub resource_closed: bool,
    pub close_error: Option<String>,
}

/// Result of a forced cancellation.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CancelReport {
    /// Detached tasks whose body was still running and was told to stop,
    /// including ones already cancelled through their own handle.
    pub cancelled: usize,
    /// Reservations detached from the registry.
    pub detached: usize,
    /// Delayed submissions cancelled before they reached acquire.
    pub pending_cancelled: usize,
    pub resource_closed: bool,
    pub close_error: Option<String>,
}

impl<F: ResourceFactory> ReservationRegistry<F> {
    /// Detach all reservations and close the resource immediately.
    ///
    /// Detached leases stay usable as values but releasing them reports
    /// [`crate::LeaseError::UseAfterForceReset`]. The next acquire opens a
    /// fresh resource.
    pub async fn force_reset(&self) -> ResetReport {
        let detached = self.shared.detach_all();
        let (resource_closed, close_error) =
            close_detached(&self.shared, detached.resource, "forced reset").await;
        info!(detached = detached.tasks.len(), resource_closed, "registry reset");
        ResetReport {
            detached: detached.tasks.len(),
            resource_closed,
            close_error,
        }
    }

    /// Cancel every task holding a reservation and close the resource.
    ///
    /// Each detached task gets one cooperative cancellation request and its
    /// attached signal drops to false. With a configured drain the call waits
    /// up to that long for cancelled bodies to stop before closing.
    pub async fn cancel_all(&self) -> CancelReport {
        let detached = self.shared.detach_all();

        let mut cancelled = 0usize;
        let mut running = Vec::new();
        for signals in &detached.tasks {
            let finished = signals.subscribe_finished();
            if !*finished.borrow() {
                signals.cancel();
                cancelled += 1;
                running.push(finished);
            }
            signals.set_attached(false);
        }

        if let Some(drain) = self.shared.drain {
            if !running.is_empty() {
                let waits = running
                    .iter_mut()
                    .map(|rx| async move { rx.wait_for(|done| *done).await.is_ok() });
                if tokio::time::timeout(drain, join_all(waits)).await.is_err() {
                    warn!(?drain, "cancelled tasks still running; closing anyway");
                }
            }
        }

        let (resource_closed, close_error) =
            close_detached(&self.shared, detached.resource, "forced cancellation").await;
        info!(
            cancelled,
            detached = detached.tasks.len(),
            resource_closed,
            "forced cancellation complete"
        );
        CancelReport {
            cancelled,
            detached: detached.tasks.len(),
            pending_cancelled: 0,
            resource_closed,
            close_error,
        }
    }
}

async fn close_detached<F: ResourceFactory>(
    shared: &Arc<Shared<F>>,
    resource: Option<Arc<F::Resource>>,
    reason: &'static str,
) -> (bool, Option<String>) {
    let Some(resource) = resource else {
        return (false, None);
    };
    let shared = Arc::clone(shared);
    match tokio::task::spawn_blocking(move || shared.close_resource(&resource, reason)).await {
        Ok(None) => (true, None),
        Ok(Some(e)) => (true, Some(e.to_string())),
        Err(e) => (true, Some(format!("close task failed: {e}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use tether_core::{LeaseConfig, TaskId};

    use crate::error::ResourceError;
    use crate::resource::Resource;
    use crate::signal::TaskSignals;

    struct Conn {
        closes: Arc<AtomicUsize>,
        fail_close: bool,
    }

    impl Resource for Conn {
        fn close(&self) -> Result<(), ResourceError> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            if self.fail_close {
                return Err(ResourceError::Close("disk on fire".into()));
            }
            Ok(())
        }
    }

    struct Factory {
        closes: Arc<AtomicUsize>,
        fail_close: bool,
    }

    impl ResourceFactory for Factory {
        type Resource = Conn;

        fn open(&self) -> Result<Conn, ResourceError> {
            Ok(Conn {
                closes: Arc::clone(&self.closes),
                fail_close: self.fail_close,
            })
        }
    }

    fn registry(
        fail_close: bool,
        cancel_drain_ms: u64,
    ) -> (ReservationRegistry<Factory>, Arc<AtomicUsize>) {
        let closes = Arc::new(AtomicUsize::new(0));
        let config = LeaseConfig {
            cancel_drain_ms,
            ..LeaseConfig::default()
        };
        let factory = Factory {
            closes: Arc::clone(&closes),
            fail_close,
        };
        (ReservationRegistry::new(factory, &config), closes)
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_all_on_empty_registry_is_a_no_op() {
        let (reg, closes) = registry(false, 0);
        let report = reg.cancel_all().await;
        assert_eq!(report.cancelled, 0);
        assert!(!report.resource_closed);
        assert_eq!(closes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_all_cancels_every_holder_and_clears_attached() {
        let (reg, closes) = registry(false, 0);
        let a = reg.acquire().await.unwrap();
        let b = reg.acquire().await.unwrap();
        let attached = a.attached();
        assert!(*attached.borrow());

        let report = reg.cancel_all().await;
        assert_eq!(report.cancelled, 2);
        assert_eq!(report.detached, 2);
        assert!(report.resource_closed);
        assert!(a.is_cancelled() && b.is_cancelled());
        assert!(!*attached.borrow());
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        reg.check_invariants().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn holder_cancelled_earlier_still_counts() {
        let (reg, closes) = registry(false, 0);
        let a = reg.acquire().await.unwrap();
        let b = reg.acquire().await.unwrap();
        // Cancelled through its own token, body still holding the lease.
        a.cancel_token().cancel();

        let report = reg.cancel_all().await;
        assert_eq!(report.cancelled, 2);
        assert_eq!(report.detached, 2);
        assert!(b.is_cancelled());
        assert_eq!(closes.load(Ordering::SeqCst), 1);

        // A holder that already finished is detached but not signalled.
        let c = reg.acquire().await.unwrap();
        let signals = TaskSignals::new(TaskId::new());
        let finished = reg.acquire_for(Arc::clone(&signals)).await.unwrap();
        signals.mark_finished();
        let report = reg.cancel_all().await;
        assert_eq!(report.detached, 2);
        assert_eq!(report.cancelled, 1);
        drop((a, b, c, finished));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_all_cancels_an_idle_resource_eviction() {
        let (reg, closes) = registry(false, 0);
        drop(reg.acquire().await.unwrap());
        assert_eq!(reg.status().state, crate::ResourceState::Idle);

        let report = reg.cancel_all().await;
        assert_eq!(report.detached, 0);
        assert!(report.resource_closed);

        // The cancelled eviction must not close anything a second time.
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn close_failure_is_reported_and_state_stays_closed() {
        let (reg, _closes) = registry(true, 0);
        let lease = reg.acquire().await.unwrap();
        let report = reg.force_reset().await;
        assert!(report.resource_closed);
        assert!(report.close_error.unwrap().contains("disk on fire"));
        assert_eq!(reg.status().state, crate::ResourceState::Closed);
        drop(lease);
        reg.check_invariants().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn drain_waits_for_holders_to_finish() {
        let (reg, closes) = registry(false, 1_000);
        let lease = reg.acquire().await.unwrap();
        let token = lease.cancel_token();

        let holder = tokio::spawn(async move {
            token.cancelled().await;
            tokio::time::sleep(Duration::from_millis(100)).await;
            drop(lease);
        });

        let started = tokio::time::Instant::now();
        let report = reg.cancel_all().await;
        assert_eq!(report.cancelled, 1);
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        holder.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn drain_gives_up_after_its_bound() {
        let (reg, closes) = registry(false, 50);
        let lease = reg.acquire().await.unwrap();

        let report = reg.cancel_all().await;
        assert_eq!(report.cancelled, 1);
        assert!(report.resource_closed);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        drop(lease);
    }
}
