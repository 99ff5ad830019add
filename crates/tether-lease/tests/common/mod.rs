// Shared fixtures for the lifecycle and runner tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tether_core::LeaseConfig;
use tether_lease::{
    ReservationRegistry, Resource, ResourceError, ResourceFactory, Timer, TimerCallback,
    TimerHandle,
};
use tokio_util::sync::CancellationToken;

pub const GRACE: Duration = Duration::from_millis(2_000);

#[derive(Debug, Default)]
pub struct Counters {
    pub opens: AtomicUsize,
    pub closes: AtomicUsize,
    pub fail_next_open: AtomicBool,
}

impl Counters {
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

/// Stand-in for a database connection.
#[derive(Debug)]
pub struct MockConn {
    pub serial: usize,
    closed: AtomicBool,
    counters: Arc<Counters>,
}

impl MockConn {
    pub fn query(&self) -> Result<usize, ResourceError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ResourceError::Closed);
        }
        Ok(self.serial)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Resource for MockConn {
    fn close(&self) -> Result<(), ResourceError> {
        self.closed.store(true, Ordering::SeqCst);
        self.counters.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MockFactory {
    pub counters: Arc<Counters>,
    /// Real (blocking) time spent inside `open`.
    pub open_delay: Option<Duration>,
}

impl ResourceFactory for MockFactory {
    type Resource = MockConn;

    fn open(&self) -> Result<MockConn, ResourceError> {
        if let Some(delay) = self.open_delay {
            std::thread::sleep(delay);
        }
        if self.counters.fail_next_open.swap(false, Ordering::SeqCst) {
            return Err(ResourceError::Open("connection refused".into()));
        }
        let serial = self.counters.opens.fetch_add(1, Ordering::SeqCst);
        Ok(MockConn {
            serial,
            closed: AtomicBool::new(false),
            counters: Arc::clone(&self.counters),
        })
    }

    fn describe(&self) -> String {
        "mock://shared".to_string()
    }
}

pub fn config() -> LeaseConfig {
    LeaseConfig {
        grace_period_ms: GRACE.as_millis() as u64,
        cancel_drain_ms: 0,
    }
}

pub fn registry() -> (ReservationRegistry<MockFactory>, Arc<Counters>) {
    let factory = MockFactory::default();
    let counters = Arc::clone(&factory.counters);
    (ReservationRegistry::new(factory, &config()), counters)
}

pub fn slow_registry(open_delay: Duration) -> (ReservationRegistry<MockFactory>, Arc<Counters>) {
    let factory = MockFactory {
        open_delay: Some(open_delay),
        ..MockFactory::default()
    };
    let counters = Arc::clone(&factory.counters);
    (ReservationRegistry::new(factory, &config()), counters)
}

/// Closes run on the blocking pool; give them a chance to land.
pub async fn wait_for_closes(counters: &Counters, expected: usize) {
    for _ in 0..1_000 {
        if counters.closes() >= expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}

/// Timer that only fires when told to and ignores cancellation, so stale
/// callbacks can be replayed.
#[derive(Default)]
pub struct ManualTimer {
    scheduled: Mutex<Vec<(Duration, Option<TimerCallback>, CancellationToken)>>,
}

impl ManualTimer {
    pub fn scheduled(&self) -> usize {
        self.scheduled.lock().unwrap().len()
    }

    pub fn was_cancelled(&self, index: usize) -> bool {
        self.scheduled.lock().unwrap()[index].2.is_cancelled()
    }

    pub fn fire(&self, index: usize) {
        let callback = self.scheduled.lock().unwrap()[index].1.take();
        if let Some(callback) = callback {
            callback();
        }
    }
}

impl Timer for ManualTimer {
    fn schedule(&self, delay: Duration, callback: TimerCallback) -> TimerHandle {
        let token = CancellationToken::new();
        self.scheduled
            .lock()
            .unwrap()
            .push((delay, Some(callback), token.clone()));
        TimerHandle::new(token)
    }
}
