//! Permit Pool
//!
//! Bounded-concurrency gate around every outbound call to the coordination
//! service. Under load, excess operations queue behind the pool instead of
//! opening a connection storm against the agent.

use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Bounded permit pool.
///
/// A pool built with `max <= 0` is unlimited: `acquire` never waits.
#[derive(Clone)]
pub struct PermitPool {
    semaphore: Option<Arc<Semaphore>>,
    capacity: usize,
}

impl PermitPool {
    pub fn new(max: i64) -> Self {
        if max <= 0 {
            Self {
                semaphore: None,
                capacity: 0,
            }
        } else {
            Self {
                semaphore: Some(Arc::new(Semaphore::new(max as usize))),
                capacity: max as usize,
            }
        }
    }

    /// Acquire a permit, waiting while the pool is saturated.
    ///
    /// The permit is released when the returned guard drops, on every exit
    /// path including error and cancellation.
    pub async fn acquire(&self) -> Permit {
        let inner = match &self.semaphore {
            // The semaphore is never closed, so acquire_owned cannot fail.
            Some(sem) => sem.clone().acquire_owned().await.ok(),
            None => None,
        };
        Permit { _inner: inner }
    }

    /// Configured pool size; 0 means unlimited.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Permits currently free. Unlimited pools report `usize::MAX`.
    pub fn available(&self) -> usize {
        match &self.semaphore {
            Some(sem) => sem.available_permits(),
            None => usize::MAX,
        }
    }
}

/// RAII permit; dropping it returns capacity to the pool.
pub struct Permit {
    _inner: Option<OwnedSemaphorePermit>,
}
