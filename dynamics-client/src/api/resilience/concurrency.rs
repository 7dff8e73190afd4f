//! Transport lock
//!
//! A single-permit semaphore owned by the execution engine. It serializes
//! calls into a transport that is not safe under concurrent use, and records
//! how long callers waited for it. The same lock is used by the blocking and
//! the async entry points, so calls from both are serialized against each
//! other.

use super::config::TransportLocking;
use log::debug;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Held for the duration of one transport call
#[derive(Debug)]
pub struct TransportGuard {
    permit: Option<OwnedSemaphorePermit>,
    wait: Duration,
}

impl TransportGuard {
    /// Time spent waiting for the lock
    pub fn wait(&self) -> Duration {
        self.wait
    }

    /// Whether this guard actually holds the lock
    pub fn is_locked(&self) -> bool {
        self.permit.is_some()
    }

    fn unlocked() -> Self {
        Self {
            permit: None,
            wait: Duration::ZERO,
        }
    }
}

/// Mutual exclusion around transport calls with an explicit opt-out
#[derive(Debug, Clone)]
pub struct TransportLock {
    semaphore: Arc<Semaphore>,
    acquired: Arc<AtomicU64>,
    waited: Arc<AtomicU64>,
}

impl Default for TransportLock {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportLock {
    pub fn new() -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(1)),
            acquired: Arc::new(AtomicU64::new(0)),
            waited: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Acquire the lock, waiting asynchronously if another call holds it
    pub async fn acquire(&self, locking: TransportLocking) -> TransportGuard {
        if !locking.is_enabled() {
            return TransportGuard::unlocked();
        }

        let start = Instant::now();
        let will_wait = self.note_contention();
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .expect("transport lock semaphore is never closed");
        self.finish_acquire(permit, start, will_wait)
    }

    /// Acquire the lock, blocking the calling thread if another call holds it
    pub fn acquire_blocking(&self, locking: TransportLocking) -> TransportGuard {
        if !locking.is_enabled() {
            return TransportGuard::unlocked();
        }

        let start = Instant::now();
        let will_wait = self.note_contention();
        let permit = futures::executor::block_on(self.semaphore.clone().acquire_owned())
            .expect("transport lock semaphore is never closed");
        self.finish_acquire(permit, start, will_wait)
    }

    /// Try to acquire the lock without waiting
    pub fn try_acquire(&self, locking: TransportLocking) -> Option<TransportGuard> {
        if !locking.is_enabled() {
            return Some(TransportGuard::unlocked());
        }

        let permit = self.semaphore.clone().try_acquire_owned().ok()?;
        self.acquired.fetch_add(1, Ordering::Relaxed);
        Some(TransportGuard {
            permit: Some(permit),
            wait: Duration::ZERO,
        })
    }

    /// Whether a call currently holds the lock
    pub fn is_held(&self) -> bool {
        self.semaphore.available_permits() == 0
    }

    pub fn stats(&self) -> TransportLockStats {
        TransportLockStats {
            acquired: self.acquired.load(Ordering::Relaxed),
            waited: self.waited.load(Ordering::Relaxed),
        }
    }

    fn note_contention(&self) -> bool {
        let will_wait = self.semaphore.available_permits() == 0;
        if will_wait {
            self.waited.fetch_add(1, Ordering::Relaxed);
            debug!("Transport lock: waiting for in-flight call to finish");
        }
        will_wait
    }

    fn finish_acquire(
        &self,
        permit: OwnedSemaphorePermit,
        start: Instant,
        will_wait: bool,
    ) -> TransportGuard {
        self.acquired.fetch_add(1, Ordering::Relaxed);
        let wait = start.elapsed();
        if will_wait {
            debug!("Transport lock: acquired after {:?}", wait);
        }
        TransportGuard {
            permit: Some(permit),
            wait,
        }
    }
}

/// Statistics for the transport lock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportLockStats {
    /// Total acquisitions since creation
    pub acquired: u64,
    /// Acquisitions that found the lock held
    pub waited: u64,
}

impl TransportLockStats {
    /// Fraction of acquisitions that had to wait
    pub fn wait_rate(&self) -> f64 {
        if self.acquired == 0 {
            0.0
        } else {
            self.waited as f64 / self.acquired as f64
        }
    }
}
