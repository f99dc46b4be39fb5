//! Admission gate in front of the external store.
//!
//! The pool has a fixed number of leases and a bounded number of waiters.
//! Once retired it hands out no new leases; the store is closed after the
//! last outstanding lease is dropped.

use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::driver::{DriverError, TableStore};

/// A gated external store.
pub struct ExternalPool {
    store: Arc<dyn TableStore>,
    permits: Arc<Semaphore>,
    size: usize,
    queue_depth: usize,
    acquire_timeout: Duration,
    waiting: AtomicUsize,
    in_flight: AtomicUsize,
    retired: AtomicBool,
    drained: Notify,
}

impl ExternalPool {
    pub fn new(
        store: Arc<dyn TableStore>,
        size: usize,
        queue_depth: usize,
        acquire_timeout: Duration,
    ) -> Arc<Self> {
        let size = size.max(1);
        Arc::new(Self {
            store,
            permits: Arc::new(Semaphore::new(size)),
            size,
            queue_depth,
            acquire_timeout,
            waiting: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            retired: AtomicBool::new(false),
            drained: Notify::new(),
        })
    }

    /// Number of leases.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Leases currently held.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::SeqCst)
    }

    /// Take a lease, waiting until the acquire timeout or `deadline`,
    /// whichever comes first.
    pub async fn lease(self: &Arc<Self>, deadline: Option<Instant>) -> Result<PoolLease, DriverError> {
        if self.is_retired() {
            return Err(DriverError::PoolClosed);
        }

        let permit = match Arc::clone(&self.permits).try_acquire_owned() {
            Ok(permit) => permit,
            Err(TryAcquireError::Closed) => return Err(DriverError::PoolClosed),
            Err(TryAcquireError::NoPermits) => self.wait_for_permit(deadline).await?,
        };

        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let lease = PoolLease {
            pool: Arc::clone(self),
            _permit: permit,
        };
        // A retire that raced the acquire wins.
        if self.is_retired() {
            return Err(DriverError::PoolClosed);
        }
        Ok(lease)
    }

    async fn wait_for_permit(&self, deadline: Option<Instant>) -> Result<OwnedSemaphorePermit, DriverError> {
        if self.waiting.fetch_add(1, Ordering::SeqCst) >= self.queue_depth {
            self.waiting.fetch_sub(1, Ordering::SeqCst);
            return Err(DriverError::QueueFull);
        }

        let mut until = Instant::now() + self.acquire_timeout;
        if let Some(deadline) = deadline {
            until = until.min(deadline);
        }
        let result = tokio::time::timeout_at(until, Arc::clone(&self.permits).acquire_owned()).await;
        self.waiting.fetch_sub(1, Ordering::SeqCst);

        match result {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_closed)) => Err(DriverError::PoolClosed),
            Err(_elapsed) => Err(DriverError::AcquireTimeout),
        }
    }

    /// Stop handing out leases. Waiters fail with [`DriverError::PoolClosed`].
    pub fn retire(&self) {
        if !self.retired.swap(true, Ordering::SeqCst) {
            self.permits.close();
            debug!(in_flight = self.in_flight(), "external pool retired");
        }
    }

    /// Wait for every outstanding lease, then close the store.
    pub async fn drain_and_close(&self) {
        self.retire();
        loop {
            let notified = self.drained.notified();
            if self.in_flight() == 0 {
                break;
            }
            notified.await;
        }
        self.store.close().await;
        info!("retired external pool closed");
    }

    fn release(&self) {
        if self.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.drained.notify_waiters();
        }
    }
}

impl std::fmt::Debug for ExternalPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExternalPool")
            .field("size", &self.size)
            .field("in_flight", &self.in_flight())
            .field("retired", &self.is_retired())
            .finish()
    }
}

/// A held lease on the external store. Dereferences to the store.
pub struct PoolLease {
    pool: Arc<ExternalPool>,
    _permit: OwnedSemaphorePermit,
}

impl Deref for PoolLease {
    type Target = dyn TableStore;

    fn deref(&self) -> &Self::Target {
        self.pool.store.as_ref()
    }
}

impl Drop for PoolLease {
    fn drop(&mut self) {
        self.pool.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::EmbeddedStore;

    fn pool(size: usize, queue: usize, timeout_ms: u64) -> Arc<ExternalPool> {
        let store: Arc<dyn TableStore> = Arc::new(EmbeddedStore::open_in_memory().unwrap());
        ExternalPool::new(store, size, queue, Duration::from_millis(timeout_ms))
    }

    #[tokio::test]
    async fn test_lease_and_release() {
        let pool = pool(2, 4, 100);
        let a = pool.lease(None).await.unwrap();
        let _b = pool.lease(None).await.unwrap();
        assert_eq!(pool.in_flight(), 2);
        drop(a);
        assert_eq!(pool.in_flight(), 1);
        ping_through(&pool).await;
    }

    async fn ping_through(pool: &Arc<ExternalPool>) {
        let lease = pool.lease(None).await.unwrap();
        lease.ping().await.unwrap();
    }

    #[tokio::test]
    async fn test_acquire_timeout() {
        let pool = pool(1, 4, 20);
        let _held = pool.lease(None).await.unwrap();
        assert!(matches!(
            pool.lease(None).await,
            Err(DriverError::AcquireTimeout)
        ));
    }

    #[tokio::test]
    async fn test_caller_deadline_shortens_wait() {
        let pool = pool(1, 4, 10_000);
        let _held = pool.lease(None).await.unwrap();
        let started = Instant::now();
        let result = pool
            .lease(Some(Instant::now() + Duration::from_millis(20)))
            .await;
        assert!(matches!(result, Err(DriverError::AcquireTimeout)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_full_queue_rejected_immediately() {
        let pool = pool(1, 0, 10_000);
        let _held = pool.lease(None).await.unwrap();
        assert!(matches!(pool.lease(None).await, Err(DriverError::QueueFull)));
    }

    #[tokio::test]
    async fn test_retired_pool_refuses_leases() {
        let pool = pool(2, 4, 100);
        pool.retire();
        assert!(matches!(pool.lease(None).await, Err(DriverError::PoolClosed)));
    }

    #[tokio::test]
    async fn test_drain_waits_for_outstanding_lease() {
        let pool = pool(2, 4, 100);
        let lease = pool.lease(None).await.unwrap();

        let draining = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.drain_and_close().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!draining.is_finished());

        // The held lease still works while the pool drains.
        lease.ping().await.unwrap();
        drop(lease);
        draining.await.unwrap();
        assert_eq!(pool.in_flight(), 0);
    }
}
