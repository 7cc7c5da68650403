use std::{
    fmt,
    ops::{Deref, DerefMut},
    sync::Arc,
};

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("instance pool needs at least one instance")]
    Empty,
}

/// Fixed-size set of instances that must never be used by two callers at once.
///
/// Instances are only reachable through a [`Lease`]. A lease is handed out by
/// [`InstancePool::acquire`] and gives the instance back when it is released
/// or dropped, so every acquisition is matched by exactly one release.
pub struct InstancePool<T> {
    shared: Arc<PoolShared<T>>,
}

struct PoolShared<T> {
    permits: Arc<Semaphore>,
    idle: Mutex<Vec<T>>,
    capacity: usize,
}

impl<T> Clone for InstancePool<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T> fmt::Debug for InstancePool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstancePool")
            .field("capacity", &self.capacity())
            .field("available", &self.available())
            .finish()
    }
}

impl<T: Send + 'static> InstancePool<T> {
    pub fn new(instances: Vec<T>) -> Result<Self, PoolError> {
        if instances.is_empty() {
            return Err(PoolError::Empty);
        }
        let capacity = instances.len();
        Ok(Self {
            shared: Arc::new(PoolShared {
                permits: Arc::new(Semaphore::new(capacity)),
                idle: Mutex::new(instances),
                capacity,
            }),
        })
    }

    /// Waits until an instance is free and leases it to the caller.
    ///
    /// There is no timeout: while every instance is leased the caller stays
    /// suspended. Waiters are not guaranteed to be served in arrival order.
    pub async fn acquire(&self) -> Lease<T> {
        let permit = match self.shared.permits.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                debug!(
                    target = "supertonic::pool",
                    capacity = self.shared.capacity,
                    "all instances leased; waiting"
                );
                self.shared
                    .permits
                    .clone()
                    .acquire_owned()
                    .await
                    .expect("pool semaphore is never closed")
            }
        };

        // Instances go back to `idle` before their permit is returned, so a
        // held permit always has an idle instance behind it.
        let instance = self
            .shared
            .idle
            .lock()
            .pop()
            .expect("permit held without an idle instance");

        Lease {
            instance: Some(instance),
            shared: self.shared.clone(),
            _permit: permit,
        }
    }
}

impl<T> InstancePool<T> {
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Number of instances not currently leased.
    pub fn available(&self) -> usize {
        self.shared.permits.available_permits()
    }
}

/// Exclusive use of one pooled instance.
pub struct Lease<T> {
    instance: Option<T>,
    shared: Arc<PoolShared<T>>,
    // Dropped after `Drop::drop` has returned the instance.
    _permit: OwnedSemaphorePermit,
}

impl<T> Lease<T> {
    /// Gives the instance back to the pool and wakes one waiter.
    pub fn release(self) {
        drop(self);
    }
}

impl<T> Deref for Lease<T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.instance.as_ref().expect("lease already released")
    }
}

impl<T> DerefMut for Lease<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.instance.as_mut().expect("lease already released")
    }
}

impl<T> Drop for Lease<T> {
    fn drop(&mut self) {
        if let Some(instance) = self.instance.take() {
            self.shared.idle.lock().push(instance);
        }
    }
}
