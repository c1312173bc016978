//! Process-wide admission control for client connections.
//!
//! A fixed number of [`AdmissionSlot`]s exists per process. A connection
//! holds one slot for its whole lifetime; acquiring blocks while all slots
//! are taken. Slots are released by [`AdmissionSlot::release`] or by
//! dropping them, so every exit path gives the slot back exactly once.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

/// Counting gate bounding the number of open connections.
///
/// Cheap to clone; clones share the same pool. Waiters are admitted in FIFO
/// order.
#[derive(Clone)]
pub struct AdmissionController {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

impl AdmissionController {
    /// Creates a controller with `capacity` slots.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.min(Semaphore::MAX_PERMITS);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Waits for a free slot.
    ///
    /// Blocks while `capacity` slots are held. Cancelling `quit` abandons the
    /// wait with [`AdmissionError::ShuttingDown`], so a shutting-down process
    /// does not strand callers queued here.
    pub async fn acquire(&self, quit: &CancellationToken) -> Result<AdmissionSlot, AdmissionError> {
        tokio::select! {
            biased;

            _ = quit.cancelled() => Err(AdmissionError::ShuttingDown),

            permit = Arc::clone(&self.semaphore).acquire_owned() => {
                permit
                    .map(|permit| AdmissionSlot { permit })
                    .map_err(|_| AdmissionError::Closed)
            }
        }
    }

    /// Takes a slot only if one is free right now.
    pub fn try_acquire(&self) -> Option<AdmissionSlot> {
        Arc::clone(&self.semaphore)
            .try_acquire_owned()
            .ok()
            .map(|permit| AdmissionSlot { permit })
    }

    /// Total number of slots.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Slots currently free.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Slots currently held.
    pub fn in_use(&self) -> usize {
        self.capacity.saturating_sub(self.available())
    }
}

impl fmt::Debug for AdmissionController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdmissionController")
            .field("capacity", &self.capacity)
            .field("in_use", &self.in_use())
            .finish()
    }
}

/// One unit of connection capacity.
///
/// The slot goes back to its controller when released or dropped.
#[must_use = "dropping a slot releases it immediately"]
pub struct AdmissionSlot {
    permit: OwnedSemaphorePermit,
}

impl AdmissionSlot {
    /// Returns the slot to the pool.
    pub fn release(self) {
        drop(self.permit);
    }
}

impl fmt::Debug for AdmissionSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdmissionSlot")
            .field("permits", &self.permit.num_permits())
            .finish()
    }
}

/// Errors that can occur while waiting for a slot.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdmissionError {
    #[error("Server is shutting down")]
    ShuttingDown,

    #[error("Admission controller closed")]
    Closed,
}
