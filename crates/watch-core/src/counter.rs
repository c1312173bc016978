//! Counter events emitted by a watcher.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::watcher::WatcherId;

/// One counter update produced by a watcher.
///
/// `iteration` increases monotonically for the lifetime of the watcher and
/// is never reset. `value` is the resettable counter: it starts at 1 and
/// returns to 1 on the first tick after a reset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterValue {
    /// Watcher that produced the update
    pub watcher_id: WatcherId,

    /// Number of updates produced so far (1-based)
    pub iteration: u64,

    /// Current counter value
    pub value: u64,

    /// When the update was produced
    pub timestamp: DateTime<Utc>,
}

impl CounterValue {
    /// Creates a counter update stamped with the current time.
    pub fn new(watcher_id: WatcherId, iteration: u64, value: u64) -> Self {
        Self {
            watcher_id,
            iteration,
            value,
            timestamp: Utc::now(),
        }
    }
}
