//! Watcher actor commands and snapshots.

use tokio::sync::oneshot;

use watch_core::WatcherId;

/// Commands sent to a watcher actor.
#[derive(Debug)]
pub enum WatcherCommand {
    /// Reset the counter; the next update carries value 1.
    ResetCounter,

    /// Report the actor's current state.
    GetSnapshot {
        /// Channel to send the snapshot
        respond_to: oneshot::Sender<WatcherSnapshot>,
    },
}

/// Point-in-time view of a watcher's state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatcherSnapshot {
    /// Watcher identity
    pub watcher_id: WatcherId,

    /// Updates produced so far
    pub iteration: u64,

    /// Current counter value
    pub value: u64,

    /// Resets applied so far
    pub resets: u64,
}
