//! Set of watchers currently bound to an open connection.
//!
//! A connection adds its watcher once the watcher has started and removes
//! it during teardown, before the watcher is stopped. Removal is
//! synchronous so it can run from `Drop`.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;

use watch_core::WatcherId;

/// Registry entry exposed through `/health`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WatcherEntry {
    pub watcher_id: WatcherId,
    pub connected_at: DateTime<Utc>,
}

/// Process-wide set of active watchers.
#[derive(Debug, Default)]
pub struct WatcherRegistry {
    watchers: Mutex<HashMap<WatcherId, DateTime<Utc>>>,
}

impl WatcherRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a watcher. Returns `false` if it was already present.
    pub fn add(&self, id: WatcherId) -> bool {
        let mut watchers = self.watchers.lock().unwrap_or_else(PoisonError::into_inner);
        if watchers.contains_key(&id) {
            return false;
        }
        watchers.insert(id, Utc::now());
        true
    }

    /// Forgets a watcher. Returns `false` if it was not present.
    pub fn remove(&self, id: &WatcherId) -> bool {
        self.watchers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
            .is_some()
    }

    pub fn contains(&self, id: &WatcherId) -> bool {
        self.watchers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.watchers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entries ordered by connection time.
    pub fn snapshot(&self) -> Vec<WatcherEntry> {
        let watchers = self.watchers.lock().unwrap_or_else(PoisonError::into_inner);
        let mut entries: Vec<WatcherEntry> = watchers
            .iter()
            .map(|(id, connected_at)| WatcherEntry {
                watcher_id: id.clone(),
                connected_at: *connected_at,
            })
            .collect();
        entries.sort_by(|a, b| {
            a.connected_at
                .cmp(&b.connected_at)
                .then_with(|| a.watcher_id.cmp(&b.watcher_id))
        });
        entries
    }
}
