//! Watcher identity.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Prefix for identifiers assigned by the daemon.
pub const WATCHER_ID_PREFIX: &str = "watcher-";

/// Unique identifier for a watcher bound to one client connection.
///
/// Format: `"watcher-<n>"` when assigned by the daemon, where `n` is the
/// process-local connection number.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WatcherId(String);

impl WatcherId {
    /// Creates a new WatcherId from a string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Creates the identifier for the given connection number.
    pub fn from_connection(connection_number: u64) -> Self {
        Self(format!("{WATCHER_ID_PREFIX}{connection_number}"))
    }

    /// Returns the underlying string reference.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WatcherId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for WatcherId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for WatcherId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for WatcherId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
