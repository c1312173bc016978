//! watch-core - Shared domain types for watchd
//!
//! This crate provides the types shared between the wire protocol
//! (`watch-protocol`) and the daemon (`watchd`).
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()`, `todo!()`, or direct indexing `[i]`.

pub mod counter;
pub mod watcher;

// Re-exports for convenience
pub use counter::CounterValue;
pub use watcher::{WatcherId, WATCHER_ID_PREFIX};
