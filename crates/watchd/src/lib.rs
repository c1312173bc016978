//! watchd - Admission-controlled WebSocket bridge for watcher events
//!
//! This crate provides the daemon's building blocks:
//! - `admission` - Process-wide cap on open connections
//! - `session` - The seam between a connection and its event source
//! - `watcher` - The counter watcher shipped as the default session
//! - `registry` - Set of watchers currently bound to a connection
//! - `server` - HTTP/WebSocket server and the per-connection lifecycle
//! - `config` - Layered server configuration
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        watchd                               │
//! ├─────────────────────────────────────────────────────────────┤
//! │                                                             │
//! │  GET /ws ──▶ OriginPolicy ──▶ AdmissionController ──▶ Watcher│
//! │                                                   start()   │
//! │                                                     │       │
//! │                        ┌────────────────────────────┘       │
//! │                        ▼                                    │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │ ConnectionHandler                                   │    │
//! │  │   read loop  ── ControlMessage ──▶ reset_counter()  │    │
//! │  │   write loop ◀── CounterValue ──── events           │    │
//! │  │   ShutdownCoordinator: close → stop → release       │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! │                                                             │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! All production code in this crate follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations return `Result` or `Option`
//! - Channel operations handle closure gracefully

pub mod admission;
pub mod config;
pub mod registry;
pub mod server;
pub mod session;
pub mod watcher;
