//! watch-protocol - Wire protocol for watchd clients
//!
//! Inbound frames carry a [`ControlMessage`]; outbound frames carry the JSON
//! encoding of one event produced by the client's watcher.

pub mod message;

pub use message::{encode_event, ControlMessage, DecodeError, EncodeError};
