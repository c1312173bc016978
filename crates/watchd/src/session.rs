//! The seam between a client connection and its event source.
//!
//! A [`Session`] is created per connection by a [`SessionFactory`], started
//! once, shared between the connection's read and write loops, and stopped
//! exactly once when the connection tears down. Implementations must be safe
//! to drive concurrently: the read loop calls [`Session::reset_counter`]
//! while the write loop drains the event channel.

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;

use watch_core::WatcherId;

/// An event-producing, command-consuming unit bound to one connection.
#[async_trait]
pub trait Session: Send + Sync + 'static {
    /// Payload forwarded verbatim (JSON-encoded) to the client.
    type Event: Serialize + Send + 'static;

    /// Identity of this session.
    fn id(&self) -> &WatcherId;

    /// Initializes the event source.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError`] if the source cannot start. The caller still
    /// calls [`stop`](Session::stop) afterwards.
    async fn start(&mut self) -> Result<(), SessionError>;

    /// Hands out the event sequence.
    ///
    /// Returns `Some` exactly once after a successful start. The sequence
    /// ends (the receiver yields `None`) once the session is stopped.
    fn take_events(&mut self) -> Option<mpsc::Receiver<Self::Event>>;

    /// Asks the session to reset its counter.
    ///
    /// Failures are reported but never end the connection.
    async fn reset_counter(&self) -> Result<(), SessionError>;

    /// Releases all session resources.
    ///
    /// Idempotent and safe to call whether or not `start` succeeded.
    fn stop(&self);
}

/// Creates one [`Session`] per admitted connection.
pub trait SessionFactory: Send + Sync + 'static {
    type Session: Session;

    /// Builds an unstarted session with the given identity.
    fn create(&self, id: WatcherId) -> Self::Session;
}

/// Errors reported by a [`Session`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("Session {0} already started")]
    AlreadyStarted(WatcherId),

    #[error("Session {0} not started")]
    NotStarted(WatcherId),

    #[error("Session {0} stopped")]
    Stopped(WatcherId),

    #[error("Failed to start session {id}: {reason}")]
    StartFailed { id: WatcherId, reason: String },
}
