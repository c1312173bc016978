//! Per-connection teardown coordination.
//!
//! Several independent events can end a connection: the read loop finishing,
//! the write loop failing, the event source ending, or the process quitting.
//! All of them funnel into [`ShutdownCoordinator::trigger`]; only the first
//! call moves the coordinator out of `Active`, records its cause, and
//! cancels the connection's local "done" token so the other loop leaves its
//! suspension point. Later calls are no-ops.
//!
//! ```text
//! Active ──trigger()──▶ Closing ──mark_closed()──▶ Closed
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::OnceLock;

use tokio_util::sync::CancellationToken;

const ACTIVE: u8 = 0;
const CLOSING: u8 = 1;
const CLOSED: u8 = 2;

/// What ended a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TerminationSignal {
    /// The read loop exited (client closed, read error)
    ReadDone,
    /// A write to the client failed
    WriteFailed,
    /// The process-wide quit signal fired
    ProcessQuit,
    /// The session's event sequence ended on its own
    SessionEnded,
}

impl fmt::Display for TerminationSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TerminationSignal::ReadDone => "read_done",
            TerminationSignal::WriteFailed => "write_failed",
            TerminationSignal::ProcessQuit => "process_quit",
            TerminationSignal::SessionEnded => "session_ended",
        };
        f.write_str(name)
    }
}

/// Coordinator lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    Active,
    Closing,
    Closed,
}

/// Single idempotent teardown trigger for one connection.
#[derive(Debug)]
pub struct ShutdownCoordinator {
    state: AtomicU8,
    cause: OnceLock<TerminationSignal>,
    done: CancellationToken,
    quit: CancellationToken,
}

impl ShutdownCoordinator {
    /// Creates a coordinator whose "done" token is a child of `quit`.
    ///
    /// Cancelling the process-wide token therefore also wakes anything
    /// waiting on this connection's "done" token.
    pub fn new(quit: &CancellationToken) -> Self {
        Self {
            state: AtomicU8::new(ACTIVE),
            cause: OnceLock::new(),
            done: quit.child_token(),
            quit: quit.clone(),
        }
    }

    /// Starts teardown.
    ///
    /// Returns `true` for the call that moved the coordinator out of
    /// `Active`; every other call returns `false` and changes nothing.
    pub fn trigger(&self, signal: TerminationSignal) -> bool {
        if self
            .state
            .compare_exchange(ACTIVE, CLOSING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        let _ = self.cause.set(signal);
        self.done.cancel();
        true
    }

    /// Marks teardown finished. Only valid after a trigger.
    pub fn mark_closed(&self) -> bool {
        self.state
            .compare_exchange(CLOSING, CLOSED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn state(&self) -> CoordinatorState {
        match self.state.load(Ordering::Acquire) {
            ACTIVE => CoordinatorState::Active,
            CLOSING => CoordinatorState::Closing,
            _ => CoordinatorState::Closed,
        }
    }

    /// The signal that started teardown, if any.
    pub fn cause(&self) -> Option<TerminationSignal> {
        self.cause.get().copied()
    }

    /// Token cancelled when teardown starts or the process quits.
    pub fn done_token(&self) -> CancellationToken {
        self.done.clone()
    }

    /// Whether the process-wide quit signal has fired.
    pub fn is_quitting(&self) -> bool {
        self.quit.is_cancelled()
    }

    /// Maps a loop's own exit reason to the signal it reports, preferring
    /// [`TerminationSignal::ProcessQuit`] when the process is quitting.
    pub fn signal_for(&self, own: TerminationSignal) -> TerminationSignal {
        if self.is_quitting() {
            TerminationSignal::ProcessQuit
        } else {
            own
        }
    }
}
