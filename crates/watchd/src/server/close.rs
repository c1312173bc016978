//! Classification of connection closures.
//!
//! Each direction has its own set of close codes that count as an ordinary
//! end of the connection:
//!
//! | direction | expected codes                                   |
//! |-----------|--------------------------------------------------|
//! | read      | 1000 normal, 1001 going away, 1005 no status     |
//! | write     | 1001 going away, 1006 abnormal closure           |
//!
//! Expected closures end their loop quietly; everything else is logged.

use std::error::Error as StdError;
use std::io;

use axum::extract::ws::{close_code, CloseFrame};
use tokio_tungstenite::tungstenite::error::{Error as WsError, ProtocolError};

/// Which loop observed the closure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
}

impl Direction {
    fn expected_codes(self) -> &'static [u16] {
        match self {
            Direction::Read => &[close_code::NORMAL, close_code::AWAY, close_code::STATUS],
            Direction::Write => &[close_code::AWAY, close_code::ABNORMAL],
        }
    }
}

/// How a loop's connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Closure {
    /// Ordinary end of the connection for this direction
    Expected { code: u16 },

    /// Any other close code, or a transport failure
    Unexpected { code: Option<u16>, detail: String },
}

impl Closure {
    pub fn is_expected(&self) -> bool {
        matches!(self, Closure::Expected { .. })
    }

    /// Classifies a close code for the given direction.
    pub fn from_code(direction: Direction, code: u16, detail: impl Into<String>) -> Self {
        if direction.expected_codes().contains(&code) {
            Closure::Expected { code }
        } else {
            Closure::Unexpected {
                code: Some(code),
                detail: detail.into(),
            }
        }
    }

    /// A close frame received by the read loop.
    ///
    /// A frame without a code counts as "no status received" (1005).
    pub fn from_close_frame(frame: Option<&CloseFrame>) -> Self {
        match frame {
            Some(frame) => Self::from_code(Direction::Read, frame.code, frame.reason.as_str()),
            None => Closure::Expected {
                code: close_code::STATUS,
            },
        }
    }

    /// The inbound stream ended without a close frame.
    pub fn stream_ended() -> Self {
        Self::from_code(
            Direction::Read,
            close_code::ABNORMAL,
            "connection ended without a close frame",
        )
    }

    /// A transport error on read. Always unexpected.
    pub fn from_read_error(err: &(dyn StdError + 'static)) -> Self {
        Closure::Unexpected {
            code: None,
            detail: err.to_string(),
        }
    }

    /// A transport error on write.
    ///
    /// A peer that already went away shows up as a broken or reset socket
    /// (abnormal closure) or as a write to a connection that completed its
    /// close handshake (going away); both are expected on this side.
    pub fn from_write_error(err: &(dyn StdError + 'static)) -> Self {
        let detail = err.to_string();
        let code = match find_source::<WsError>(err) {
            Some(
                WsError::ConnectionClosed
                | WsError::AlreadyClosed
                | WsError::Protocol(ProtocolError::SendAfterClosing),
            ) => Some(close_code::AWAY),
            Some(WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake)) => {
                Some(close_code::ABNORMAL)
            }
            _ => find_source::<io::Error>(err)
                .filter(|e| is_peer_gone(e.kind()))
                .map(|_| close_code::ABNORMAL),
        };
        match code {
            Some(code) => Self::from_code(Direction::Write, code, detail),
            None => Closure::Unexpected { code: None, detail },
        }
    }
}

/// Finds the first error of type `T` in an error's source chain.
fn find_source<'a, T: StdError + 'static>(err: &'a (dyn StdError + 'static)) -> Option<&'a T> {
    let mut current = Some(err);
    while let Some(e) = current {
        if let Some(found) = e.downcast_ref::<T>() {
            return Some(found);
        }
        current = e.source();
    }
    None
}

fn is_peer_gone(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof
    )
}
