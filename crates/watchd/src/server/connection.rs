//! Connection handler for individual WebSocket clients.
//!
//! Each admitted client gets its own `ConnectionHandler` that:
//! - Runs a read loop applying control messages to the session
//! - Runs a write loop forwarding session events to the client
//! - Tears the connection down exactly once, whichever side ends first
//!
//! Teardown order is fixed: signal "done" to both loops, close the
//! transport, remove the watcher from the registry, stop the session,
//! release the admission slot.
//!
//! # Panic-Free Guarantees
//!
//! This module follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - A panicking loop task is logged; teardown still runs

use std::error::Error as StdError;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{close_code, CloseFrame, Message, Utf8Bytes};
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use watch_core::WatcherId;
use watch_protocol::{encode_event, ControlMessage};

use crate::admission::AdmissionSlot;
use crate::config::DEFAULT_CLOSE_TIMEOUT_MS;
use crate::registry::WatcherRegistry;
use crate::session::Session;

use super::close::Closure;
use super::shutdown::{ShutdownCoordinator, TerminationSignal};

/// Summary of a finished connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionOutcome {
    /// Watcher the connection was bound to
    pub watcher_id: WatcherId,

    /// Signal that started teardown
    pub cause: TerminationSignal,

    /// Control messages applied to the session
    pub commands_applied: u64,

    /// Inbound frames that could not be decoded
    pub soft_errors: u64,

    /// Events written to the client
    pub events_sent: u64,
}

/// Resources a connection holds until teardown.
///
/// Released exactly once, by [`release`](Self::release) or by `Drop` when the
/// connection is abandoned (a failed handshake, or a cancelled `run`).
struct Lease<S: Session> {
    watcher_id: WatcherId,
    session: Arc<S>,
    slot: Option<AdmissionSlot>,
    registry: Option<Arc<WatcherRegistry>>,
}

impl<S: Session> Lease<S> {
    /// Registry removal, session stop, slot release, in that order.
    fn release(&mut self) {
        let Some(slot) = self.slot.take() else {
            return;
        };
        if let Some(registry) = &self.registry {
            registry.remove(&self.watcher_id);
        }
        self.session.stop();
        slot.release();
    }
}

impl<S: Session> Drop for Lease<S> {
    fn drop(&mut self) {
        if self.slot.is_some() {
            debug!(watcher_id = %self.watcher_id, "Connection abandoned before teardown");
            self.release();
        }
    }
}

/// Drives one client connection from upgrade to teardown.
///
/// Owns the started session and the admission slot. Both are released
/// exactly once: by [`run`](Self::run) on every exit path, or when the
/// handler is discarded before running (for example when the WebSocket
/// handshake fails).
pub struct ConnectionHandler<S: Session> {
    watcher_id: WatcherId,
    lease: Lease<S>,
    events: Option<mpsc::Receiver<S::Event>>,
    quit: CancellationToken,
    close_timeout: Duration,
}

impl<S: Session> ConnectionHandler<S> {
    /// Creates a handler for a started session.
    ///
    /// # Arguments
    ///
    /// * `session` - Session already started by the caller
    /// * `slot` - Admission slot held for this connection
    /// * `quit` - Process-wide quit signal
    pub fn new(mut session: S, slot: AdmissionSlot, quit: CancellationToken) -> Self {
        let watcher_id = session.id().clone();
        let events = session.take_events();
        Self {
            lease: Lease {
                watcher_id: watcher_id.clone(),
                session: Arc::new(session),
                slot: Some(slot),
                registry: None,
            },
            watcher_id,
            events,
            quit,
            close_timeout: Duration::from_millis(DEFAULT_CLOSE_TIMEOUT_MS),
        }
    }

    /// Removes the watcher from `registry` during teardown.
    pub fn with_registry(mut self, registry: Arc<WatcherRegistry>) -> Self {
        self.lease.registry = Some(registry);
        self
    }

    /// Bounds how long closing the transport may take.
    pub fn with_close_timeout(mut self, close_timeout: Duration) -> Self {
        self.close_timeout = close_timeout;
        self
    }

    pub fn watcher_id(&self) -> &WatcherId {
        &self.watcher_id
    }

    /// Runs the connection until it ends, then tears it down.
    ///
    /// `stream` and `sink` are the two halves of the client transport. Both
    /// loops run as separate tasks and are joined before teardown, so no
    /// task outlives the connection's resources.
    pub async fn run<St, Si, E>(self, stream: St, sink: Si) -> ConnectionOutcome
    where
        St: Stream<Item = Result<Message, E>> + Unpin + Send + 'static,
        E: StdError + Send + Sync + 'static,
        Si: Sink<Message> + Unpin + Send + 'static,
        Si::Error: StdError + Send + Sync + 'static,
    {
        let Self {
            watcher_id,
            mut lease,
            events,
            quit,
            close_timeout,
        } = self;

        let events = events.unwrap_or_else(|| {
            // A closed channel: the write loop sees the events end at once.
            warn!(watcher_id = %watcher_id, "Session has no event stream");
            let (_tx, rx) = mpsc::channel(1);
            rx
        });
        let coordinator = Arc::new(ShutdownCoordinator::new(&quit));

        info!(watcher_id = %watcher_id, "WebSocket started");

        let reader = tokio::spawn(read_loop(
            stream,
            Arc::clone(&lease.session),
            Arc::clone(&coordinator),
        ));
        let writer = tokio::spawn(write_loop(
            sink,
            events,
            watcher_id.clone(),
            Arc::clone(&coordinator),
        ));

        let joined = async { tokio::join!(reader, writer) };
        tokio::pin!(joined);

        let (read_result, write_result) = tokio::select! {
            results = &mut joined => results,
            _ = quit.cancelled() => {
                coordinator.trigger(TerminationSignal::ProcessQuit);
                joined.await
            }
        };

        let read_stats = read_result.unwrap_or_else(|e| {
            error!(watcher_id = %watcher_id, error = %e, "Read loop panicked");
            coordinator.trigger(TerminationSignal::ReadDone);
            ReadStats::default()
        });
        let (sink, events_sent) = match write_result {
            Ok((sink, events_sent)) => (Some(sink), events_sent),
            Err(e) => {
                error!(watcher_id = %watcher_id, error = %e, "Write loop panicked");
                coordinator.trigger(TerminationSignal::WriteFailed);
                (None, 0)
            }
        };

        let cause = coordinator
            .cause()
            .unwrap_or(TerminationSignal::ReadDone);

        if let Some(sink) = sink {
            close_transport(sink, cause, &watcher_id, close_timeout).await;
        }
        lease.release();
        coordinator.mark_closed();

        info!(watcher_id = %watcher_id, cause = %cause, "WebSocket stopped");

        ConnectionOutcome {
            watcher_id,
            cause,
            commands_applied: read_stats.commands_applied,
            soft_errors: read_stats.soft_errors,
            events_sent,
        }
    }
}

/// Sends a close frame and closes the sink, bounded by `close_timeout`.
async fn close_transport<Si>(
    mut sink: Si,
    cause: TerminationSignal,
    watcher_id: &WatcherId,
    close_timeout: Duration,
) where
    Si: Sink<Message> + Unpin,
    Si::Error: StdError,
{
    let code = match cause {
        TerminationSignal::ProcessQuit => close_code::AWAY,
        _ => close_code::NORMAL,
    };
    let frame = CloseFrame {
        code,
        reason: Utf8Bytes::from_static(""),
    };

    let close = async {
        // The peer may already have closed; only the final close matters.
        let _ = sink.send(Message::Close(Some(frame))).await;
        sink.close().await
    };

    match timeout(close_timeout, close).await {
        Ok(Ok(())) => debug!(watcher_id = %watcher_id, "Transport closed"),
        Ok(Err(e)) => debug!(watcher_id = %watcher_id, error = %e, "Transport already closed"),
        Err(_) => warn!(
            watcher_id = %watcher_id,
            timeout = ?close_timeout,
            "Timed out closing transport"
        ),
    }
}

#[derive(Debug, Default)]
struct ReadStats {
    commands_applied: u64,
    soft_errors: u64,
}

/// Reads control messages until the client goes away or teardown starts.
async fn read_loop<St, E, S>(
    mut stream: St,
    session: Arc<S>,
    coordinator: Arc<ShutdownCoordinator>,
) -> ReadStats
where
    St: Stream<Item = Result<Message, E>> + Unpin,
    E: StdError + 'static,
    S: Session,
{
    let watcher_id = session.id().clone();
    let done = coordinator.done_token();
    let mut stats = ReadStats::default();

    loop {
        let next = tokio::select! {
            biased;
            _ = done.cancelled() => break,
            next = stream.next() => next,
        };

        let text = match next {
            Some(Ok(Message::Text(text))) => text.as_str().to_owned(),
            Some(Ok(Message::Binary(data))) => match String::from_utf8(data.to_vec()) {
                Ok(text) => text,
                Err(_) => {
                    stats.soft_errors += 1;
                    warn!(watcher_id = %watcher_id, len = data.len(), "Non-UTF-8 binary frame");
                    continue;
                }
            },
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
            Some(Ok(Message::Close(frame))) => {
                log_closure(&watcher_id, "read", &Closure::from_close_frame(frame.as_ref()));
                break;
            }
            Some(Err(e)) => {
                log_closure(&watcher_id, "read", &Closure::from_read_error(&e));
                break;
            }
            None => {
                log_closure(&watcher_id, "read", &Closure::stream_ended());
                break;
            }
        };

        match ControlMessage::decode(&text) {
            Ok(ControlMessage::ResetCounter) => {
                let reset = tokio::select! {
                    biased;
                    _ = done.cancelled() => break,
                    reset = session.reset_counter() => reset,
                };
                match reset {
                    Ok(()) => {
                        stats.commands_applied += 1;
                        debug!(watcher_id = %watcher_id, "Counter reset requested");
                    }
                    Err(e) => warn!(watcher_id = %watcher_id, error = %e, "Failed to reset counter"),
                }
            }
            Err(e) => {
                stats.soft_errors += 1;
                warn!(watcher_id = %watcher_id, error = %e, "Failed to decode control message");
            }
        }
    }

    coordinator.trigger(coordinator.signal_for(TerminationSignal::ReadDone));
    stats
}

/// Forwards session events until a write fails, the events end, or
/// teardown starts. Hands the sink back for closing.
async fn write_loop<Si, T>(
    mut sink: Si,
    mut events: mpsc::Receiver<T>,
    watcher_id: WatcherId,
    coordinator: Arc<ShutdownCoordinator>,
) -> (Si, u64)
where
    Si: Sink<Message> + Unpin,
    Si::Error: StdError + 'static,
    T: serde::Serialize,
{
    let done = coordinator.done_token();
    let mut events_sent = 0u64;

    let signal = loop {
        let event = tokio::select! {
            biased;
            _ = done.cancelled() => break TerminationSignal::WriteFailed,
            event = events.recv() => event,
        };

        let Some(event) = event else {
            debug!(watcher_id = %watcher_id, "Event stream ended");
            break TerminationSignal::SessionEnded;
        };

        let text = match encode_event(&event) {
            Ok(text) => text,
            Err(e) => {
                error!(watcher_id = %watcher_id, error = %e, "Failed to encode event");
                continue;
            }
        };

        let written = tokio::select! {
            biased;
            _ = done.cancelled() => break TerminationSignal::WriteFailed,
            written = sink.send(Message::Text(text.into())) => written,
        };

        if let Err(e) = written {
            log_closure(&watcher_id, "write", &Closure::from_write_error(&e));
            break TerminationSignal::WriteFailed;
        }
        events_sent += 1;
    };

    coordinator.trigger(coordinator.signal_for(signal));
    (sink, events_sent)
}

fn log_closure(watcher_id: &WatcherId, direction: &'static str, closure: &Closure) {
    match closure {
        Closure::Expected { code } => {
            debug!(watcher_id = %watcher_id, direction, code, "Connection closed")
        }
        Closure::Unexpected { code, detail } => warn!(
            watcher_id = %watcher_id,
            direction,
            code = ?code,
            detail = %detail,
            "Connection closed unexpectedly"
        ),
    }
}
