//! Counter watcher - the default [`Session`] served over `/ws`.
//!
//! Each watcher owns an actor task that emits a [`CounterValue`] every tick.
//! Clients reset the counter with a `reset_counter` control message.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐  WatcherCommand   ┌─────────────────┐  CounterValue
//! │     Watcher     │──────────────────▶│  WatcherActor   │──────────────▶ events()
//! │ (Session impl)  │   (mpsc channel)  │  (tick + state) │ (mpsc channel)
//! └─────────────────┘                   └─────────────────┘
//!         │ stop() / drop                       ▲
//!         └────────── CancellationToken ────────┘
//! ```

mod actor;
mod commands;

pub use commands::{WatcherCommand, WatcherSnapshot};

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use watch_core::{CounterValue, WatcherId};

use crate::config::ServerConfig;
use crate::session::{Session, SessionError, SessionFactory};

use actor::WatcherActor;

/// Command channel buffer size
const COMMAND_BUFFER: usize = 32;

/// Tunables shared by every watcher a factory creates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatcherConfig {
    /// Interval between counter updates
    pub tick_interval: Duration,

    /// Capacity of the event channel
    pub event_buffer: usize,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self::from(&ServerConfig::default())
    }
}

impl From<&ServerConfig> for WatcherConfig {
    fn from(config: &ServerConfig) -> Self {
        Self {
            tick_interval: config.tick_interval(),
            event_buffer: config.event_buffer,
        }
    }
}

/// A counter watcher bound to one connection.
pub struct Watcher {
    id: WatcherId,
    config: WatcherConfig,
    cancel: CancellationToken,
    commands: Option<mpsc::Sender<WatcherCommand>>,
    events: Option<mpsc::Receiver<CounterValue>>,
    stopped: AtomicBool,
}

impl Watcher {
    /// Creates an unstarted watcher.
    pub fn new(id: WatcherId, config: WatcherConfig) -> Self {
        Self {
            id,
            config,
            cancel: CancellationToken::new(),
            commands: None,
            events: None,
            stopped: AtomicBool::new(false),
        }
    }

    /// Returns true once `stop` has been called.
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Asks the actor for its current state.
    ///
    /// Returns `None` if the watcher is not running.
    pub async fn snapshot(&self) -> Option<WatcherSnapshot> {
        let sender = self.commands.as_ref()?;
        let (tx, rx) = oneshot::channel();
        sender
            .send(WatcherCommand::GetSnapshot { respond_to: tx })
            .await
            .ok()?;
        rx.await.ok()
    }

    fn sender(&self) -> Result<&mpsc::Sender<WatcherCommand>, SessionError> {
        if self.is_stopped() {
            return Err(SessionError::Stopped(self.id.clone()));
        }
        self.commands
            .as_ref()
            .ok_or_else(|| SessionError::NotStarted(self.id.clone()))
    }
}

#[async_trait]
impl Session for Watcher {
    type Event = CounterValue;

    fn id(&self) -> &WatcherId {
        &self.id
    }

    async fn start(&mut self) -> Result<(), SessionError> {
        if self.is_stopped() {
            return Err(SessionError::Stopped(self.id.clone()));
        }
        if self.commands.is_some() {
            return Err(SessionError::AlreadyStarted(self.id.clone()));
        }
        if self.config.tick_interval.is_zero() || self.config.event_buffer == 0 {
            return Err(SessionError::StartFailed {
                id: self.id.clone(),
                reason: "tick interval and event buffer must be non-zero".to_string(),
            });
        }

        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);
        let (event_tx, event_rx) = mpsc::channel(self.config.event_buffer);

        let actor = WatcherActor::new(
            self.id.clone(),
            cmd_rx,
            event_tx,
            self.cancel.clone(),
            self.config.tick_interval,
        );
        tokio::spawn(actor.run());

        self.commands = Some(cmd_tx);
        self.events = Some(event_rx);

        debug!(watcher_id = %self.id, "Watcher started");
        Ok(())
    }

    fn take_events(&mut self) -> Option<mpsc::Receiver<CounterValue>> {
        self.events.take()
    }

    async fn reset_counter(&self) -> Result<(), SessionError> {
        self.sender()?
            .send(WatcherCommand::ResetCounter)
            .await
            .map_err(|_| SessionError::Stopped(self.id.clone()))
    }

    fn stop(&self) {
        if !self.stopped.swap(true, Ordering::AcqRel) {
            self.cancel.cancel();
            debug!(watcher_id = %self.id, "Watcher stopped");
        }
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Creates a [`Watcher`] per connection.
#[derive(Debug, Clone, Default)]
pub struct WatcherFactory {
    config: WatcherConfig,
}

impl WatcherFactory {
    pub fn new(config: WatcherConfig) -> Self {
        Self { config }
    }
}

impl SessionFactory for WatcherFactory {
    type Session = Watcher;

    fn create(&self, id: WatcherId) -> Watcher {
        Watcher::new(id, self.config)
    }
}
