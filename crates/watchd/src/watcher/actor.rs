//! Watcher actor - owns the counter and produces updates.
//!
//! The actor runs on its own task. It ticks at a fixed interval, emitting a
//! [`CounterValue`] per tick, and processes [`WatcherCommand`]s between
//! ticks. Cancellation ends the task, which drops the event sender and
//! thereby ends the consumer's event sequence.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use watch_core::{CounterValue, WatcherId};

use super::commands::{WatcherCommand, WatcherSnapshot};

pub(crate) struct WatcherActor {
    id: WatcherId,
    commands: mpsc::Receiver<WatcherCommand>,
    events: mpsc::Sender<CounterValue>,
    cancel: CancellationToken,
    tick_interval: Duration,
    iteration: u64,
    value: u64,
    resets: u64,
}

impl WatcherActor {
    pub(crate) fn new(
        id: WatcherId,
        commands: mpsc::Receiver<WatcherCommand>,
        events: mpsc::Sender<CounterValue>,
        cancel: CancellationToken,
        tick_interval: Duration,
    ) -> Self {
        Self {
            id,
            commands,
            events,
            cancel,
            tick_interval,
            iteration: 0,
            value: 0,
            resets: 0,
        }
    }

    pub(crate) async fn run(mut self) {
        debug!(watcher_id = %self.id, "Watcher actor starting");

        let mut ticker = interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; skip it so updates start one
        // interval after start.
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => break,

                Some(cmd) = self.commands.recv() => self.handle_command(cmd),

                _ = ticker.tick() => {
                    if !self.emit().await {
                        break;
                    }
                }
            }
        }

        debug!(
            watcher_id = %self.id,
            iteration = self.iteration,
            "Watcher actor stopped"
        );
    }

    fn handle_command(&mut self, cmd: WatcherCommand) {
        match cmd {
            WatcherCommand::ResetCounter => {
                self.value = 0;
                self.resets += 1;
                debug!(watcher_id = %self.id, resets = self.resets, "Counter reset");
            }
            WatcherCommand::GetSnapshot { respond_to } => {
                // Ignore send error - requester may have given up
                let _ = respond_to.send(self.snapshot());
            }
        }
    }

    /// Produces the next update. Returns `false` once the actor should stop.
    async fn emit(&mut self) -> bool {
        self.iteration += 1;
        self.value += 1;
        let update = CounterValue::new(self.id.clone(), self.iteration, self.value);

        trace!(
            watcher_id = %self.id,
            iteration = self.iteration,
            value = self.value,
            "Emitting counter update"
        );

        tokio::select! {
            biased;

            _ = self.cancel.cancelled() => false,

            sent = self.events.send(update) => {
                if sent.is_err() {
                    debug!(watcher_id = %self.id, "Event receiver dropped");
                }
                sent.is_ok()
            }
        }
    }

    fn snapshot(&self) -> WatcherSnapshot {
        WatcherSnapshot {
            watcher_id: self.id.clone(),
            iteration: self.iteration,
            value: self.value,
            resets: self.resets,
        }
    }
}
