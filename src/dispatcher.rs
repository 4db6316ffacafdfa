//! Dispatcher: the single-threaded consumer that pulls normalized events
//! off the bounded queue, delivers them to the active Sink, and
//! periodically checkpoints (spec.md §4.4).
//!
//! Grounded on spec.md §4.4/§5 directly; the `tokio::select!` loop over
//! dequeue/timer/cancellation is the idiomatic shape the retrieval pack's
//! async connectors and sinks use throughout (rosetta dlq wrapper,
//! chem-core engine).

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::Receiver;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::error::Result;
use crate::event::{Event, EventKind};
use crate::position::{Position, PositionStore};
use crate::sink::Sink;

/// Pulls events, delivers them to `sink`, and checkpoints through
/// `positions` per spec.md §4.4's policy table.
pub struct Dispatcher<S: Sink> {
    positions: Arc<PositionStore>,
    sink: Arc<S>,
    save_interval: Duration,
    cancel: CancellationToken,
    tracked_position: Position,
    tracked_gtid_set: String,
}

impl<S: Sink> Dispatcher<S> {
    pub fn new(positions: Arc<PositionStore>, sink: Arc<S>, save_interval: Duration, cancel: CancellationToken) -> Self {
        Self {
            positions,
            sink,
            save_interval,
            cancel,
            tracked_position: Position::empty(),
            tracked_gtid_set: String::new(),
        }
    }

    /// Run the dispatch loop until the channel closes or the
    /// cancellation token fires. On a Sink error, closes the engine by
    /// returning the error to the caller, which is expected to drive
    /// `close(err)`.
    pub async fn run(&mut self, mut rx: Receiver<Event>) -> Result<()> {
        let mut ticker = interval(self.save_interval);
        ticker.tick().await; // first tick fires immediately; discard it

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    info!("dispatcher cancelled, exiting");
                    return Ok(());
                }
                maybe_event = rx.recv() => {
                    match maybe_event {
                        Some(event) => {
                            if let Err(e) = self.dispatch(event).await {
                                error!(error = %e, "sink rejected event, closing");
                                return Err(e);
                            }
                        }
                        None => {
                            info!("event queue closed, exiting");
                            return Ok(());
                        }
                    }
                }
                _ = ticker.tick() => {
                    if self.tracked_position.is_empty() {
                        continue;
                    }
                    if let Err(e) = self
                        .positions
                        .save(&self.tracked_position.log_name, self.tracked_position.log_offset, &self.tracked_gtid_set, true)
                        .await
                    {
                        error!(error = %e, "periodic checkpoint save failed");
                        return Err(e);
                    }
                }
            }
        }
    }

    /// Deliver one event to the Sink and apply spec.md §4.4's checkpoint
    /// policy.
    async fn dispatch(&mut self, event: Event) -> Result<()> {
        let kind = event.kind;
        let log_name = event.log_name.clone();
        let log_offset = event.log_offset;
        let gtid_set = event.gtid_set.clone();

        self.sink.on_event(event).await?;

        match kind {
            EventKind::Rotate | EventKind::Ddl => {
                self.tracked_position = Position::new(log_name.clone(), log_offset);
                self.positions.save(&log_name, log_offset, &self.tracked_gtid_set, true).await?;
            }
            EventKind::Insert | EventKind::Update | EventKind::Delete | EventKind::Xid | EventKind::TableChanged => {
                self.tracked_position = Position::new(log_name, log_offset);
            }
            EventKind::Gtid => {
                self.tracked_gtid_set = gtid_set;
            }
        }
        Ok(())
    }
}
