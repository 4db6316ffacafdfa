//! The Ingest Engine: drives a [`ReplicationSource`], normalizes its raw
//! events, and pushes them onto the bounded queue the Dispatcher reads
//! from (spec.md §4.2).
//!
//! Grounded on readyset's `replicators::mysql_connector::connector`
//! `next_action_inner` read-classify-act loop shape, combined with the
//! teacher's `MysqlEventParser::start` sequencing (find start position,
//! then dump) generalized to [`StartFrom`].

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc::Sender;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{SourceTable, StartFrom};
use crate::error::{Result, RiverError};
use crate::event::Event;
use crate::normalize::Normalizer;
use crate::position::PositionStore;
use crate::source::{ReplicationSource, UpstreamPositionSource};

/// The lifecycle states spec.md §4.2 names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    Preparing,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl EngineState {
    fn as_u8(self) -> u8 {
        match self {
            EngineState::Idle => 0,
            EngineState::Preparing => 1,
            EngineState::Running => 2,
            EngineState::Stopping => 3,
            EngineState::Stopped => 4,
            EngineState::Failed => 5,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => EngineState::Idle,
            1 => EngineState::Preparing,
            2 => EngineState::Running,
            3 => EngineState::Stopping,
            4 => EngineState::Stopped,
            _ => EngineState::Failed,
        }
    }
}

/// Observable engine state, shared with the Health Monitor and the
/// top-level [`crate::river::River`] wiring.
#[derive(Debug, Default)]
pub struct EngineStateCell(AtomicU8);

impl EngineStateCell {
    pub fn new(initial: EngineState) -> Self {
        Self(AtomicU8::new(initial.as_u8()))
    }

    pub fn get(&self) -> EngineState {
        EngineState::from_u8(self.0.load(Ordering::SeqCst))
    }

    fn set(&self, state: EngineState) {
        self.0.store(state.as_u8(), Ordering::SeqCst);
    }
}

impl Default for EngineState {
    fn default() -> Self {
        EngineState::Idle
    }
}

/// Drives one [`ReplicationSource`] end to end (spec.md §4.2).
pub struct IngestEngine<S: ReplicationSource> {
    source: S,
    normalizer: Normalizer,
    positions: Arc<PositionStore>,
    state: Arc<EngineStateCell>,
    cancel: CancellationToken,
    server_id: u32,
}

impl<S: ReplicationSource> IngestEngine<S> {
    pub fn new(source: S, positions: Arc<PositionStore>, server_id: u32, cancel: CancellationToken) -> Self {
        Self {
            source,
            normalizer: Normalizer::new(server_id, String::new()),
            positions,
            state: Arc::new(EngineStateCell::new(EngineState::Idle)),
            cancel,
            server_id,
        }
    }

    pub fn state_cell(&self) -> Arc<EngineStateCell> {
        Arc::clone(&self.state)
    }

    /// A shared handle the Health Monitor polls independently of the
    /// engine's own `&mut` loop (spec.md §3).
    pub fn upstream_position_source(&self) -> Arc<dyn UpstreamPositionSource> {
        self.source.upstream_position_source()
    }

    /// Resolve the starting position per `start_from`, verify the
    /// upstream is publishing full row images, prime the table-metadata
    /// cache from `sources` (dump-before-stream, SPEC_FULL.md §3), and
    /// begin streaming.
    pub async fn sync(&mut self, start_from: StartFrom, sources: &[SourceTable]) -> Result<()> {
        self.state.set(EngineState::Preparing);

        let checkpoint = self.positions.current_position().await;
        let start_position = match start_from {
            StartFrom::FromCheckpoint if !checkpoint.is_empty() => checkpoint,
            _ => {
                if start_from == StartFrom::FromCheckpoint {
                    info!("checkpoint is empty, falling back to upstream position");
                }
                self.source.query_upstream_position().await.map_err(|e| {
                    self.state.set(EngineState::Failed);
                    e
                })?
            }
        };

        if let Err(e) = self.source.verify_full_row_image().await {
            self.state.set(EngineState::Failed);
            return Err(RiverError::Configuration(format!(
                "upstream row image verification failed: {e}"
            )));
        }

        if !start_position.log_name.is_empty() {
            self.normalizer = Normalizer::new(self.server_id, start_position.log_name.clone());
        }

        let dumped = self.source.dump_table_metadata(sources).await.map_err(|e| {
            self.state.set(EngineState::Failed);
            e
        })?;
        for table in dumped {
            self.normalizer.metadata_mut().prime(table);
        }

        self.source.start(start_position).await.map_err(|e| {
            self.state.set(EngineState::Failed);
            e
        })?;

        self.state.set(EngineState::Running);
        Ok(())
    }

    /// Read and normalize events, pushing each onto `tx`. Blocks on the
    /// bounded send — this is the backpressure mechanism spec.md §5
    /// describes. Returns when the source is exhausted, the cancellation
    /// token fires, or an unrecoverable error occurs.
    pub async fn run(&mut self, tx: Sender<Event>) -> Result<()> {
        loop {
            if self.cancel.is_cancelled() {
                self.state.set(EngineState::Stopping);
                break;
            }

            let raw = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    self.state.set(EngineState::Stopping);
                    break;
                }
                event = self.source.next_event() => event,
            };

            let raw = match raw {
                Ok(Some(raw)) => raw,
                Ok(None) => break,
                Err(e) => {
                    error!(error = %e, "replication source failed");
                    self.state.set(EngineState::Failed);
                    return Err(e);
                }
            };

            for event in self.normalizer.normalize(raw) {
                if tx.send(event).await.is_err() {
                    warn!("dispatcher channel closed, stopping ingest");
                    self.state.set(EngineState::Stopping);
                    return Ok(());
                }
            }
        }
        self.state.set(EngineState::Stopped);
        Ok(())
    }
}
