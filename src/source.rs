//! The abstract upstream collaborator (spec.md §6 "Upstream (consumed)").
//!
//! The low-level binlog wire protocol is explicitly out of scope
//! (spec.md §1) — the core treats it as an abstract event source. The
//! trait shape below follows the `Connector`/`ReplicationAction` split in
//! readyset's `replicators::mysql_connector::connector` and the
//! `ripel-mysql-cdc` crate (`examples/other_examples/`), both of which
//! separate "read one decoded action" from "query current position".

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::SourceTable;
use crate::error::Result;
use crate::metadata::TableMetadata;
use crate::position::{GtidSet, Position};
use crate::value::RawColumnValue;

/// One decoded replication callback, as the external replication-client
/// library is assumed to deliver it (spec.md §6).
#[derive(Debug, Clone)]
pub enum RawEvent {
    Rotate {
        next_log_name: String,
        next_log_offset: u32,
    },
    Ddl {
        schema: String,
        sql: String,
        log_offset: u32,
    },
    Xid {
        log_offset: u32,
    },
    Gtid {
        gtid_set: GtidSet,
    },
    /// A table's column metadata changed; carries the refreshed metadata.
    TableChanged {
        metadata: TableMetadata,
    },
    /// Insert: one row per logical insert. Update: rows alternate
    /// before/after (spec.md §4.3: "for Update the list has length 2·n
    /// with before/after rows interleaved"). Delete: one row per deleted
    /// record.
    Row {
        schema: String,
        table: String,
        kind: RowEventKind,
        rows: Vec<Vec<RawColumnValue>>,
        log_offset: u32,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowEventKind {
    Insert,
    Update,
    Delete,
}

/// A cheap, independently-pollable handle for the upstream server's
/// current position, held by the Health Monitor alongside the Position
/// Store (spec.md §3: "Health Monitor holds read-only references to...
/// the replication client's 'current upstream position' query"). Kept
/// separate from [`ReplicationSource`] itself since the engine's main
/// loop owns that by `&mut` and the Health Monitor ticks concurrently
/// on its own task.
#[async_trait]
pub trait UpstreamPositionSource: Send + Sync {
    async fn query_upstream_position(&self) -> Result<Position>;
}

/// Abstraction over a connected replication session. An implementation
/// owns the wire protocol, authentication, and table-metadata discovery;
/// River only ever sees decoded [`RawEvent`]s.
///
/// Pull-based (`next_event` rather than a push callback) so the
/// `IngestEngine` can `await` the bounded queue's send between events —
/// this is how backpressure (spec.md §5: "Blocking on a full queue is the
/// intended backpressure") composes with an async channel. Mirrors
/// readyset's `next_action_inner` loop shape.
#[async_trait]
pub trait ReplicationSource: Send {
    /// Verify the upstream is publishing full row images, per spec.md
    /// §4.2 ("Before starting, verifies the upstream is publishing full
    /// row images; if not, fails with `ConfigurationError`").
    async fn verify_full_row_image(&mut self) -> Result<()>;

    /// The upstream server's current position, used by the Health
    /// Monitor (spec.md §4.5).
    async fn query_upstream_position(&mut self) -> Result<Position>;

    /// Scan `INFORMATION_SCHEMA` for every configured source table before
    /// streaming begins, so the first row event for a table already has
    /// column metadata instead of discovering it lazily on first DDL
    /// (dump-before-stream, see SPEC_FULL.md §3). Tables that don't exist
    /// yet are simply absent from the result; the cache is primed lazily
    /// from the first `TableChanged` event instead.
    async fn dump_table_metadata(&mut self, sources: &[SourceTable]) -> Result<Vec<TableMetadata>>;

    /// Obtain a shared handle the Health Monitor can poll independently
    /// of the main replication stream. Called once, before
    /// `IngestEngine::run` starts, and handed to the Health Monitor task.
    fn upstream_position_source(&self) -> Arc<dyn UpstreamPositionSource>;

    /// Begin (or resume) streaming from `from`.
    async fn start(&mut self, from: Position) -> Result<()>;

    /// Fetch the next decoded event, blocking on upstream I/O as needed.
    /// Returns `Ok(None)` when the source is exhausted (used by
    /// `MockReplicationSource`; a live connector never returns `None`).
    async fn next_event(&mut self) -> Result<Option<RawEvent>>;
}

/// An in-process test double / minimal illustrative source: plays back a
/// fixed script of [`RawEvent`]s and reports a fixed upstream position.
/// Also usable as the source for examples that don't need a live MySQL
/// server.
pub struct MockReplicationSource {
    script: std::collections::VecDeque<RawEvent>,
    upstream_position: Position,
    full_row_image: bool,
    dump: Vec<TableMetadata>,
}

impl MockReplicationSource {
    pub fn new(script: Vec<RawEvent>, upstream_position: Position) -> Self {
        Self {
            script: script.into(),
            upstream_position,
            full_row_image: true,
            dump: Vec::new(),
        }
    }

    pub fn without_full_row_image(mut self) -> Self {
        self.full_row_image = false;
        self
    }

    /// Pre-seed the result `dump_table_metadata` returns, as if
    /// `INFORMATION_SCHEMA` already described these tables.
    pub fn with_dump(mut self, dump: Vec<TableMetadata>) -> Self {
        self.dump = dump;
        self
    }
}

#[async_trait]
impl ReplicationSource for MockReplicationSource {
    async fn verify_full_row_image(&mut self) -> Result<()> {
        if self.full_row_image {
            Ok(())
        } else {
            Err(crate::error::RiverError::Configuration(
                "upstream is not publishing full row images".to_string(),
            ))
        }
    }

    async fn query_upstream_position(&mut self) -> Result<Position> {
        Ok(self.upstream_position.clone())
    }

    async fn dump_table_metadata(&mut self, _sources: &[SourceTable]) -> Result<Vec<TableMetadata>> {
        Ok(self.dump.clone())
    }

    fn upstream_position_source(&self) -> Arc<dyn UpstreamPositionSource> {
        Arc::new(MockUpstreamPositionSource {
            position: self.upstream_position.clone(),
        })
    }

    async fn start(&mut self, _from: Position) -> Result<()> {
        Ok(())
    }

    async fn next_event(&mut self) -> Result<Option<RawEvent>> {
        Ok(self.script.pop_front())
    }
}

/// The Health Monitor's view of [`MockReplicationSource`]: reports the
/// same fixed upstream position the mock was built with.
struct MockUpstreamPositionSource {
    position: Position,
}

#[async_trait]
impl UpstreamPositionSource for MockUpstreamPositionSource {
    async fn query_upstream_position(&self) -> Result<Position> {
        Ok(self.position.clone())
    }
}
