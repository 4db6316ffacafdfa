//! Pure-ish function from a raw replication event to a normalized
//! [`Event`] (spec.md §4.3). "Pure-ish" because it owns the running
//! state spec.md §4.3 describes: the current log file name (advanced by
//! Rotate), the current GTID (advanced by Gtid events), and the table
//! metadata cache DDL/table-changed events refresh.
//!
//! Grounded on `akkw-mini-canal`'s `MysqlEventParser`
//! (`log::convert`/`running.rs`), which plays the same role: turn a
//! decoded wire event into the domain event type, consulting a
//! metadata cache for column interpretation.

use tracing::warn;

use crate::event::{Event, EventKind};
use crate::metadata::TableMetadataCache;
use crate::source::{RawEvent, RowEventKind};
use crate::value::decode_column_value;

#[derive(Debug)]
pub struct Normalizer {
    current_log_name: String,
    current_gtid_set: String,
    server_id: u32,
    metadata: TableMetadataCache,
}

impl Normalizer {
    pub fn new(server_id: u32, initial_log_name: impl Into<String>) -> Self {
        Self {
            current_log_name: initial_log_name.into(),
            current_gtid_set: String::new(),
            server_id,
            metadata: TableMetadataCache::new(),
        }
    }

    pub fn current_log_name(&self) -> &str {
        &self.current_log_name
    }

    pub fn current_gtid_set(&self) -> &str {
        &self.current_gtid_set
    }

    pub fn metadata(&self) -> &TableMetadataCache {
        &self.metadata
    }

    pub fn metadata_mut(&mut self) -> &mut TableMetadataCache {
        &mut self.metadata
    }

    /// Convert one raw replication callback into zero or more normalized
    /// events. A Row event against a table with no cached metadata is
    /// dropped with a warning — the caller is expected to have primed the
    /// cache via a `TableChanged` event or the initial dump before any
    /// Row event for that table is delivered.
    pub fn normalize(&mut self, raw: RawEvent) -> Vec<Event> {
        match raw {
            RawEvent::Rotate {
                next_log_name,
                next_log_offset,
            } => {
                let event = Event::new(EventKind::Rotate, self.server_id, next_log_name.clone(), next_log_offset);
                self.current_log_name = next_log_name;
                vec![event]
            }

            RawEvent::Ddl { schema, sql, log_offset } => {
                let mut event = Event::new(EventKind::Ddl, self.server_id, self.current_log_name.clone(), log_offset);
                event.schema = schema;
                event.sql = sql;
                event.gtid_set = self.current_gtid_set.clone();
                vec![event]
            }

            RawEvent::Xid { log_offset } => {
                vec![Event::new(EventKind::Xid, self.server_id, self.current_log_name.clone(), log_offset)]
            }

            RawEvent::Gtid { gtid_set } => {
                self.current_gtid_set = gtid_set.clone();
                let mut event = Event::new(EventKind::Gtid, self.server_id, self.current_log_name.clone(), 0);
                event.gtid_set = gtid_set;
                vec![event]
            }

            RawEvent::TableChanged { metadata } => {
                let mut event = Event::new(EventKind::TableChanged, self.server_id, self.current_log_name.clone(), 0);
                event.schema = metadata.schema.clone();
                event.table = metadata.table.clone();
                self.metadata.prime(metadata);
                vec![event]
            }

            RawEvent::Row {
                schema,
                table,
                kind,
                rows,
                log_offset,
            } => self.normalize_row(schema, table, kind, rows, log_offset),
        }
    }

    fn normalize_row(
        &mut self,
        schema: String,
        table: String,
        kind: RowEventKind,
        rows: Vec<Vec<crate::value::RawColumnValue>>,
        log_offset: u32,
    ) -> Vec<Event> {
        let Some(meta) = self.metadata.get(&schema, &table) else {
            warn!(schema, table, "row event for table with no cached metadata, dropping");
            return Vec::new();
        };
        let primary_key = meta.primary_key_columns();
        let event_kind = match kind {
            RowEventKind::Insert => EventKind::Insert,
            RowEventKind::Update => EventKind::Update,
            RowEventKind::Delete => EventKind::Delete,
        };

        let decode_row = |values: &[crate::value::RawColumnValue]| -> crate::event::Row {
            let mut row = crate::event::Row::new();
            for (i, raw) in values.iter().cloned().enumerate() {
                let Some(col) = meta.column_at(i) else { continue };
                row.insert(col.name.clone(), decode_column_value(raw, col));
            }
            row
        };

        let mut events = Vec::new();
        match event_kind {
            EventKind::Update => {
                // Spec.md §4.3: rows alternate before/after, length 2·n.
                let mut iter = rows.chunks_exact(2);
                for pair in &mut iter {
                    let mut event = Event::new(EventKind::Update, self.server_id, self.current_log_name.clone(), log_offset);
                    event.schema = schema.clone();
                    event.table = table.clone();
                    event.primary_key = primary_key.clone();
                    event.before = decode_row(&pair[0]);
                    event.after = decode_row(&pair[1]);
                    events.push(event);
                }
                if !iter.remainder().is_empty() {
                    warn!(schema, table, "update row event had odd row count, dropping trailing row");
                }
            }
            EventKind::Insert => {
                for values in &rows {
                    let mut event = Event::new(EventKind::Insert, self.server_id, self.current_log_name.clone(), log_offset);
                    event.schema = schema.clone();
                    event.table = table.clone();
                    event.primary_key = primary_key.clone();
                    event.after = decode_row(values);
                    events.push(event);
                }
            }
            EventKind::Delete => {
                for values in &rows {
                    let mut event = Event::new(EventKind::Delete, self.server_id, self.current_log_name.clone(), log_offset);
                    event.schema = schema.clone();
                    event.table = table.clone();
                    event.primary_key = primary_key.clone();
                    event.before = decode_row(values);
                    events.push(event);
                }
            }
            _ => unreachable!("row events only produce Insert/Update/Delete"),
        }
        events
    }
}
