//! The normalized event record (spec.md §3) produced by the Normalizer
//! and consumed by Sinks.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::position::GtidSet;
use crate::value::ColumnValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    Insert,
    Update,
    Delete,
    Ddl,
    Gtid,
    Xid,
    Rotate,
    TableChanged,
}

pub type Row = BTreeMap<String, ColumnValue>;

/// The normalized record produced by the Normalizer and consumed by
/// Sinks (spec.md §3). Every field that is not populated for a given
/// `kind` is left at its default (empty string / empty map).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub kind: EventKind,
    pub server_id: u32,
    pub log_name: String,
    pub log_offset: u32,
    #[serde(default)]
    pub schema: String,
    #[serde(default)]
    pub table: String,
    #[serde(default)]
    pub sql: String,
    #[serde(default)]
    pub gtid_set: GtidSet,
    #[serde(default)]
    pub primary_key: Vec<String>,
    #[serde(default)]
    pub before: Row,
    #[serde(default)]
    pub after: Row,
    /// Seconds, populated for events with a header.
    #[serde(default)]
    pub timestamp: u32,
}

impl Event {
    pub fn new(kind: EventKind, server_id: u32, log_name: impl Into<String>, log_offset: u32) -> Self {
        Self {
            kind,
            server_id,
            log_name: log_name.into(),
            log_offset,
            schema: String::new(),
            table: String::new(),
            sql: String::new(),
            gtid_set: String::new(),
            primary_key: Vec::new(),
            before: Row::new(),
            after: Row::new(),
            timestamp: 0,
        }
    }

    /// Invariant #1/#2 (spec.md §8): for Update, before/after share the
    /// table's column-key set; primary_key is a non-empty subset of
    /// `before ∪ after`'s keys whenever the table has a primary key.
    pub fn check_row_invariants(&self) -> bool {
        match self.kind {
            EventKind::Insert => self.before.is_empty(),
            EventKind::Delete => self.after.is_empty(),
            EventKind::Update => {
                let before_keys: std::collections::BTreeSet<_> = self.before.keys().collect();
                let after_keys: std::collections::BTreeSet<_> = self.after.keys().collect();
                before_keys == after_keys
            }
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_has_no_before_image() {
        let mut e = Event::new(EventKind::Insert, 1, "bin.000001", 10);
        e.after.insert("id".to_string(), ColumnValue::Int(7));
        assert!(e.check_row_invariants());
    }

    #[test]
    fn update_requires_matching_key_sets() {
        let mut e = Event::new(EventKind::Update, 1, "bin.000001", 10);
        e.before.insert("id".to_string(), ColumnValue::Int(7));
        e.after.insert("id".to_string(), ColumnValue::Int(7));
        e.after.insert("name".to_string(), ColumnValue::String("y".into()));
        assert!(!e.check_row_invariants());
        e.before.insert("name".to_string(), ColumnValue::String("x".into()));
        assert!(e.check_row_invariants());
    }

    #[test]
    fn event_serializes_losslessly() {
        let mut e = Event::new(EventKind::Update, 42, "bin.000003", 99);
        e.schema = "db".into();
        e.table = "t".into();
        e.primary_key = vec!["id".into()];
        e.before.insert("id".into(), ColumnValue::Int(7));
        e.after.insert("id".into(), ColumnValue::Int(7));
        let json = serde_json::to_string(&e).unwrap();
        let round_tripped: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(e, round_tripped);
    }
}
