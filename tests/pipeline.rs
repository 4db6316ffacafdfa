//! End-to-end scenarios from spec.md §8, driven against
//! `MockReplicationSource` and a recording test sink.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use river::config::{RiverConfig, StartFrom};
use river::error::{Result, RiverError};
use river::event::{Event, EventKind};
use river::health::HealthSnapshot;
use river::metadata::{ColumnKind, ColumnMetadata, TableMetadata};
use river::position::Position;
use river::sink::Sink;
use river::source::{MockReplicationSource, RawEvent, RowEventKind};
use river::value::RawColumnValue;
use river::River;

#[derive(Default)]
struct RecordingSink {
    events: Mutex<Vec<Event>>,
    alerts: Mutex<Vec<HealthSnapshot>>,
}

#[async_trait]
impl Sink for RecordingSink {
    async fn on_event(&self, event: Event) -> Result<()> {
        self.events.lock().unwrap().push(event);
        Ok(())
    }

    async fn on_alert(&self, snapshot: HealthSnapshot) -> Result<()> {
        self.alerts.lock().unwrap().push(snapshot);
        Ok(())
    }

    async fn on_close(&self, _err: Option<&RiverError>) {}
}

fn sample_table() -> TableMetadata {
    let mut table = TableMetadata::new("shop", "t");
    table.columns.push(ColumnMetadata::new("id", ColumnKind::Other).primary_key());
    table.columns.push(ColumnMetadata::new("name", ColumnKind::Other));
    table
}

#[tokio::test]
async fn insert_event_has_expected_shape() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = RiverConfig::default();
    config.data_dir = dir.path().to_path_buf();
    config.start_from = StartFrom::FromUpstream;

    let script = vec![
        RawEvent::TableChanged { metadata: sample_table() },
        RawEvent::Row {
            schema: "shop".into(),
            table: "t".into(),
            kind: RowEventKind::Insert,
            rows: vec![vec![RawColumnValue::Int(7), RawColumnValue::Bytes(b"x".to_vec())]],
            log_offset: 10,
        },
    ];
    let source = MockReplicationSource::new(script, Position::new("bin.000001", 0));

    let sink = Arc::new(RecordingSink::default());
    let mut river = River::new(config, source, CloneableSink(Arc::clone(&sink))).await.unwrap();
    river.run().await.unwrap();

    let events = sink.events.lock().unwrap();
    let insert = events.iter().find(|e| e.kind == EventKind::Insert).expect("insert event");
    assert_eq!(insert.schema, "shop");
    assert_eq!(insert.table, "t");
    assert_eq!(insert.primary_key, vec!["id".to_string()]);
    assert!(insert.before.is_empty());
    assert_eq!(insert.after.len(), 2);
}

#[tokio::test]
async fn update_then_delete_preserve_before_after_images() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = RiverConfig::default();
    config.data_dir = dir.path().to_path_buf();
    config.start_from = StartFrom::FromUpstream;

    let script = vec![
        RawEvent::TableChanged { metadata: sample_table() },
        RawEvent::Row {
            schema: "shop".into(),
            table: "t".into(),
            kind: RowEventKind::Update,
            rows: vec![
                vec![RawColumnValue::Int(7), RawColumnValue::Bytes(b"x".to_vec())],
                vec![RawColumnValue::Int(7), RawColumnValue::Bytes(b"y".to_vec())],
            ],
            log_offset: 20,
        },
        RawEvent::Row {
            schema: "shop".into(),
            table: "t".into(),
            kind: RowEventKind::Delete,
            rows: vec![vec![RawColumnValue::Int(7), RawColumnValue::Bytes(b"y".to_vec())]],
            log_offset: 30,
        },
    ];
    let source = MockReplicationSource::new(script, Position::new("bin.000001", 0));
    let sink = Arc::new(RecordingSink::default());
    let mut river = River::new(config, source, CloneableSink(Arc::clone(&sink))).await.unwrap();
    river.run().await.unwrap();

    let events = sink.events.lock().unwrap();
    let update = events.iter().find(|e| e.kind == EventKind::Update).unwrap();
    assert!(update.check_row_invariants());
    let delete = events.iter().find(|e| e.kind == EventKind::Delete).unwrap();
    assert!(delete.after.is_empty());
    assert!(!delete.before.is_empty());
}

#[tokio::test]
async fn rotate_and_xid_force_a_checkpoint_that_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = RiverConfig::default();
    config.data_dir = dir.path().to_path_buf();
    config.save_interval = Duration::from_secs(60);
    config.start_from = StartFrom::FromUpstream;

    let script = vec![
        RawEvent::Rotate { next_log_name: "bin.000002".into(), next_log_offset: 4 },
        RawEvent::Xid { log_offset: 50 },
    ];
    let source = MockReplicationSource::new(script, Position::new("bin.000001", 0));
    let sink = Arc::new(RecordingSink::default());
    let mut river = River::new(config.clone(), source, CloneableSink(Arc::clone(&sink))).await.unwrap();
    river.run().await.unwrap();

    // Rotate forces an immediate save; restart picks it up from the
    // checkpoint.
    config.start_from = StartFrom::FromCheckpoint;
    let source2 = MockReplicationSource::new(Vec::new(), Position::new("bin.000002", 4));
    let sink2 = Arc::new(RecordingSink::default());
    let mut river2 = River::new(config, source2, CloneableSink(sink2)).await.unwrap();
    let state_before = river2.engine_state().get();
    river2.run().await.unwrap();
    assert_ne!(state_before, river2.engine_state().get());
}

/// `River` owns its `Sink` by value (not `Arc`), so tests that want to
/// inspect sink state afterward wrap a shared `Arc<RecordingSink>` in a
/// thin `Sink` forwarder.
struct CloneableSink(Arc<RecordingSink>);

#[async_trait]
impl Sink for CloneableSink {
    async fn on_event(&self, event: Event) -> Result<()> {
        self.0.on_event(event).await
    }

    async fn on_alert(&self, snapshot: HealthSnapshot) -> Result<()> {
        self.0.on_alert(snapshot).await
    }

    async fn on_close(&self, err: Option<&RiverError>) {
        self.0.on_close(err).await
    }
}
