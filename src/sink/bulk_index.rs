//! Bulk Index Sink (spec.md §4.6.1): buffers row events and submits them
//! as bulk index/update/delete requests to an external search index.
//!
//! Grounded on the teacher's `table_meta_cache` refresh-on-DDL pattern
//! for rule metadata refresh, and the rosetta dlq wrapper's retry/backoff
//! loop shape (`examples/other_examples/...dlq-wrapper.rs`) for the
//! 10x/1-minute bulk-request retry.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::error::{Result, RiverError};
use crate::event::{Event, EventKind};
use crate::health::{HealthSnapshot, HealthStatus};
use crate::sink::Sink;
use crate::value::ColumnValue;

const MAX_RETRIES: u32 = 10;
const RETRY_DELAY: Duration = Duration::from_secs(60);

/// How a document's id is derived from a row (spec.md §3 Rule).
#[derive(Debug, Clone)]
pub enum DocumentIdStrategy {
    /// Concatenate these explicit column values with ":".
    Columns(Vec<String>),
    /// Concatenate the table's primary-key column values with ":".
    PrimaryKey,
}

/// A mapping (sourceSchema, sourceTable) → (targetIndex, ...) (spec.md
/// §3).
#[derive(Debug, Clone)]
pub struct Rule {
    pub source_schema: String,
    pub source_table: String,
    pub target_index: String,
    pub document_id: DocumentIdStrategy,
    pub field_renames: HashMap<String, String>,
    pub field_filter: Option<Vec<String>>,
}

impl Rule {
    fn key(&self) -> String {
        format!("{}.{}", self.source_schema, self.source_table)
    }

    fn resolve_id(&self, row: &crate::event::Row, primary_key: &[String]) -> std::result::Result<String, RiverError> {
        let columns: &[String] = match &self.document_id {
            DocumentIdStrategy::Columns(cols) => cols,
            DocumentIdStrategy::PrimaryKey => primary_key,
        };
        let mut parts = Vec::with_capacity(columns.len());
        for col in columns {
            match row.get(col) {
                Some(v) if !v.is_null() => parts.push(render_value(v)),
                _ => return Err(RiverError::Mapping(format!("document id column '{col}' is null or missing"))),
            }
        }
        Ok(parts.join(":"))
    }

    fn project(&self, row: &crate::event::Row) -> serde_json::Map<String, serde_json::Value> {
        let mut document = serde_json::Map::new();
        for (column, value) in row {
            if let Some(filter) = &self.field_filter {
                if !filter.contains(column) {
                    continue;
                }
            }
            let field_name = self.field_renames.get(column).cloned().unwrap_or_else(|| column.clone());
            document.insert(field_name, column_value_to_json(value));
        }
        document
    }
}

fn render_value(value: &ColumnValue) -> String {
    match value {
        ColumnValue::Null => String::new(),
        ColumnValue::Int(i) => i.to_string(),
        ColumnValue::UInt(u) => u.to_string(),
        ColumnValue::Float(f) => f.to_string(),
        ColumnValue::Decimal(d) => d.clone(),
        ColumnValue::String(s) => s.clone(),
        ColumnValue::Bytes(b) => String::from_utf8_lossy(b).into_owned(),
        ColumnValue::Json(j) => j.to_string(),
    }
}

fn column_value_to_json(value: &ColumnValue) -> serde_json::Value {
    match value {
        ColumnValue::Null => serde_json::Value::Null,
        ColumnValue::Int(i) => serde_json::json!(i),
        ColumnValue::UInt(u) => serde_json::json!(u),
        ColumnValue::Float(f) => serde_json::json!(f),
        ColumnValue::Decimal(d) => serde_json::Value::String(d.clone()),
        ColumnValue::String(s) => serde_json::Value::String(s.clone()),
        ColumnValue::Bytes(b) => serde_json::Value::String(String::from_utf8_lossy(b).into_owned()),
        ColumnValue::Json(j) => j.clone(),
    }
}

/// One operation in a bulk request.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "action")]
pub enum BulkOperation {
    Index {
        index: String,
        id: String,
        document: serde_json::Map<String, serde_json::Value>,
    },
    Delete {
        index: String,
        id: String,
    },
}

/// The out-of-scope transport (spec.md §1) behind a trait so the sink's
/// batching/rule logic is testable without a live index.
#[async_trait]
pub trait BulkIndexClient: Send + Sync {
    async fn submit(&self, operations: &[BulkOperation]) -> Result<()>;
}

/// `reqwest`-based [`BulkIndexClient`] that POSTs a newline-delimited
/// bulk body, in the shape Elasticsearch/OpenSearch's `_bulk` endpoint
/// expects.
pub struct HttpBulkIndexClient {
    client: reqwest::Client,
    bulk_url: String,
}

impl HttpBulkIndexClient {
    pub fn new(bulk_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            bulk_url: bulk_url.into(),
        }
    }
}

#[async_trait]
impl BulkIndexClient for HttpBulkIndexClient {
    async fn submit(&self, operations: &[BulkOperation]) -> Result<()> {
        let mut body = String::new();
        for op in operations {
            match op {
                BulkOperation::Index { index, id, document } => {
                    body.push_str(&serde_json::json!({"index": {"_index": index, "_id": id}}).to_string());
                    body.push('\n');
                    body.push_str(&serde_json::Value::Object(document.clone()).to_string());
                    body.push('\n');
                }
                BulkOperation::Delete { index, id } => {
                    body.push_str(&serde_json::json!({"delete": {"_index": index, "_id": id}}).to_string());
                    body.push('\n');
                }
            }
        }

        let response = self
            .client
            .post(&self.bulk_url)
            .header("Content-Type", "application/x-ndjson")
            .body(body)
            .send()
            .await
            .map_err(|e| RiverError::Sink(format!("bulk request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(RiverError::Sink(format!("bulk request returned status {}", response.status())));
        }

        let payload: serde_json::Value = response
            .json()
            .await
            .map_err(|e| RiverError::Sink(format!("failed to decode bulk response: {e}")))?;
        log_per_item_errors(&payload);
        Ok(())
    }
}

/// Per-item failures inside an otherwise successful bulk response are
/// logged but never fail the batch (spec.md §4.6.1).
fn log_per_item_errors(payload: &serde_json::Value) {
    let Some(items) = payload.get("items").and_then(|v| v.as_array()) else {
        return;
    };
    for item in items {
        if let Some(obj) = item.as_object() {
            for (action, detail) in obj {
                if let Some(error) = detail.get("error") {
                    warn!(action, %error, "bulk item failed");
                }
            }
        }
    }
}

struct Buffer {
    operations: Vec<BulkOperation>,
}

/// Buffers up to `bulk_size` operations or `flush_interval`, whichever
/// comes first, then submits one bulk request (spec.md §4.6.1).
pub struct BulkIndexSink<C: BulkIndexClient> {
    client: C,
    rules: HashMap<String, Rule>,
    buffer: Mutex<Buffer>,
    bulk_size: usize,
    flush_interval: Duration,
    health_info_path: Option<std::path::PathBuf>,
    skip_no_pk_table: bool,
}

impl<C: BulkIndexClient> BulkIndexSink<C> {
    pub fn new(client: C, rules: Vec<Rule>, bulk_size: usize, flush_interval: Duration) -> Self {
        Self {
            client,
            rules: rules.into_iter().map(|r| (r.key(), r)).collect(),
            buffer: Mutex::new(Buffer { operations: Vec::new() }),
            bulk_size: bulk_size.max(1),
            flush_interval: flush_interval.max(Duration::from_secs(1)),
            health_info_path: None,
            skip_no_pk_table: false,
        }
    }

    pub fn with_health_info_path(mut self, path: std::path::PathBuf) -> Self {
        self.health_info_path = Some(path);
        self
    }

    /// When set, rows from a table with no primary key whose rule derives
    /// the document id from the primary key (spec.md §6 `skipNoPkTable`)
    /// are dropped instead of being indexed under an empty id.
    pub fn with_skip_no_pk_table(mut self, skip: bool) -> Self {
        self.skip_no_pk_table = skip;
        self
    }

    async fn queue(&self, ops: Vec<BulkOperation>) -> Result<()> {
        let should_flush = {
            let mut buffer = self.buffer.lock().await;
            buffer.operations.extend(ops);
            buffer.operations.len() >= self.bulk_size
        };
        if should_flush {
            self.flush().await?;
        }
        Ok(())
    }

    /// Submit the buffered batch, retrying up to 10 times with 1 minute
    /// between attempts on failure (spec.md §4.6.1).
    pub async fn flush(&self) -> Result<()> {
        let batch = {
            let mut buffer = self.buffer.lock().await;
            if buffer.operations.is_empty() {
                return Ok(());
            }
            std::mem::take(&mut buffer.operations)
        };

        let mut attempt = 0;
        loop {
            match self.client.submit(&batch).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < MAX_RETRIES => {
                    attempt += 1;
                    error!(attempt, error = %e, "bulk request failed, retrying");
                    sleep(RETRY_DELAY).await;
                }
                Err(e) => return Err(RiverError::Sink(format!("bulk request failed after {MAX_RETRIES} retries: {e}"))),
            }
        }
    }

    async fn handle_row_event(&self, event: &Event, rule: &Rule) -> Result<Vec<BulkOperation>> {
        match event.kind {
            EventKind::Insert => {
                let id = rule.resolve_id(&event.after, &event.primary_key)?;
                Ok(vec![BulkOperation::Index {
                    index: rule.target_index.clone(),
                    id,
                    document: rule.project(&event.after),
                }])
            }
            EventKind::Delete => {
                let id = rule.resolve_id(&event.before, &event.primary_key)?;
                Ok(vec![BulkOperation::Delete {
                    index: rule.target_index.clone(),
                    id,
                }])
            }
            EventKind::Update => {
                let old_id = rule.resolve_id(&event.before, &event.primary_key)?;
                let new_id = rule.resolve_id(&event.after, &event.primary_key)?;
                if old_id == new_id {
                    Ok(vec![BulkOperation::Index {
                        index: rule.target_index.clone(),
                        id: new_id,
                        document: rule.project(&event.after),
                    }])
                } else {
                    // Id changed: delete old, then index new, same batch
                    // (spec.md §4.6.1, §8 scenario 7).
                    Ok(vec![
                        BulkOperation::Delete {
                            index: rule.target_index.clone(),
                            id: old_id,
                        },
                        BulkOperation::Index {
                            index: rule.target_index.clone(),
                            id: new_id,
                            document: rule.project(&event.after),
                        },
                    ])
                }
            }
            _ => Ok(Vec::new()),
        }
    }

    /// Periodically flushes the buffer so operations are never held past
    /// `flush_interval`, independent of `bulk_size` (spec.md §4.6.1's
    /// "whichever comes first"; spec.md §5 requires the bulk sink to run
    /// this as its own task). Callers spawn this alongside the sink and
    /// cancel `cancel` to stop it.
    pub async fn run_periodic_flush(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.flush_interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {
                    if let Err(e) = self.flush().await {
                        error!(error = %e, "periodic flush failed");
                    }
                }
            }
        }
    }

    async fn write_health_info(&self, snapshot: &HealthSnapshot) -> Result<()> {
        let Some(path) = &self.health_info_path else { return Ok(()) };
        let body = serde_json::json!({
            "status": format!("{:?}", snapshot.status),
            "reasons": snapshot.reasons,
        })
        .to_string();
        let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
        let mut tmp = tokio::task::spawn_blocking({
            let dir = dir.to_path_buf();
            move || tempfile::NamedTempFile::new_in(dir)
        })
        .await
        .map_err(|e| RiverError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))??;
        use std::io::Write;
        tmp.write_all(body.as_bytes())?;
        tmp.flush()?;
        let path = path.clone();
        tokio::task::spawn_blocking(move || tmp.persist(path))
            .await
            .map_err(|e| RiverError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?
            .map_err(|e| RiverError::Io(e.error))?;
        Ok(())
    }
}

#[async_trait]
impl<C: BulkIndexClient> Sink for BulkIndexSink<C> {
    async fn on_event(&self, event: Event) -> Result<()> {
        match event.kind {
            EventKind::Ddl | EventKind::TableChanged => {
                // Rules are keyed by (schema, table), not by column
                // metadata, so there is nothing to refresh here beyond
                // noting the change; document ids/fields come from the
                // already-normalized row in each subsequent event.
                tracing::debug!(schema = %event.schema, table = %event.table, "table structure changed");
                return Ok(());
            }
            EventKind::Insert | EventKind::Update | EventKind::Delete => {}
            _ => return Ok(()),
        }

        let Some(rule) = self.rules.get(&format!("{}.{}", event.schema, event.table)) else {
            return Ok(());
        };

        if self.skip_no_pk_table
            && matches!(rule.document_id, DocumentIdStrategy::PrimaryKey)
            && event.primary_key.is_empty()
        {
            warn!(schema = %event.schema, table = %event.table, "skipping row from table with no primary key");
            return Ok(());
        }

        match self.handle_row_event(&event, rule).await {
            Ok(ops) if ops.is_empty() => Ok(()),
            Ok(ops) => self.queue(ops).await,
            Err(RiverError::Mapping(msg)) => {
                warn!(schema = %event.schema, table = %event.table, error = %msg, "dropping event with unusable document id");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn on_alert(&self, snapshot: HealthSnapshot) -> Result<()> {
        if snapshot.status == HealthStatus::Red {
            self.write_health_info(&snapshot).await?;
        }
        Ok(())
    }

    async fn on_close(&self, _err: Option<&RiverError>) {
        if let Err(e) = self.flush().await {
            error!(error = %e, "final flush on close failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct RecordingClient {
        batches: Mutex<Vec<Vec<BulkOperation>>>,
        fail_times: AtomicUsize,
    }

    impl RecordingClient {
        fn new() -> Self {
            Self {
                batches: Mutex::new(Vec::new()),
                fail_times: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl BulkIndexClient for RecordingClient {
        async fn submit(&self, operations: &[BulkOperation]) -> Result<()> {
            if self.fail_times.load(Ordering::SeqCst) > 0 {
                self.fail_times.fetch_sub(1, Ordering::SeqCst);
                return Err(RiverError::Sink("simulated failure".to_string()));
            }
            self.batches.lock().await.push(operations.to_vec());
            Ok(())
        }
    }

    fn rule() -> Rule {
        Rule {
            source_schema: "db".into(),
            source_table: "t".into(),
            target_index: "t-index".into(),
            document_id: DocumentIdStrategy::PrimaryKey,
            field_renames: HashMap::new(),
            field_filter: None,
        }
    }

    fn sink(bulk_size: usize) -> BulkIndexSink<RecordingClient> {
        BulkIndexSink::new(RecordingClient::new(), vec![rule()], bulk_size, Duration::from_secs(60))
    }

    #[tokio::test]
    async fn insert_without_matching_rule_is_dropped() {
        let sink = BulkIndexSink::new(RecordingClient::new(), Vec::new(), 1, Duration::from_secs(60));
        let mut event = Event::new(EventKind::Insert, 1, "bin.000001", 1);
        event.schema = "db".into();
        event.table = "unmapped".into();
        sink.on_event(event).await.unwrap();
        assert!(sink.client.batches.lock().await.is_empty());
    }

    #[tokio::test]
    async fn insert_flushes_once_bulk_size_reached() {
        let sink = sink(1);
        let mut event = Event::new(EventKind::Insert, 1, "bin.000001", 1);
        event.schema = "db".into();
        event.table = "t".into();
        event.primary_key = vec!["id".into()];
        event.after.insert("id".into(), ColumnValue::Int(7));
        sink.on_event(event).await.unwrap();
        let batches = sink.client.batches.lock().await;
        assert_eq!(batches.len(), 1);
    }

    #[tokio::test]
    async fn null_id_column_fails_as_mapping_error_but_does_not_stop_sink() {
        let sink = sink(1);
        let mut event = Event::new(EventKind::Insert, 1, "bin.000001", 1);
        event.schema = "db".into();
        event.table = "t".into();
        event.primary_key = vec!["id".into()];
        event.after.insert("id".into(), ColumnValue::Null);
        let result = sink.on_event(event).await;
        assert!(result.is_ok());
        assert!(sink.client.batches.lock().await.is_empty());
    }

    #[tokio::test]
    async fn update_with_changed_id_emits_delete_then_index() {
        let sink = sink(1);
        let mut event = Event::new(EventKind::Update, 1, "bin.000001", 1);
        event.schema = "db".into();
        event.table = "t".into();
        event.primary_key = vec!["id".into()];
        event.before.insert("id".into(), ColumnValue::Int(7));
        event.after.insert("id".into(), ColumnValue::Int(8));
        sink.on_event(event).await.unwrap();
        let batches = sink.client.batches.lock().await;
        assert_eq!(batches.len(), 1);
        let ops = &batches[0];
        assert_eq!(ops.len(), 2);
        assert!(matches!(&ops[0], BulkOperation::Delete { id, .. } if id == "7"));
        assert!(matches!(&ops[1], BulkOperation::Index { id, .. } if id == "8"));
    }

    #[tokio::test]
    async fn skip_no_pk_table_drops_rows_with_empty_primary_key() {
        let sink = BulkIndexSink::new(RecordingClient::new(), vec![rule()], 1, Duration::from_secs(60))
            .with_skip_no_pk_table(true);
        let mut event = Event::new(EventKind::Insert, 1, "bin.000001", 1);
        event.schema = "db".into();
        event.table = "t".into();
        event.primary_key = Vec::new();
        event.after.insert("id".into(), ColumnValue::Int(7));
        sink.on_event(event).await.unwrap();
        assert!(sink.client.batches.lock().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_flush_fires_before_bulk_size_is_reached() {
        let sink = Arc::new(BulkIndexSink::new(RecordingClient::new(), vec![rule()], 100, Duration::from_secs(5)));
        let cancel = CancellationToken::new();
        let flush_task = {
            let sink = Arc::clone(&sink);
            let cancel = cancel.clone();
            tokio::spawn(async move { sink.run_periodic_flush(cancel).await })
        };

        let mut event = Event::new(EventKind::Insert, 1, "bin.000001", 1);
        event.schema = "db".into();
        event.table = "t".into();
        event.primary_key = vec!["id".into()];
        event.after.insert("id".into(), ColumnValue::Int(1));
        sink.on_event(event).await.unwrap();
        assert!(sink.client.batches.lock().await.is_empty());

        tokio::time::advance(Duration::from_secs(5)).await;
        tokio::task::yield_now().await;

        assert_eq!(sink.client.batches.lock().await.len(), 1);

        cancel.cancel();
        let _ = flush_task.await;
    }

    #[tokio::test]
    async fn flush_retries_then_succeeds() {
        let client = RecordingClient::new();
        client.fail_times.store(2, Ordering::SeqCst);
        let sink = BulkIndexSink::new(client, vec![rule()], 10, Duration::from_secs(60));
        let mut event = Event::new(EventKind::Insert, 1, "bin.000001", 1);
        event.schema = "db".into();
        event.table = "t".into();
        event.primary_key = vec!["id".into()];
        event.after.insert("id".into(), ColumnValue::Int(1));
        sink.on_event(event).await.unwrap();

        tokio::time::pause();
        let flush = sink.flush();
        tokio::pin!(flush);
        for _ in 0..2 {
            tokio::time::advance(RETRY_DELAY).await;
        }
        flush.await.unwrap();
        assert_eq!(sink.client.batches.lock().await.len(), 1);
    }
}
