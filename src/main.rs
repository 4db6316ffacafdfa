//! CLI entry point: builds a [`river::RiverConfig`] from the process
//! environment, wires a sink selected by `RIVER_SINK`, and runs the
//! pipeline until a fatal error or Ctrl-C.
//!
//! The replication client is an externally supplied collaborator
//! (spec.md §6); this binary is wired against [`river::source::MockReplicationSource`]
//! as the illustrative stand-in a real deployment swaps for a live
//! connector.

use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use river::config::{RiverConfig, StartFrom};
use river::sink::bulk_index::{BulkIndexSink, HttpBulkIndexClient};
use river::sink::broker::{KafkaBrokerProducer, MessageBrokerSink};
use river::sink::NoopSink;
use river::position::Position;
use river::source::MockReplicationSource;
use river::River;

fn config_from_env() -> RiverConfig {
    let mut config = RiverConfig::default();
    if let Ok(host) = std::env::var("RIVER_MYSQL_HOST") {
        config.mysql_host = host;
    }
    if let Ok(port) = std::env::var("RIVER_MYSQL_PORT") {
        if let Ok(port) = port.parse() {
            config.mysql_port = port;
        }
    }
    if let Ok(dir) = std::env::var("RIVER_DATA_DIR") {
        config.data_dir = PathBuf::from(dir);
    }
    if std::env::var("RIVER_START_FROM_UPSTREAM").is_ok() {
        config.start_from = StartFrom::FromUpstream;
    }
    config
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = config_from_env();
    let source = MockReplicationSource::new(Vec::new(), Position::new("bin.000001", 0));

    match std::env::var("RIVER_SINK").as_deref() {
        Ok("bulk-index") => {
            let bulk_url = std::env::var("RIVER_BULK_INDEX_URL").unwrap_or_else(|_| "http://127.0.0.1:9200/_bulk".to_string());
            let client = HttpBulkIndexClient::new(bulk_url);
            let sink = Arc::new(
                BulkIndexSink::new(client, Vec::new(), config.bulk_size, config.flush_interval)
                    .with_health_info_path(config.data_dir.join("health.info"))
                    .with_skip_no_pk_table(config.skip_no_pk_table),
            );

            let flush_cancel = CancellationToken::new();
            let flush_handle = {
                let sink = Arc::clone(&sink);
                let flush_cancel = flush_cancel.clone();
                tokio::spawn(async move { sink.run_periodic_flush(flush_cancel).await })
            };

            let result = run(config, source, sink).await;
            flush_cancel.cancel();
            let _ = flush_handle.await;
            result
        }
        Ok("broker") => {
            let producer = KafkaBrokerProducer::new(&config.broker_addrs, config.topic.clone())?;
            let sink = MessageBrokerSink::new(producer, config.topic.clone());
            run(config, source, sink).await
        }
        _ => run(config, source, NoopSink).await,
    }
}

async fn run<S, K>(config: RiverConfig, source: S, sink: K) -> Result<(), Box<dyn std::error::Error>>
where
    S: river::source::ReplicationSource + 'static,
    K: river::sink::Sink + 'static,
{
    let mut pipeline = River::new(config, source, sink).await?;
    tokio::select! {
        result = pipeline.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            pipeline.close(None).await;
        }
    }
    Ok(())
}
