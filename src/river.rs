//! Top-level wiring: Ingest Engine + Dispatcher + Health Monitor + Sink,
//! running as cooperating tasks coordinated by one bounded channel and
//! one cancellation token (spec.md §2, §5).

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::RiverConfig;
use crate::dispatcher::Dispatcher;
use crate::engine::{EngineStateCell, IngestEngine};
use crate::error::{Result, RiverError};
use crate::health::HealthMonitor;
use crate::position::PositionStore;
use crate::sink::Sink;
use crate::source::{ReplicationSource, UpstreamPositionSource};

/// Owns the full pipeline for one `RiverConfig`: one [`IngestEngine`],
/// one [`Dispatcher`], one [`HealthMonitor`], and the [`Sink`] they all
/// deliver to.
pub struct River<S: ReplicationSource, K: Sink + 'static> {
    config: RiverConfig,
    positions: Arc<PositionStore>,
    engine: IngestEngine<S>,
    sink: Arc<K>,
    cancel: CancellationToken,
}

impl<S: ReplicationSource + 'static, K: Sink + 'static> River<S, K> {
    pub async fn new(config: RiverConfig, source: S, sink: K) -> Result<Self> {
        config.validate()?;
        let positions = Arc::new(PositionStore::load(config.data_dir.clone(), config.save_interval).await?);
        let cancel = CancellationToken::new();
        let engine = IngestEngine::new(source, Arc::clone(&positions), config.server_id, cancel.clone());
        Ok(Self {
            config,
            positions,
            engine,
            sink: Arc::new(sink),
            cancel,
        })
    }

    pub fn engine_state(&self) -> Arc<EngineStateCell> {
        self.engine.state_cell()
    }

    /// Start the pipeline and run until `close()` is called or an
    /// unrecoverable error occurs. Spawns the Dispatcher and Health
    /// Monitor as tasks; drives the Ingest Engine on the calling task.
    pub async fn run(&mut self) -> Result<()> {
        self.engine.sync(self.config.start_from, &self.config.sources).await?;
        let upstream_position_source = self.engine.upstream_position_source();

        let (tx, rx) = mpsc::channel(self.config.queue_capacity);

        let dispatcher_handle = {
            let mut dispatcher = Dispatcher::new(
                Arc::clone(&self.positions),
                Arc::clone(&self.sink),
                self.config.save_interval,
                self.cancel.clone(),
            );
            tokio::spawn(async move { dispatcher.run(rx).await })
        };

        let health_handle = {
            let positions = Arc::clone(&self.positions);
            let sink = Arc::clone(&self.sink);
            let cancel = self.cancel.clone();
            let check_interval = self.config.check_interval;
            let pos_threshold = self.config.pos_threshold;
            tokio::spawn(async move {
                run_health_loop(positions, sink, cancel, check_interval, pos_threshold, upstream_position_source).await
            })
        };

        // `tx` is owned by `engine.run` and dropped when it returns; once
        // the last sender is gone the Dispatcher drains any buffered
        // events and its `rx.recv()` returns `None` on its own, so the
        // cancellation token is not needed for a clean drain — only to
        // stop the Health Monitor task below.
        let ingest_result = self.engine.run(tx).await;

        let dispatch_result = dispatcher_handle.await.unwrap_or_else(|e| {
            Err(RiverError::Upstream(format!("dispatcher task panicked: {e}")))
        });

        self.cancel.cancel();
        let _ = health_handle.await;

        let outcome = ingest_result.and(dispatch_result);
        self.close(outcome.as_ref().err()).await;
        outcome
    }

    /// Idempotent shutdown: cancels the shared token, forces a final
    /// checkpoint save, and invokes `Sink.onClose(err)` exactly once
    /// (spec.md §4.2, §5, §8 invariant #7).
    pub async fn close(&self, err: Option<&RiverError>) {
        self.cancel.cancel();
        if let Err(e) = self.positions.close().await {
            error!(error = %e, "final checkpoint save failed during close");
        }
        self.sink.on_close(err).await;
        info!(state = ?self.engine_state().get(), "river closed");
    }
}

async fn run_health_loop(
    positions: Arc<PositionStore>,
    sink: Arc<dyn Sink>,
    cancel: CancellationToken,
    check_interval: std::time::Duration,
    pos_threshold: u64,
    upstream_position_source: Arc<dyn UpstreamPositionSource>,
) {
    let mut monitor = HealthMonitor::new(check_interval, pos_threshold);
    let mut ticker = tokio::time::interval(monitor.check_interval());
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {
                let positions = Arc::clone(&positions);
                let upstream = Arc::clone(&upstream_position_source);
                let result = monitor
                    .tick(
                        || { let positions = Arc::clone(&positions); async move { positions.current_position().await } },
                        || async move { upstream.query_upstream_position().await },
                        sink.as_ref(),
                    )
                    .await;
                if let Err(e) = result {
                    error!(error = %e, "health monitor alert failed, closing");
                    cancel.cancel();
                    return;
                }
            }
        }
    }
}
