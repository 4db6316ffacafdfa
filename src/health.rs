//! Health Monitor: periodically compares the checkpointed position to the
//! upstream server's current position and emits status transitions
//! (spec.md §4.5).
//!
//! Grounded on spec.md's classification table directly; the "tick, keep
//! previous values, alert only on change" shape follows the health/
//! heartbeat framing other_examples/...mysql-cdc-rs uses.

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::warn;

use crate::error::Result;
use crate::position::Position;
use crate::sink::Sink;

const GRACE_PERIOD: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum HealthStatus {
    Green,
    Yellow,
    Red,
}

/// Emitted by the Health Monitor on each tick (spec.md §3).
#[derive(Debug, Clone)]
pub struct HealthSnapshot {
    pub status: HealthStatus,
    pub reasons: Vec<String>,
    pub file_pos: Position,
    pub db_pos: Position,
    pub check_interval: Duration,
    pub pos_threshold: u64,
    pub last_status: Option<HealthStatus>,
}

impl HealthSnapshot {
    pub fn new(
        status: HealthStatus,
        reasons: Vec<String>,
        file_pos: Position,
        db_pos: Position,
        check_interval: Duration,
        pos_threshold: u64,
    ) -> Self {
        Self {
            status,
            reasons,
            file_pos,
            db_pos,
            check_interval,
            pos_threshold,
            last_status: None,
        }
    }
}

struct Previous {
    status: HealthStatus,
    file_pos: Position,
    db_pos: Position,
}

/// Drives spec.md §4.5's classification loop on a periodic tick.
pub struct HealthMonitor {
    check_interval: Duration,
    pos_threshold: u64,
    previous: Option<Previous>,
}

impl HealthMonitor {
    pub fn new(check_interval: Duration, pos_threshold: u64) -> Self {
        Self {
            check_interval: check_interval.max(Duration::from_secs(1)),
            pos_threshold: pos_threshold.max(1_000),
            previous: None,
        }
    }

    pub fn check_interval(&self) -> Duration {
        self.check_interval
    }

    /// Run one classification tick. `read_file_pos` models
    /// `PositionStore.currentPosition()` (called again inside the grace
    /// period re-check); `query_db_pos` models
    /// `IngestEngine.queryUpstreamPosition()`. `onAlert` is delivered to
    /// `sink` per spec.md §4.5's transition rule.
    pub async fn tick<FFut, DFut, ReadFilePos, QueryDbPos>(
        &mut self,
        read_file_pos: ReadFilePos,
        query_db_pos: QueryDbPos,
        sink: &dyn Sink,
    ) -> Result<HealthSnapshot>
    where
        ReadFilePos: Fn() -> FFut,
        FFut: Future<Output = Position>,
        QueryDbPos: FnOnce() -> DFut,
        DFut: Future<Output = Result<Position>>,
    {
        let file_pos = read_file_pos().await;
        let mut reasons = Vec::new();

        let db_pos = match query_db_pos().await {
            Ok(pos) => pos,
            Err(e) => {
                warn!(error = %e, "failed to query upstream position");
                let snapshot = self.finish_tick(HealthStatus::Red, vec!["failed to get db-pos".to_string()], file_pos, Position::empty());
                self.maybe_alert(&snapshot, sink).await?;
                return Ok(snapshot);
            }
        };

        let mut status = HealthStatus::Green;

        let gap_base = if file_pos.log_name == db_pos.log_name { file_pos.log_offset } else { 0 };
        let gap = db_pos.log_offset.saturating_sub(gap_base);
        if gap > self.pos_threshold as u32 {
            status = status.max(HealthStatus::Yellow);
            reasons.push("diff exceeds threshold".to_string());
        }

        if let Some(prev) = &self.previous {
            let db_advanced = db_pos != prev.db_pos;
            let file_advanced = file_pos != prev.file_pos;
            let stall_reason = if !db_advanced && !file_advanced && file_pos != db_pos {
                Some("stop approaching")
            } else if db_advanced && !file_advanced {
                Some("stop sync")
            } else {
                None
            };

            if let Some(reason) = stall_reason {
                sleep(GRACE_PERIOD).await;
                let rechecked = read_file_pos().await;
                if rechecked != file_pos {
                    // Progress observed on re-read: downgrade to Green,
                    // per spec.md §4.5.
                } else {
                    status = status.max(HealthStatus::Red);
                    reasons.push(reason.to_string());
                }
            }
        }

        let snapshot = self.finish_tick(status, reasons, file_pos, db_pos);
        self.maybe_alert(&snapshot, sink).await?;
        Ok(snapshot)
    }

    fn finish_tick(&mut self, status: HealthStatus, reasons: Vec<String>, file_pos: Position, db_pos: Position) -> HealthSnapshot {
        let last_status = self.previous.as_ref().map(|p| p.status);
        self.previous = Some(Previous {
            status,
            file_pos: file_pos.clone(),
            db_pos: db_pos.clone(),
        });
        let mut snapshot = HealthSnapshot::new(status, reasons, file_pos, db_pos, self.check_interval, self.pos_threshold);
        snapshot.last_status = last_status;
        snapshot
    }

    async fn maybe_alert(&self, snapshot: &HealthSnapshot, sink: &dyn Sink) -> Result<()> {
        let changed = snapshot.last_status != Some(snapshot.status);
        if changed && snapshot.status != HealthStatus::Green {
            sink.on_alert(snapshot.clone()).await?;
        }
        Ok(())
    }
}
