//! Durable, crash-safe storage of the last checkpointed position
//! (spec.md §3, §4.1).

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::{Result, RiverError};

const CHECKPOINT_FILE: &str = "master.info";

/// Opaque string representation of a set of GTIDs. Compared only for
/// equality and parseability (spec.md §3).
pub type GtidSet = String;

/// A byte offset inside a named replication log file, totally ordered
/// lexicographically by `(log_name, log_offset)`. The empty position
/// (`log_name == ""`, `log_offset == 0`) means "not yet known".
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Position {
    pub log_name: String,
    pub log_offset: u32,
}

impl Position {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.log_name.is_empty() && self.log_offset == 0
    }

    pub fn new(log_name: impl Into<String>, log_offset: u32) -> Self {
        Self {
            log_name: log_name.into(),
            log_offset,
        }
    }
}

/// Persisted form of the last durable position (spec.md §3).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub log_name: String,
    pub log_offset: u32,
    #[serde(default)]
    pub gtid_set: GtidSet,
    /// Seconds since the Unix epoch, informational only.
    #[serde(default)]
    pub last_save_time: u64,
}

impl CheckpointRecord {
    pub fn position(&self) -> Position {
        Position::new(self.log_name.clone(), self.log_offset)
    }
}

/// Result of a `PositionStore::save` call (spec.md §4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    Written,
    Skipped,
}

struct Inner {
    record: CheckpointRecord,
    last_written_at: Option<Instant>,
}

/// Durable, atomically-rewritten record of the last checkpointed
/// `(log_name, log_offset)` pair and optional GTID set.
///
/// Protected by a single read-write lock: many concurrent readers for
/// [`PositionStore::current_position`], exclusive for
/// [`PositionStore::save`] (spec.md §5).
pub struct PositionStore {
    dir: PathBuf,
    save_interval: Duration,
    inner: RwLock<Inner>,
}

impl PositionStore {
    /// Load the checkpoint from `dir`. A missing file is not an error and
    /// yields an empty record; an unparseable file is fatal.
    pub async fn load(dir: impl Into<PathBuf>, save_interval: Duration) -> Result<Self> {
        let dir = dir.into();
        let path = dir.join(CHECKPOINT_FILE);

        let record = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => serde_json::from_str(&contents).map_err(|e| {
                RiverError::Checkpoint(format!(
                    "unparseable checkpoint file {}: {e}",
                    path.display()
                ))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => CheckpointRecord::default(),
            Err(e) => return Err(RiverError::Io(e)),
        };

        Ok(Self {
            dir,
            save_interval: save_interval.max(Duration::from_secs(1)),
            inner: RwLock::new(Inner {
                record,
                last_written_at: None,
            }),
        })
    }

    /// Cheap, thread-safe read of the current position.
    pub async fn current_position(&self) -> Position {
        self.inner.read().await.record.position()
    }

    pub async fn current_gtid_set(&self) -> GtidSet {
        self.inner.read().await.record.gtid_set.clone()
    }

    /// Persist `(log_name, log_offset, gtid_set)`.
    ///
    /// Skips the write (returns `Skipped`) if `force` is false and less
    /// than `save_interval` has elapsed since the last write, or if the
    /// position is unchanged. Otherwise serializes to a sibling temp file
    /// and renames it atomically over the target (spec.md §4.1).
    pub async fn save(
        &self,
        log_name: &str,
        log_offset: u32,
        gtid_set: &str,
        force: bool,
    ) -> Result<SaveOutcome> {
        let mut guard = self.inner.write().await;

        let unchanged =
            guard.record.log_name == log_name && guard.record.log_offset == log_offset;
        if unchanged {
            return Ok(SaveOutcome::Skipped);
        }

        if !force {
            if let Some(last) = guard.last_written_at {
                if last.elapsed() < self.save_interval {
                    return Ok(SaveOutcome::Skipped);
                }
            }
        }

        let record = CheckpointRecord {
            log_name: log_name.to_string(),
            log_offset,
            gtid_set: gtid_set.to_string(),
            last_save_time: now_unix_secs(),
        };

        write_atomic(&self.dir, &record).await?;

        debug!(log_name, log_offset, "checkpoint written");
        guard.record = record;
        guard.last_written_at = Some(Instant::now());
        Ok(SaveOutcome::Written)
    }

    /// Force a final save of the in-memory record.
    pub async fn close(&self) -> Result<()> {
        let record = self.inner.read().await.record.clone();
        write_atomic(&self.dir, &record).await?;
        Ok(())
    }
}

async fn write_atomic(dir: &Path, record: &CheckpointRecord) -> Result<()> {
    let path = dir.join(CHECKPOINT_FILE);
    let contents = serde_json::to_string_pretty(record)?;

    let dir = dir.to_path_buf();
    let result = tokio::task::spawn_blocking(move || -> std::io::Result<()> {
        let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
        use std::io::Write;
        tmp.write_all(contents.as_bytes())?;
        tmp.flush()?;
        tmp.as_file().sync_all()?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(tmp.path(), std::fs::Permissions::from_mode(0o644))?;
        }
        match tmp.persist(path) {
            Ok(_) => Ok(()),
            Err(e) => {
                warn!(error = %e.error, "checkpoint rename failed, leaving prior file untouched");
                Err(e.error)
            }
        }
    })
    .await
    .map_err(|e| RiverError::Checkpoint(format!("checkpoint writer task panicked: {e}")))?;

    result.map_err(RiverError::Io)
}

fn now_unix_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_file_loads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = PositionStore::load(dir.path(), Duration::from_secs(3))
            .await
            .unwrap();
        assert!(store.current_position().await.is_empty());
    }

    #[tokio::test]
    async fn unparseable_file_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join(CHECKPOINT_FILE), b"not json")
            .await
            .unwrap();
        let err = PositionStore::load(dir.path(), Duration::from_secs(3))
            .await
            .unwrap_err();
        assert!(matches!(err, RiverError::Checkpoint(_)));
    }

    #[tokio::test]
    async fn save_is_skipped_when_position_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let store = PositionStore::load(dir.path(), Duration::from_secs(3))
            .await
            .unwrap();
        let first = store.save("bin.000001", 100, "", true).await.unwrap();
        assert_eq!(first, SaveOutcome::Written);
        let second = store.save("bin.000001", 100, "", true).await.unwrap();
        assert_eq!(second, SaveOutcome::Skipped);
    }

    #[tokio::test]
    async fn save_is_throttled_without_force() {
        let dir = tempfile::tempdir().unwrap();
        let store = PositionStore::load(dir.path(), Duration::from_secs(60))
            .await
            .unwrap();
        store.save("bin.000001", 100, "", true).await.unwrap();
        let outcome = store.save("bin.000001", 200, "", false).await.unwrap();
        assert_eq!(outcome, SaveOutcome::Skipped);
    }

    #[tokio::test]
    async fn forced_save_bypasses_throttle() {
        let dir = tempfile::tempdir().unwrap();
        let store = PositionStore::load(dir.path(), Duration::from_secs(60))
            .await
            .unwrap();
        store.save("bin.000001", 100, "", true).await.unwrap();
        let outcome = store.save("bin.000001", 200, "", true).await.unwrap();
        assert_eq!(outcome, SaveOutcome::Written);
    }

    #[tokio::test]
    async fn close_persists_current_record_and_reload_sees_it() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = PositionStore::load(dir.path(), Duration::from_secs(60))
                .await
                .unwrap();
            store.save("bin.000002", 42, "gtid-1", true).await.unwrap();
            store.close().await.unwrap();
        }
        let reloaded = PositionStore::load(dir.path(), Duration::from_secs(60))
            .await
            .unwrap();
        let pos = reloaded.current_position().await;
        assert_eq!(pos, Position::new("bin.000002", 42));
        assert_eq!(reloaded.current_gtid_set().await, "gtid-1");
    }

    #[test]
    fn positions_order_lexicographically() {
        let a = Position::new("bin.000001", 500);
        let b = Position::new("bin.000001", 600);
        let c = Position::new("bin.000002", 0);
        assert!(a < b);
        assert!(b < c);
    }
}
