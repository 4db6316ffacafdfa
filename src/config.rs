//! Pipeline configuration (spec.md §6).
//!
//! Parsing a config file or command-line flags is out of scope (spec.md
//! §1); callers build a `RiverConfig` however they like and hand it to
//! [`crate::river::River::new`].

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Result, RiverError};

/// Where to begin replication on `IngestEngine::sync` (spec.md §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartFrom {
    /// Resume from the Position Store's checkpoint; falls back to
    /// `FromUpstream` if the checkpoint is empty.
    FromCheckpoint,
    /// Start from the upstream server's current position, ignoring any
    /// existing checkpoint.
    FromUpstream,
}

/// One upstream table this pipeline cares about (spec.md §6 `sources`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceTable {
    pub schema: String,
    pub table_glob: String,
}

#[derive(Debug, Clone)]
pub struct RiverConfig {
    pub mysql_host: String,
    pub mysql_port: u16,
    pub mysql_user: String,
    pub mysql_pass: String,
    pub server_id: u32,
    pub flavor: String,

    pub data_dir: PathBuf,
    pub save_interval: Duration,

    pub check_interval: Duration,
    pub pos_threshold: u64,

    pub start_from: StartFrom,
    pub sources: Vec<SourceTable>,

    pub bulk_size: usize,
    pub flush_interval: Duration,
    pub skip_no_pk_table: bool,

    pub broker_addrs: Vec<String>,
    pub topic: String,
    pub offset_store_dir: PathBuf,
    pub initial_offset: i64,

    /// Bounded event queue capacity (spec.md §5, recommended 4096).
    pub queue_capacity: usize,
}

impl Default for RiverConfig {
    fn default() -> Self {
        Self {
            mysql_host: "127.0.0.1".to_string(),
            mysql_port: 3306,
            mysql_user: String::new(),
            mysql_pass: String::new(),
            server_id: 1000,
            flavor: "mysql".to_string(),

            data_dir: PathBuf::from("."),
            save_interval: Duration::from_secs(3),

            check_interval: Duration::from_secs(10),
            pos_threshold: 10_000,

            start_from: StartFrom::FromCheckpoint,
            sources: Vec::new(),

            bulk_size: 128,
            flush_interval: Duration::from_secs(3),
            skip_no_pk_table: false,

            broker_addrs: Vec::new(),
            topic: String::new(),
            offset_store_dir: PathBuf::from("."),
            initial_offset: -1,

            queue_capacity: 4096,
        }
    }
}

impl RiverConfig {
    /// Enforce the floors spec.md names for each throttle/threshold.
    pub fn validate(&self) -> Result<()> {
        if self.save_interval < Duration::from_secs(1) {
            return Err(RiverError::Configuration(
                "saveInterval must be at least 1s".to_string(),
            ));
        }
        if self.check_interval < Duration::from_secs(1) {
            return Err(RiverError::Configuration(
                "checkInterval must be at least 1s".to_string(),
            ));
        }
        if self.pos_threshold < 1_000 {
            return Err(RiverError::Configuration(
                "posThreshold must be at least 1000".to_string(),
            ));
        }
        if self.flush_interval < Duration::from_secs(1) {
            return Err(RiverError::Configuration(
                "flushInterval must be at least 1s".to_string(),
            ));
        }
        if self.bulk_size == 0 {
            return Err(RiverError::Configuration(
                "bulkSize must be greater than zero".to_string(),
            ));
        }
        if self.queue_capacity == 0 {
            return Err(RiverError::Configuration(
                "queueCapacity must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}
