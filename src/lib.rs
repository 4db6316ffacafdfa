//! A change-data-capture pipeline that replicates a MySQL-compatible
//! binary log and forwards normalized events to pluggable sinks.
//!
//! The crate is organized around the six components of the design: the
//! [`position`] store, [`engine`] (Ingest Engine), [`normalize`] (Event
//! Normalizer), [`dispatcher`], [`health`] (Health Monitor), and the
//! [`sink`] contract with its bulk-index and message-broker
//! implementations. [`river`] wires them together.

pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod event;
pub mod health;
pub mod metadata;
pub mod normalize;
pub mod position;
pub mod river;
pub mod sink;
pub mod source;
pub mod value;

pub use config::RiverConfig;
pub use error::{Result, RiverError};
pub use event::Event;
pub use river::River;
