//! The Sink contract (spec.md §4.6): a capability interface a pipeline's
//! downstream delivers through. Concrete sinks live in [`bulk_index`] and
//! [`broker`].
//!
//! Grounded on the trace-sink `Sink`-style trait
//! (`examples/other_examples/...trace-sink-src-lib.rs`), whose
//! `handle`/`flush`/`close` split maps directly onto
//! `onEvent`/`onAlert`/`onClose`.

pub mod bulk_index;
pub mod broker;

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::event::Event;
use crate::health::HealthSnapshot;

/// A downstream destination for normalized events and health alerts.
///
/// `onEvent` and `onAlert` run on the calling task (Dispatcher and
/// Health Monitor, respectively) and must not block indefinitely
/// (spec.md §4.6). `onClose` is a terminal notification, invoked at most
/// once per engine lifetime.
#[async_trait]
pub trait Sink: Send + Sync {
    async fn on_event(&self, event: Event) -> Result<()>;

    async fn on_alert(&self, snapshot: HealthSnapshot) -> Result<()>;

    async fn on_close(&self, err: Option<&crate::error::RiverError>);
}

/// The no-op default spec.md §9 calls for ("compose by embedding a no-op
/// default" rather than an inheritance chain).
#[derive(Debug, Default)]
pub struct NoopSink;

#[async_trait]
impl Sink for NoopSink {
    async fn on_event(&self, _event: Event) -> Result<()> {
        Ok(())
    }

    async fn on_alert(&self, _snapshot: HealthSnapshot) -> Result<()> {
        Ok(())
    }

    async fn on_close(&self, _err: Option<&crate::error::RiverError>) {}
}

/// Lets an `Arc`-wrapped sink satisfy `Sink` itself, so a caller can keep
/// its own `Arc` clone (e.g. to spawn a sink-owned background task like
/// [`bulk_index::BulkIndexSink::run_periodic_flush`]) alongside handing
/// the sink into [`crate::river::River::new`].
#[async_trait]
impl<T: Sink + ?Sized> Sink for Arc<T> {
    async fn on_event(&self, event: Event) -> Result<()> {
        (**self).on_event(event).await
    }

    async fn on_alert(&self, snapshot: HealthSnapshot) -> Result<()> {
        (**self).on_alert(snapshot).await
    }

    async fn on_close(&self, err: Option<&crate::error::RiverError>) {
        (**self).on_close(err).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Event, EventKind};
    use crate::health::HealthStatus;

    #[tokio::test]
    async fn noop_sink_accepts_everything() {
        let sink = NoopSink;
        sink.on_event(Event::new(EventKind::Xid, 1, "bin.000001", 0)).await.unwrap();
        sink.on_alert(HealthSnapshot::new(HealthStatus::Red, vec!["x".into()], Default::default(), Default::default(), Default::default(), 0))
            .await
            .unwrap();
        sink.on_close(None).await;
    }
}
