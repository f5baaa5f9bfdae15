//! Optional best-effort fan-out of progress events beyond the store's own
//! audit log (spec §6 `ProgressEventSink`).
//!
//! The store's [`crate::store::BatchStore::append_progress_event`] is the
//! durable record; a sink is a secondary consumer (metrics pipeline, live
//! dashboard feed) that may miss events under backpressure without
//! jeopardizing correctness. Implementations live in `batch-eventsink`.

use async_trait::async_trait;

use crate::model::ProgressEvent;

#[async_trait]
pub trait ProgressEventSink: Send + Sync {
    /// Best-effort publish. Implementations should not block the caller on
    /// slow downstream consumers; dropping events under load is acceptable.
    async fn publish(&self, event: &ProgressEvent);
}

/// A sink that discards every event. Default when no fan-out is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpEventSink;

#[async_trait]
impl ProgressEventSink for NoOpEventSink {
    async fn publish(&self, _event: &ProgressEvent) {}
}
