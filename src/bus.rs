// C7: Event Bus. Process-local publish-subscribe for pipeline stage
// transitions (spec §4.7). Best-effort: a slow subscriber is dropped, not
// backpressured onto the orchestrator — freshness beats completeness here,
// the durable record lives on-ledger.

use chrono::Utc;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::warn;

const SUBSCRIBER_QUEUE_CAPACITY: usize = 256;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Started,
    Completed,
    Failed,
    Pending,
}

#[derive(Clone, Debug, Serialize)]
pub struct PipelineEvent {
    pub request_id: u64,
    pub stage: &'static str,
    pub status: StageStatus,
    pub message: String,
    pub timestamp_ms: i64,
    pub payload: Option<serde_json::Value>,
}

impl PipelineEvent {
    pub fn new(request_id: u64, stage: &'static str, status: StageStatus, message: impl Into<String>) -> Self {
        Self { request_id, stage, status, message: message.into(), timestamp_ms: Utc::now().timestamp_millis(), payload: None }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }
}

struct Subscriber {
    request_filter: Option<u64>,
    tx: mpsc::Sender<PipelineEvent>,
}

/// Reader-writer discipline per spec §5: publication takes the read side,
/// subscribe/unsubscribe take the write side.
#[derive(Clone)]
pub struct EventBus {
    subscribers: std::sync::Arc<tokio::sync::RwLock<Vec<Subscriber>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self { subscribers: std::sync::Arc::new(tokio::sync::RwLock::new(Vec::new())) }
    }

    /// Subscribe, optionally filtered to one request id. `None` receives
    /// every event, matching the WebSocket "unsubscribed clients receive
    /// all events" rule in spec §6.
    pub async fn subscribe(&self, request_filter: Option<u64>) -> mpsc::Receiver<PipelineEvent> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_CAPACITY);
        let mut subs = self.subscribers.write().await;
        subs.push(Subscriber { request_filter, tx });
        rx
    }

    pub async fn publish(&self, event: PipelineEvent) {
        let subs = self.subscribers.read().await;
        for sub in subs.iter() {
            if let Some(filter) = sub.request_filter {
                if filter != event.request_id {
                    continue;
                }
            }
            // try_send, not send: a full queue means a slow subscriber —
            // drop the event for them rather than stall every publisher.
            if let Err(mpsc::error::TrySendError::Closed(_)) = sub.tx.try_send(event.clone()) {
                // Channel closed; it'll be pruned on the next write-side pass.
            } else if sub.tx.capacity() == 0 {
                warn!(request_id = event.request_id, "event_bus_subscriber_saturated");
            }
        }
    }

    /// Drop subscribers whose receiver has gone away. Called periodically
    /// rather than on every publish to keep the read-side path cheap.
    pub async fn prune_closed(&self) {
        let mut subs = self.subscribers.write().await;
        subs.retain(|s| !s.tx.is_closed());
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn filtered_subscriber_only_sees_its_request() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe(Some(1)).await;
        bus.publish(PipelineEvent::new(1, "gnss", StageStatus::Started, "go")).await;
        bus.publish(PipelineEvent::new(2, "gnss", StageStatus::Started, "go")).await;
        let got = rx.recv().await.unwrap();
        assert_eq!(got.request_id, 1);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unfiltered_subscriber_sees_every_request() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe(None).await;
        bus.publish(PipelineEvent::new(1, "gnss", StageStatus::Started, "go")).await;
        bus.publish(PipelineEvent::new(2, "gnss", StageStatus::Started, "go")).await;
        assert_eq!(rx.recv().await.unwrap().request_id, 1);
        assert_eq!(rx.recv().await.unwrap().request_id, 2);
    }

    #[tokio::test]
    async fn events_for_one_request_arrive_in_emission_order() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe(Some(1)).await;
        for stage in ["gnss", "event", "consensus"] {
            bus.publish(PipelineEvent::new(1, stage, StageStatus::Completed, stage)).await;
        }
        assert_eq!(rx.recv().await.unwrap().stage, "gnss");
        assert_eq!(rx.recv().await.unwrap().stage, "event");
        assert_eq!(rx.recv().await.unwrap().stage, "consensus");
    }
}
