// C6: Pipeline Orchestrator — the per-request state machine (spec §4.6).
// `mod.rs` owns the in-memory record and the registry; `stages.rs` drives
// a record through the eight stages.

pub mod stages;

use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{oneshot, Mutex};

use crate::domain::{ConsensusTranscript, DeliveryProof, DeliveryVerification, EventAttestation, GnssProofBundle};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Request = 1,
    GnssVerify = 2,
    EventVerify = 3,
    Consensus = 4,
    Contract = 5,
    Fulfillment = 6,
    Receipt = 7,
    Settlement = 8,
}

#[derive(Clone, Debug, Serialize)]
pub struct PipelineRecord {
    pub request_id: u64,
    pub current_stage: Stage,
    pub awaiting_delivery: bool,
    pub stage_completed_at: HashMap<String, i64>,
    pub gnss_proof: Option<GnssProofBundle>,
    pub event_attestation: Option<EventAttestation>,
    pub consensus_transcript: Option<ConsensusTranscript>,
    pub delivery_proof: Option<DeliveryProof>,
    pub delivery_verification: Option<DeliveryVerification>,
    pub last_error: Option<String>,
    pub created_at_ms: i64,
}

impl PipelineRecord {
    fn new(request_id: u64) -> Self {
        Self {
            request_id,
            current_stage: Stage::Request,
            awaiting_delivery: false,
            stage_completed_at: HashMap::new(),
            gnss_proof: None,
            event_attestation: None,
            consensus_transcript: None,
            delivery_proof: None,
            delivery_verification: None,
            last_error: None,
            created_at_ms: Utc::now().timestamp_millis(),
        }
    }

    pub fn elapsed_ms(&self) -> i64 {
        Utc::now().timestamp_millis() - self.created_at_ms
    }

    fn enter(&mut self, stage: Stage) {
        self.current_stage = stage;
    }

    fn complete(&mut self, stage: Stage) {
        self.stage_completed_at.insert(format!("{stage:?}"), Utc::now().timestamp_millis());
    }
}

struct Handle {
    record: PipelineRecord,
    delivery_tx: Option<oneshot::Sender<DeliveryProof>>,
}

/// The single shared mutable structure (spec §5): one lock, held only for
/// lookup/insert/delete, never across an await point.
#[derive(Clone)]
pub struct PipelineRegistry {
    inner: Arc<Mutex<HashMap<u64, Handle>>>,
}

impl PipelineRegistry {
    pub fn new() -> Self {
        Self { inner: Arc::new(Mutex::new(HashMap::new())) }
    }

    /// Creates a record for a freshly submitted request and returns the
    /// receiver the driving task awaits for the delivery webhook
    /// rendezvous (spec §5's "suspend on the delivery webhook arrival").
    pub async fn create(&self, request_id: u64) -> oneshot::Receiver<DeliveryProof> {
        let (tx, rx) = oneshot::channel();
        let mut guard = self.inner.lock().await;
        guard.insert(request_id, Handle { record: PipelineRecord::new(request_id), delivery_tx: Some(tx) });
        rx
    }

    pub async fn snapshot(&self, request_id: u64) -> Option<PipelineRecord> {
        let guard = self.inner.lock().await;
        guard.get(&request_id).map(|h| h.record.clone())
    }

    pub async fn list_active(&self) -> Vec<PipelineRecord> {
        let guard = self.inner.lock().await;
        guard.values().map(|h| h.record.clone()).collect()
    }

    pub async fn mutate(&self, request_id: u64, f: impl FnOnce(&mut PipelineRecord)) {
        let mut guard = self.inner.lock().await;
        if let Some(handle) = guard.get_mut(&request_id) {
            f(&mut handle.record);
        }
    }

    /// Webhook-side delivery proof delivery. Idempotent: the second call
    /// for an already-delivered request finds the sender already consumed
    /// and reports it, satisfying "first wins, second is a no-op" (spec §8).
    pub async fn submit_delivery_proof(&self, request_id: u64, proof: DeliveryProof) -> Result<(), DeliveryAlreadySubmitted> {
        let mut guard = self.inner.lock().await;
        let Some(handle) = guard.get_mut(&request_id) else { return Err(DeliveryAlreadySubmitted) };
        match handle.delivery_tx.take() {
            Some(tx) => {
                let _ = tx.send(proof);
                Ok(())
            }
            None => Err(DeliveryAlreadySubmitted),
        }
    }

    /// Called on terminal status or timeout to drop the in-memory record
    /// (spec §3 invariant: a pipeline record exists iff the orchestrator
    /// is still driving the request).
    pub async fn remove(&self, request_id: u64) {
        let mut guard = self.inner.lock().await;
        guard.remove(&request_id);
    }
}

impl Default for PipelineRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
pub struct DeliveryAlreadySubmitted;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_delivery_submission_is_a_no_op() {
        let registry = PipelineRegistry::new();
        let _rx = registry.create(1).await;
        let proof = DeliveryProof::Human { officer_id: "o1".into(), signature: vec![1], timestamp_ms: 0 };
        assert!(registry.submit_delivery_proof(1, proof.clone()).await.is_ok());
        assert!(registry.submit_delivery_proof(1, proof).await.is_err());
    }

    #[tokio::test]
    async fn remove_drops_the_record() {
        let registry = PipelineRegistry::new();
        let _rx = registry.create(7).await;
        assert!(registry.snapshot(7).await.is_some());
        registry.remove(7).await;
        assert!(registry.snapshot(7).await.is_none());
    }
}
