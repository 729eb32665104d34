// Drives one pipeline record through C2 → C3 → C4 → C1 → C5 → C1 in strict
// sequence (spec §4.6's stage table). No two stages of the same request
// run concurrently; stages of different requests interleave freely since
// each lives on its own spawned task.

use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, instrument, warn};

use crate::bus::{EventBus, PipelineEvent, StageStatus};
use crate::consensus::{ConsensusEngine, ConsensusPrompt};
use crate::domain::{AidRequest, DeliveryProof, FulfillerClass, Urgency};
use crate::events_attestation::{EventAttestationEngine, EventFailure, EventQuery};
use crate::fulfiller::FulfillerClient;
use crate::gnss::{GnssAuthenticatorClient, LocationClaim};
use crate::ledger::HttpLedgerAdapter;

use super::{PipelineRegistry, Stage};

#[derive(Clone)]
pub struct Orchestrator {
    pub ledger: Arc<HttpLedgerAdapter>,
    pub gnss: Arc<GnssAuthenticatorClient>,
    pub events: Arc<EventAttestationEngine>,
    pub consensus: Arc<ConsensusEngine>,
    pub fulfiller: Arc<FulfillerClient>,
    pub bus: EventBus,
    pub registry: PipelineRegistry,
    pub event_search_radius_km: f64,
    pub delivery_timeout: Duration,
}

impl Orchestrator {
    /// Starts driving a newly submitted request on its own task and
    /// returns immediately — C8 reports `202 pipeline_started` without
    /// waiting on any of this.
    pub fn submit(&self, request: AidRequest, device_id: Option<String>, raw_signal_bundle: Vec<u8>) {
        let this = self.clone();
        tokio::spawn(async move {
            this.drive(request, device_id, raw_signal_bundle).await;
        });
    }

    #[instrument(skip(self, raw_signal_bundle), fields(request_id = request.id))]
    async fn drive(&self, request: AidRequest, device_id: Option<String>, raw_signal_bundle: Vec<u8>) {
        let request_id = request.id;
        let delivery_rx = self.registry.create(request_id).await;
        self.publish(request_id, "request", StageStatus::Completed, "pipeline created").await;

        // --- Stage 2: GnssVerify ---
        self.publish(request_id, "gnss_verify", StageStatus::Started, "authenticating location").await;
        let claim = LocationClaim {
            claimed_lat_e7: request.lat_e7,
            claimed_lng_e7: request.lng_e7,
            device_id: device_id.unwrap_or_default(),
            raw_signal_bundle,
        };
        let gnss_proof = match self.gnss.verify_location(&claim).await {
            Ok(proof) => proof,
            Err(e) => {
                self.fail_attestation(request_id, "gnss_verify", &e.to_string()).await;
                return;
            }
        };
        self.registry.mutate(request_id, |r| {
            r.gnss_proof = Some(gnss_proof.clone());
            r.complete(Stage::GnssVerify);
            r.enter(Stage::EventVerify);
        }).await;
        self.publish(request_id, "gnss_verify", StageStatus::Completed, "location authenticated").await;

        // --- Stage 3: EventVerify ---
        self.publish(request_id, "event_verify", StageStatus::Started, "cross-referencing disaster events").await;
        let query = EventQuery {
            lat_e7: request.lat_e7,
            lng_e7: request.lng_e7,
            claimed_class: format!("{:?}", request.aid_class),
            radius_km: self.event_search_radius_km,
        };
        let event_attestation = match self.events.verify_event(&query).await {
            Ok(attestation) => attestation,
            Err(e @ EventFailure::NoEventFound) | Err(e @ EventFailure::EventNotActive) => {
                self.fail_attestation(request_id, "event_verify", &e.to_string()).await;
                return;
            }
        };

        // Open Question resolution (a): combine the stage 2+3 ledger write
        // into one at stage 3 exit instead of a placeholder stage-2 write.
        if let Err(e) = self.ledger.submit_verification(request_id, gnss_proof.digest(), event_attestation.digest()).await {
            self.fail_permanent(request_id, "event_verify", &e.to_string()).await;
            return;
        }
        self.registry.mutate(request_id, |r| {
            r.event_attestation = Some(event_attestation.clone());
            r.complete(Stage::EventVerify);
            r.enter(Stage::Consensus);
        }).await;
        self.publish(request_id, "event_verify", StageStatus::Completed, "event attested").await;

        // --- Stage 4: Consensus ---
        self.publish(request_id, "consensus", StageStatus::Started, "polling LLM panel").await;
        let prompt = ConsensusPrompt {
            aid_class: request.aid_class,
            urgency: urgency_label(request.urgency).to_string(),
            authenticated_lat_e7: gnss_proof.authenticated_lat_e7,
            authenticated_lng_e7: gnss_proof.authenticated_lng_e7,
            accuracy_m: gnss_proof.accuracy_m,
            event_name: event_attestation.event_id.clone(),
            event_class: event_attestation.event_class.clone(),
            event_severity: format!("{:?}", event_attestation.severity),
            region: event_attestation.region.clone(),
            distance_to_event_km: event_attestation.distance_km,
            source_count: event_attestation.sources.len(),
        };
        let transcript = self.consensus.run_consensus(&prompt).await;

        let consensus_write = self
            .ledger
            .submit_consensus(
                request_id,
                transcript.approved,
                transcript.digest(),
                transcript.chosen_aid_class.map(|c| c as u8),
                transcript.chosen_fulfiller_class.map(|c| c as u8),
                transcript.chosen_cost_estimate,
                transcript.node_count,
                transcript.approval_count,
            )
            .await;
        if let Err(e) = consensus_write {
            self.fail_permanent(request_id, "consensus", &e.to_string()).await;
            return;
        }

        if !transcript.approved {
            self.registry.mutate(request_id, |r| {
                r.consensus_transcript = Some(transcript.clone());
                r.last_error = Some("consensus rejected the request".into());
            }).await;
            self.publish(request_id, "consensus", StageStatus::Failed, "consensus did not reach supermajority approval").await;
            self.registry.remove(request_id).await;
            return;
        }

        self.registry.mutate(request_id, |r| {
            r.consensus_transcript = Some(transcript.clone());
            r.complete(Stage::Consensus);
            r.enter(Stage::Contract);
        }).await;
        self.publish(request_id, "consensus", StageStatus::Completed, "consensus approved").await;

        // --- Stage 5: Contract (escrow + fulfiller binding) ---
        let fulfiller_class = transcript.chosen_fulfiller_class.expect("approved transcript carries a fulfiller class");
        let aid_class = transcript.chosen_aid_class.expect("approved transcript carries an aid class");
        let cost = transcript.chosen_cost_estimate.expect("approved transcript carries a cost estimate");

        let fulfiller_address = match self.resolve_fulfiller_address(fulfiller_class).await {
            Ok(addr) => addr,
            Err(e) => {
                self.fail_permanent(request_id, "contract", &e).await;
                return;
            }
        };
        self.publish(request_id, "contract", StageStatus::Started, "assigning fulfiller and escrow").await;
        if let Err(e) = self.ledger.assign_fulfiller(request_id, &fulfiller_address, cost).await {
            self.fail_permanent(request_id, "contract", &e.to_string()).await;
            return;
        }
        self.registry.mutate(request_id, |r| {
            r.complete(Stage::Contract);
            r.enter(Stage::Fulfillment);
        }).await;
        self.publish(request_id, "contract", StageStatus::Completed, "escrow funded").await;

        // --- Stage 6: Fulfillment ---
        self.publish(request_id, "fulfillment", StageStatus::Started, "dispatching fulfiller").await;
        if let Err(e) = self
            .fulfiller
            .dispatch(request_id, fulfiller_class, aid_class as u8, request.lat_e7, request.lng_e7, cost)
            .await
        {
            self.fail_permanent(request_id, "fulfillment", &e.to_string()).await;
            return;
        }
        self.registry.mutate(request_id, |r| {
            r.complete(Stage::Fulfillment);
            r.awaiting_delivery = true;
        }).await;
        self.publish(request_id, "fulfillment", StageStatus::Completed, "fulfiller dispatched, awaiting delivery").await;

        // --- AwaitingDelivery (wait) ---
        match tokio::time::timeout(self.delivery_timeout, delivery_rx).await {
            Ok(Ok(proof)) => {
                self.receipt_and_settle(request_id, proof, request.lat_e7, request.lng_e7).await;
            }
            Ok(Err(_)) => {
                self.fail_internal(request_id, "awaiting_delivery", "delivery channel closed unexpectedly").await;
            }
            Err(_) => {
                self.time_out(request_id).await;
            }
        }
    }

    async fn receipt_and_settle(&self, request_id: u64, proof: DeliveryProof, target_lat_e7: i64, target_lng_e7: i64) {
        self.publish(request_id, "receipt", StageStatus::Started, "verifying delivery proof").await;
        let verification = self.fulfiller.verify_delivery(&proof, target_lat_e7, target_lng_e7);
        let verified = verification.verified;

        if let Err(e) = self.ledger.verify_delivery(request_id, verification.digest(), verified).await {
            self.fail_permanent(request_id, "receipt", &e.to_string()).await;
            return;
        }
        self.registry.mutate(request_id, |r| {
            r.delivery_proof = Some(proof.clone());
            r.delivery_verification = Some(verification.clone());
            r.awaiting_delivery = false;
        }).await;

        if !verified {
            self.publish(request_id, "receipt", StageStatus::Failed, verification.reason.clone().unwrap_or_default()).await;
            self.arm_delivery_failed_timer(request_id);
            return;
        }

        self.registry.mutate(request_id, |r| {
            r.complete(Stage::Receipt);
            r.enter(Stage::Settlement);
        }).await;
        self.publish(request_id, "receipt", StageStatus::Completed, "delivery verified").await;

        // --- Stage 8: Settlement ---
        self.publish(request_id, "settlement", StageStatus::Started, "releasing payout").await;
        match self.ledger.release_payout(request_id).await {
            Ok(_) => {
                self.registry.mutate(request_id, |r| r.complete(Stage::Settlement)).await;
                self.publish(request_id, "settlement", StageStatus::Completed, "payout released").await;
                self.registry.remove(request_id).await;
            }
            Err(e) => self.fail_permanent(request_id, "settlement", &e.to_string()).await,
        }
    }

    async fn resolve_fulfiller_address(&self, class: FulfillerClass) -> Result<String, String> {
        let fulfillers = self.ledger.get_approved_fulfillers().await.map_err(|e| e.to_string())?;
        fulfillers
            .into_iter()
            .find(|(c, _)| *c as u8 == class as u8)
            .map(|(_, addr)| addr)
            .ok_or_else(|| format!("no approved fulfiller for class {class:?}"))
    }

    async fn time_out(&self, request_id: u64) {
        match self.ledger.timeout_request(request_id).await {
            Ok(_) => self.publish(request_id, "timeout", StageStatus::Completed, "delivery window elapsed, escrow returned").await,
            Err(e) => error!(request_id, error = %e, "timeout_request_write_failed"),
        }
        self.registry.remove(request_id).await;
    }

    /// `DeliveryFailed` is a resting state, not a transient one (spec §3):
    /// the ledger may reject `timeout_request` if invoked before the
    /// window has actually elapsed, so this arms a fresh delivery-timeout
    /// window from the moment of failure rather than calling
    /// `timeout_request` immediately. The in-memory record stays live for
    /// that whole window so `/requests/{id}` keeps reporting
    /// `DeliveryFailed` until the timer fires.
    fn arm_delivery_failed_timer(&self, request_id: u64) {
        let this = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(this.delivery_timeout).await;
            this.time_out(request_id).await;
        });
    }

    async fn fail_attestation(&self, request_id: u64, stage: &'static str, reason: &str) {
        warn!(request_id, stage, reason, "attestation_failure");
        self.registry.mutate(request_id, |r| r.last_error = Some(reason.to_string())).await;
        self.publish(request_id, stage, StageStatus::Failed, reason.to_string()).await;
        self.registry.remove(request_id).await;
    }

    async fn fail_permanent(&self, request_id: u64, stage: &'static str, reason: &str) {
        error!(request_id, stage, reason, "permanent_dependency_fault");
        self.registry.mutate(request_id, |r| r.last_error = Some(reason.to_string())).await;
        self.publish(request_id, stage, StageStatus::Failed, reason.to_string()).await;
        self.registry.remove(request_id).await;
    }

    async fn fail_internal(&self, request_id: u64, stage: &'static str, reason: &str) {
        error!(request_id, stage, reason, "internal_invariant_violation");
        self.registry.mutate(request_id, |r| r.last_error = Some(reason.to_string())).await;
        self.publish(request_id, stage, StageStatus::Failed, reason.to_string()).await;
        // Left in its current ledger state for manual recovery (spec §7) —
        // the in-memory record is dropped, the request is not.
        self.registry.remove(request_id).await;
    }

    async fn publish(&self, request_id: u64, stage: &'static str, status: StageStatus, message: impl Into<String>) {
        info!(request_id, stage, ?status, "pipeline_stage_event");
        self.bus.publish(PipelineEvent::new(request_id, stage, status, message)).await;
    }
}

fn urgency_label(u: Urgency) -> &'static str {
    match u {
        Urgency::Medium => "medium",
        Urgency::High => "high",
        Urgency::Critical => "critical",
    }
}
