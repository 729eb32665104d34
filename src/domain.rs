// Canonical aid-request record and every attestation type it accumulates
// as it crosses the pipeline (spec §3). These are the types that get
// hashed and anchored on-ledger, and the types the HTTP surface serializes
// to JSON — kept deliberately flat and serde-derivable.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::digest::digest_of;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AidClass {
    Medical = 0,
    Food = 1,
    Shelter = 2,
    Rescue = 3,
    Comms = 4,
    Evacuation = 5,
}

impl AidClass {
    pub fn from_wire(v: u8) -> Option<Self> {
        Some(match v {
            0 => Self::Medical,
            1 => Self::Food,
            2 => Self::Shelter,
            3 => Self::Rescue,
            4 => Self::Comms,
            5 => Self::Evacuation,
            _ => return None,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    Medium = 0,
    High = 1,
    Critical = 2,
}

impl Urgency {
    pub fn from_wire(v: u8) -> Option<Self> {
        Some(match v {
            0 => Self::Medium,
            1 => Self::High,
            2 => Self::Critical,
            _ => return None,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FulfillerClass {
    Aerial = 0,
    Human = 1,
}

impl FulfillerClass {
    pub fn from_wire(v: u8) -> Option<Self> {
        Some(match v {
            0 => Self::Aerial,
            1 => Self::Human,
            _ => return None,
        })
    }
}

/// Linear status with two failure branches (spec §3). Transitions are
/// enforced by the ledger; this enum only needs to describe the graph so
/// the orchestrator and tests can check "never goes backwards".
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Submitted,
    Verified,
    Rejected,
    Approved,
    Funded,
    DeliverySubmitted,
    DeliveryFailed,
    DeliveryVerified,
    Settled,
    TimedOut,
}

impl RequestStatus {
    /// Ordinal used only to assert forward-only movement in tests; the two
    /// failure branches (`Rejected`, `TimedOut`) are terminal regardless of
    /// where they're reached from, so they're not part of the linear order.
    pub fn is_terminal(self) -> bool {
        matches!(self, RequestStatus::Rejected | RequestStatus::TimedOut | RequestStatus::Settled)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AidRequest {
    pub id: u64,
    pub requester: String,
    pub aid_class: AidClass,
    pub urgency: Urgency,
    pub lat_e7: i64,
    pub lng_e7: i64,
    pub details_digest: [u8; 32],
    pub status: RequestStatus,
    pub created_at_ms: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AntiSpoofingOutcome {
    Clean,
    Spoofed,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GnssProofBundle {
    pub authenticated_lat_e7: i64,
    pub authenticated_lng_e7: i64,
    pub accuracy_m: f64,
    pub satellite_count: u32,
    pub auth_key_id: String,
    pub anti_spoofing_outcome: AntiSpoofingOutcome,
    pub authenticated_timestamp_ms: u64,
    pub device_id: String,
}

impl GnssProofBundle {
    pub fn digest(&self) -> [u8; 32] {
        digest_of(self)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSeverity {
    Low,
    Moderate,
    Severe,
    Critical,
}

impl EventSeverity {
    pub fn score(self) -> f64 {
        match self {
            EventSeverity::Critical => 1.0,
            EventSeverity::Severe => 0.75,
            EventSeverity::Moderate => 0.5,
            EventSeverity::Low => 0.25,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventAttestation {
    pub event_id: String,
    pub event_class: String,
    pub severity: EventSeverity,
    pub region: String,
    pub centre_lat_e7: i64,
    pub centre_lng_e7: i64,
    pub radius_km: f64,
    pub sources: Vec<String>,
    pub distance_km: f64,
    pub active: bool,
    pub timestamp_ms: u64,
}

impl EventAttestation {
    pub fn digest(&self) -> [u8; 32] {
        digest_of(self)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConsensusNode {
    pub node_id: u32,
    pub model_id: String,
    pub approve: bool,
    pub recommended_aid: AidClass,
    pub recommended_fulfiller: FulfillerClass,
    pub estimated_cost: u64,
    pub confidence: f64,
    pub latency_ms: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConsensusTranscript {
    pub node_count: usize,
    pub valid_count: usize,
    pub approval_count: usize,
    pub approved: bool,
    pub chosen_aid_class: Option<AidClass>,
    pub chosen_fulfiller_class: Option<FulfillerClass>,
    pub chosen_cost_estimate: Option<u64>,
    pub average_confidence: Option<f64>,
    pub nodes: Vec<ConsensusNode>,
}

impl ConsensusTranscript {
    pub fn digest(&self) -> [u8; 32] {
        digest_of(self)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeliveryProof {
    Aerial {
        drop_lat_e7: i64,
        drop_lng_e7: i64,
        payload_image_digest: [u8; 32],
        drone_id: String,
        timestamp_ms: u64,
    },
    Human {
        officer_id: String,
        signature: Vec<u8>,
        timestamp_ms: u64,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeliveryVerification {
    pub verified: bool,
    pub reason: Option<String>,
}

impl DeliveryVerification {
    pub fn digest(&self) -> [u8; 32] {
        digest_of(self)
    }
}

/// Dedup two event records originating from different providers: same
/// class, centres within 50km, merge the source sets (spec §4.3 step 3).
pub fn same_event_cluster(a: &EventAttestation, b: &EventAttestation) -> bool {
    a.event_class == b.event_class
        && crate::geo::haversine_m_e7(a.centre_lat_e7, a.centre_lng_e7, b.centre_lat_e7, b.centre_lng_e7)
            <= 50_000.0
}

pub fn merge_sources(a: &[String], b: &[String]) -> Vec<String> {
    let mut set: HashSet<String> = a.iter().cloned().collect();
    set.extend(b.iter().cloned());
    let mut merged: Vec<String> = set.into_iter().collect();
    merged.sort();
    merged
}
