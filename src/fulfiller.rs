// C5: Fulfiller Dispatch & Verification. Dispatch calls out to the
// configured fulfiller for a class; verification is a pure function over
// proof inputs (spec §4.5).

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::instrument;

use crate::digest::ZERO_DIGEST;
use crate::domain::{DeliveryProof, DeliveryVerification, FulfillerClass};
use crate::geo::haversine_m_e7;

const AERIAL_DROP_TOLERANCE_M: f64 = 30.0;

#[derive(Debug, thiserror::Error)]
pub enum DispatchFailure {
    #[error("no fulfiller configured for class {0:?}")]
    NoFulfillerConfigured(FulfillerClass),
    #[error("fulfiller rejected dispatch: {0}")]
    Rejected(String),
    #[error("fulfiller unavailable: {0}")]
    Unavailable(String),
}

#[derive(Clone, Debug, Serialize)]
struct DispatchRequest {
    request_id: u64,
    aid_class: u8,
    lat_e7: i64,
    lng_e7: i64,
    estimated_cost: u64,
}

#[derive(Clone, Debug, Deserialize)]
pub struct DispatchResult {
    pub dispatch_id: String,
    pub eta_ms: u64,
}

pub struct FulfillerClient {
    http: reqwest::Client,
    base_urls: Vec<(u8, String)>,
    timeout: Duration,
}

impl FulfillerClient {
    pub fn new(base_urls: Vec<(u8, String)>, timeout: Duration) -> Self {
        Self {
            http: reqwest::Client::builder().timeout(timeout).build().expect("http client"),
            base_urls,
            timeout,
        }
    }

    #[instrument(skip(self))]
    pub async fn dispatch(
        &self,
        request_id: u64,
        fulfiller_class: FulfillerClass,
        aid_class: u8,
        lat_e7: i64,
        lng_e7: i64,
        estimated_cost: u64,
    ) -> Result<DispatchResult, DispatchFailure> {
        let base_url = self
            .base_urls
            .iter()
            .find(|(class, _)| *class == fulfiller_class as u8)
            .map(|(_, url)| url.clone())
            .ok_or(DispatchFailure::NoFulfillerConfigured(fulfiller_class))?;

        let body = DispatchRequest { request_id, aid_class, lat_e7, lng_e7, estimated_cost };
        let fut = self.http.post(format!("{base_url}/dispatch")).json(&body).send();
        let resp = tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| DispatchFailure::Unavailable("dispatch deadline exceeded".into()))?
            .map_err(|e| DispatchFailure::Unavailable(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(DispatchFailure::Rejected(format!("HTTP {}", resp.status())));
        }
        resp.json::<DispatchResult>().await.map_err(|e| DispatchFailure::Unavailable(e.to_string()))
    }

    /// Pure function over proof inputs — no I/O, per spec §4.5.
    pub fn verify_delivery(&self, proof: &DeliveryProof, target_lat_e7: i64, target_lng_e7: i64) -> DeliveryVerification {
        verify_delivery(proof, target_lat_e7, target_lng_e7)
    }
}

pub fn verify_delivery(proof: &DeliveryProof, target_lat_e7: i64, target_lng_e7: i64) -> DeliveryVerification {
    match proof {
        DeliveryProof::Aerial { drop_lat_e7, drop_lng_e7, payload_image_digest, .. } => {
            let distance = haversine_m_e7(target_lat_e7, target_lng_e7, *drop_lat_e7, *drop_lng_e7);
            let gps_ok = distance < AERIAL_DROP_TOLERANCE_M;
            let image_ok = *payload_image_digest != ZERO_DIGEST;
            if gps_ok && image_ok {
                DeliveryVerification { verified: true, reason: None }
            } else if !gps_ok {
                DeliveryVerification { verified: false, reason: Some(format!("drop {distance:.1}m from target, outside {AERIAL_DROP_TOLERANCE_M}m tolerance")) }
            } else {
                DeliveryVerification { verified: false, reason: Some("payload image digest is zero".into()) }
            }
        }
        DeliveryProof::Human { officer_id, signature, .. } => {
            let officer_ok = !officer_id.is_empty();
            let signature_ok = !signature.is_empty();
            if officer_ok && signature_ok {
                DeliveryVerification { verified: true, reason: None }
            } else if !officer_ok {
                DeliveryVerification { verified: false, reason: Some("missing officer id".into()) }
            } else {
                DeliveryVerification { verified: false, reason: Some("missing signature".into()) }
            }
        }
    }
}
