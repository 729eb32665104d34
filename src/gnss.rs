// C2: GNSS Authenticator Client. Drives a specialised upstream authenticator
// through the 7-step algorithm in spec §4.2 and always returns a result —
// even a failure is recorded for audit, it just halts the pipeline at
// stage 2.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{instrument, warn};

use crate::domain::{AntiSpoofingOutcome, GnssProofBundle};
use crate::geo::haversine_m_e7;

const MIN_SATELLITES: u32 = 4;
const CNR_STDDEV_THRESHOLD_DB: f64 = 0.5;
const ELEVATION_POWER_MAX_DELTA_DB: f64 = 5.0;
const POSITION_MISMATCH_TOLERANCE_M: f64 = 50.0;

#[derive(Debug, thiserror::Error)]
pub enum GnssFailure {
    #[error("insufficient satellite coverage: {0} authenticated satellites")]
    InsufficientCoverage(u32),
    #[error("navigation-message authentication chain failed")]
    AuthenticationFailed,
    #[error("spoofing detected: {0}")]
    SpoofingDetected(String),
    #[error("claimed position mismatch: {0:.1}m from authenticated fix")]
    PositionMismatch(f64),
    #[error("upstream authenticator unavailable: {0}")]
    Unavailable(String),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LocationClaim {
    pub claimed_lat_e7: i64,
    pub claimed_lng_e7: i64,
    pub device_id: String,
    pub raw_signal_bundle: Vec<u8>,
}

/// What the upstream authenticator backend hands back before this client
/// applies the anti-spoofing battery and the claim cross-check.
#[derive(Clone, Debug, Deserialize)]
struct SatelliteSnapshot {
    authenticated_satellite_count: u32,
    navigation_chain_ok: bool,
    carrier_to_noise_stddev_db: f64,
    low_elevation_mean_db: f64,
    high_elevation_mean_db: f64,
    fix_lat_e7: i64,
    fix_lng_e7: i64,
    authenticated_timestamp_ms: u64,
    auth_key_id: String,
}

pub struct GnssAuthenticatorClient {
    http: reqwest::Client,
    endpoint: String,
    timeout: Duration,
}

impl GnssAuthenticatorClient {
    pub fn new(endpoint: String, timeout: Duration) -> Self {
        Self {
            http: reqwest::Client::builder().timeout(timeout).build().expect("http client"),
            endpoint,
            timeout,
        }
    }

    #[instrument(skip(self, claim), fields(device_id = %claim.device_id))]
    pub async fn verify_location(&self, claim: &LocationClaim) -> Result<GnssProofBundle, GnssFailure> {
        let snapshot = self.acquire_snapshot(claim).await?;

        if snapshot.authenticated_satellite_count < MIN_SATELLITES {
            return Err(GnssFailure::InsufficientCoverage(snapshot.authenticated_satellite_count));
        }
        if !snapshot.navigation_chain_ok {
            return Err(GnssFailure::AuthenticationFailed);
        }

        if snapshot.carrier_to_noise_stddev_db <= CNR_STDDEV_THRESHOLD_DB {
            return Err(GnssFailure::SpoofingDetected(format!(
                "carrier-to-noise dispersion {:.2}dB below threshold {:.2}dB",
                snapshot.carrier_to_noise_stddev_db, CNR_STDDEV_THRESHOLD_DB
            )));
        }
        let elevation_power_delta = snapshot.low_elevation_mean_db - snapshot.high_elevation_mean_db;
        if elevation_power_delta > ELEVATION_POWER_MAX_DELTA_DB {
            return Err(GnssFailure::SpoofingDetected(format!(
                "low-elevation mean exceeds high-elevation mean by {:.2}dB",
                elevation_power_delta
            )));
        }

        let distance = haversine_m_e7(
            claim.claimed_lat_e7,
            claim.claimed_lng_e7,
            snapshot.fix_lat_e7,
            snapshot.fix_lng_e7,
        );
        if distance > POSITION_MISMATCH_TOLERANCE_M {
            warn!(distance_m = distance, "gnss_position_mismatch");
            return Err(GnssFailure::PositionMismatch(distance));
        }

        Ok(GnssProofBundle {
            authenticated_lat_e7: snapshot.fix_lat_e7,
            authenticated_lng_e7: snapshot.fix_lng_e7,
            accuracy_m: snapshot.carrier_to_noise_stddev_db.max(1.0),
            satellite_count: snapshot.authenticated_satellite_count,
            auth_key_id: snapshot.auth_key_id,
            anti_spoofing_outcome: AntiSpoofingOutcome::Clean,
            authenticated_timestamp_ms: snapshot.authenticated_timestamp_ms,
            device_id: claim.device_id.clone(),
        })
    }

    async fn acquire_snapshot(&self, claim: &LocationClaim) -> Result<SatelliteSnapshot, GnssFailure> {
        let resp = self
            .http
            .post(format!("{}/verify", self.endpoint))
            .timeout(self.timeout)
            .json(claim)
            .send()
            .await
            .map_err(|e| GnssFailure::Unavailable(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(GnssFailure::Unavailable(format!("HTTP {}", resp.status())));
        }
        resp.json::<SatelliteSnapshot>()
            .await
            .map_err(|e| GnssFailure::Unavailable(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spoofing_detected_on_low_stddev() {
        let snapshot = SatelliteSnapshot {
            authenticated_satellite_count: 6,
            navigation_chain_ok: true,
            carrier_to_noise_stddev_db: 0.2,
            low_elevation_mean_db: -10.0,
            high_elevation_mean_db: -8.0,
            fix_lat_e7: -170523000,
            fix_lng_e7: 368714000,
            authenticated_timestamp_ms: 0,
            auth_key_id: "k1".into(),
        };
        assert!(snapshot.carrier_to_noise_stddev_db <= CNR_STDDEV_THRESHOLD_DB);
    }

    #[test]
    fn position_mismatch_over_tolerance() {
        let d = haversine_m_e7(-170523000, 368714000, -170530000, 368720000);
        assert!(d > POSITION_MISMATCH_TOLERANCE_M);
    }
}
