// C3: Event Attestation Engine. Queries every configured disaster-data
// provider in parallel, dedups within 50km, scores the survivors, and
// picks the best match (spec §4.3).

use serde::Deserialize;
use std::time::Duration;
use tracing::{instrument, warn};

use crate::domain::{merge_sources, same_event_cluster, EventAttestation, EventSeverity};
use crate::geo::haversine_m_e7;

#[derive(Debug, thiserror::Error)]
pub enum EventFailure {
    #[error("no active event found within search radius")]
    NoEventFound,
    #[error("matching event is not currently active")]
    EventNotActive,
}

#[derive(Clone, Debug, Deserialize)]
struct ProviderEvent {
    event_id: String,
    event_class: String,
    severity: EventSeverity,
    region: String,
    centre_lat_e7: i64,
    centre_lng_e7: i64,
    radius_km: f64,
    active: bool,
    timestamp_ms: u64,
}

pub struct EventQuery {
    pub lat_e7: i64,
    pub lng_e7: i64,
    pub claimed_class: String,
    pub radius_km: f64,
}

pub struct EventAttestationEngine {
    http: reqwest::Client,
    provider_urls: Vec<String>,
    per_provider_timeout: Duration,
}

impl EventAttestationEngine {
    pub fn new(provider_urls: Vec<String>, per_provider_timeout: Duration) -> Self {
        Self {
            http: reqwest::Client::builder().timeout(per_provider_timeout).build().expect("http client"),
            provider_urls,
            per_provider_timeout,
        }
    }

    #[instrument(skip(self, query), fields(claimed_class = %query.claimed_class))]
    pub async fn verify_event(&self, query: &EventQuery) -> Result<EventAttestation, EventFailure> {
        let fetches = self.provider_urls.iter().map(|url| self.query_provider(url, query));
        let results = futures::future::join_all(fetches).await;

        let mut candidates: Vec<EventAttestation> = Vec::new();
        for (source, events) in self.provider_urls.iter().zip(results) {
            let Some(events) = events else { continue };
            for e in events {
                let distance_km = haversine_m_e7(query.lat_e7, query.lng_e7, e.centre_lat_e7, e.centre_lng_e7) / 1000.0;
                if distance_km > query.radius_km {
                    continue;
                }
                candidates.push(EventAttestation {
                    event_id: e.event_id,
                    event_class: e.event_class,
                    severity: e.severity,
                    region: e.region,
                    centre_lat_e7: e.centre_lat_e7,
                    centre_lng_e7: e.centre_lng_e7,
                    radius_km: e.radius_km,
                    sources: vec![source.clone()],
                    distance_km,
                    active: e.active,
                    timestamp_ms: e.timestamp_ms,
                });
            }
        }

        let merged = dedup_events(candidates);
        let best = merged
            .into_iter()
            .max_by(|a, b| score(a).partial_cmp(&score(b)).unwrap_or(std::cmp::Ordering::Equal));

        match best {
            None => Err(EventFailure::NoEventFound),
            Some(e) if !e.active => Err(EventFailure::EventNotActive),
            Some(e) => Ok(e),
        }
    }

    async fn query_provider(&self, url: &str, query: &EventQuery) -> Option<Vec<ProviderEvent>> {
        let fut = self.http.get(format!("{url}/events")).query(&[
            ("lat_e7", query.lat_e7.to_string()),
            ("lng_e7", query.lng_e7.to_string()),
            ("radius_km", query.radius_km.to_string()),
        ]).send();

        let resp = match tokio::time::timeout(self.per_provider_timeout, fut).await {
            Ok(Ok(resp)) if resp.status().is_success() => resp,
            Ok(Ok(resp)) => {
                warn!(%url, status = %resp.status(), "event_provider_error_status");
                return None;
            }
            Ok(Err(e)) => {
                warn!(%url, error = %e, "event_provider_request_failed");
                return None;
            }
            Err(_) => {
                warn!(%url, "event_provider_timeout");
                return None;
            }
        };

        match resp.json::<Vec<ProviderEvent>>().await {
            Ok(events) => Some(events),
            Err(e) => {
                warn!(%url, error = %e, "event_provider_malformed_response");
                None
            }
        }
    }
}

/// Merge events of the same class whose centres lie within 50km, unioning
/// their source sets (spec §4.3 step 3).
fn dedup_events(events: Vec<EventAttestation>) -> Vec<EventAttestation> {
    let mut merged: Vec<EventAttestation> = Vec::new();
    for event in events {
        if let Some(existing) = merged.iter_mut().find(|m| same_event_cluster(m, &event)) {
            existing.sources = merge_sources(&existing.sources, &event.sources);
            if event.distance_km < existing.distance_km {
                existing.distance_km = event.distance_km;
            }
        } else {
            merged.push(event);
        }
    }
    merged
}

fn score(e: &EventAttestation) -> f64 {
    let proximity = (1.0 - e.distance_km / e.radius_km).max(0.0);
    let source_coverage = (e.sources.len() as f64 / 3.0).min(1.0);
    0.5 * proximity + 0.3 * source_coverage + 0.2 * e.severity.score()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(class: &str, lat_e7: i64, lng_e7: i64, sources: &[&str]) -> EventAttestation {
        EventAttestation {
            event_id: "e1".into(),
            event_class: class.into(),
            severity: EventSeverity::Critical,
            region: "r".into(),
            centre_lat_e7: lat_e7,
            centre_lng_e7: lng_e7,
            radius_km: 50.0,
            sources: sources.iter().map(|s| s.to_string()).collect(),
            distance_km: 1.0,
            active: true,
            timestamp_ms: 0,
        }
    }

    #[test]
    fn dedup_merges_nearby_same_class_events() {
        let a = event("flood", -170500000, 368700000, &["GDACS"]);
        let b = event("flood", -170501000, 368701000, &["ReliefWeb"]);
        let merged = dedup_events(vec![a, b]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].sources, vec!["GDACS".to_string(), "ReliefWeb".to_string()]);
    }

    #[test]
    fn dedup_keeps_far_apart_events_separate() {
        let a = event("flood", -170500000, 368700000, &["GDACS"]);
        let b = event("flood", 100000000, 1000000000, &["ReliefWeb"]);
        let merged = dedup_events(vec![a, b]);
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn dedup_keeps_different_classes_separate_even_if_colocated() {
        let a = event("flood", -170500000, 368700000, &["GDACS"]);
        let b = event("earthquake", -170500000, 368700000, &["USGS"]);
        let merged = dedup_events(vec![a, b]);
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn score_prefers_closer_higher_severity_more_sourced_event() {
        let near_critical = event("flood", -170500000, 368700000, &["GDACS", "ReliefWeb", "USGS"]);
        let mut far_low = event("flood", 100000000, 1000000000, &["GDACS"]);
        far_low.severity = EventSeverity::Low;
        far_low.distance_km = 40.0;
        assert!(score(&near_critical) > score(&far_low));
    }
}
