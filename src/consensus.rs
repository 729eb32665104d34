// C4: LLM Consensus Engine. Fans the identical prompt out to every
// configured endpoint in parallel, parses a structured verdict from each,
// and aggregates by supermajority + median (spec §4.4).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{instrument, warn};

use crate::domain::{AidClass, ConsensusNode, ConsensusTranscript, FulfillerClass};

const QUORUM_FLOOR_DEFAULT: usize = 3;

#[derive(Clone, Debug, Serialize)]
pub struct ConsensusPrompt {
    pub aid_class: AidClass,
    pub urgency: String,
    pub authenticated_lat_e7: i64,
    pub authenticated_lng_e7: i64,
    pub accuracy_m: f64,
    pub event_name: String,
    pub event_class: String,
    pub event_severity: String,
    pub region: String,
    pub distance_to_event_km: f64,
    pub source_count: usize,
}

#[derive(Clone, Debug, Deserialize)]
struct RawVerdict {
    approved: bool,
    #[allow(dead_code)]
    reason: String,
    recommended_aid: u8,
    fulfiller_type: u8,
    estimated_cost: u64,
    confidence: u8,
    #[allow(dead_code)]
    priority_score: u8,
}

pub struct ConsensusEngine {
    http: reqwest::Client,
    endpoints: Vec<String>,
    per_node_timeout: Duration,
    quorum_floor: usize,
}

impl ConsensusEngine {
    pub fn new(endpoints: Vec<String>, per_node_timeout: Duration, quorum_floor: usize) -> Self {
        Self {
            http: reqwest::Client::builder().timeout(per_node_timeout).build().expect("http client"),
            endpoints,
            per_node_timeout,
            quorum_floor: quorum_floor.max(QUORUM_FLOOR_DEFAULT),
        }
    }

    #[instrument(skip(self, prompt))]
    pub async fn run_consensus(&self, prompt: &ConsensusPrompt) -> ConsensusTranscript {
        let legs = self
            .endpoints
            .iter()
            .enumerate()
            .map(|(idx, url)| self.dispatch_leg(idx as u32, url, prompt));
        let nodes: Vec<ConsensusNode> = futures::future::join_all(legs).await.into_iter().flatten().collect();

        let node_count = self.endpoints.len();
        let valid_count = nodes.len();
        let approval_count = nodes.iter().filter(|n| n.approve).count();

        let blank = |approved: bool| ConsensusTranscript {
            node_count,
            valid_count,
            approval_count,
            approved,
            chosen_aid_class: None,
            chosen_fulfiller_class: None,
            chosen_cost_estimate: None,
            average_confidence: None,
            nodes: nodes.clone(),
        };

        if valid_count < self.quorum_floor {
            return blank(false);
        }

        let approved = 3 * approval_count > 2 * valid_count;
        if !approved {
            return blank(false);
        }

        let approving: Vec<&ConsensusNode> = nodes.iter().filter(|n| n.approve).collect();
        ConsensusTranscript {
            node_count,
            valid_count,
            approval_count,
            approved: true,
            chosen_aid_class: Some(plurality(approving.iter().map(|n| n.recommended_aid as u8)).and_then(AidClass::from_wire).expect("approving node exists")),
            chosen_fulfiller_class: Some(plurality(approving.iter().map(|n| n.recommended_fulfiller as u8)).and_then(FulfillerClass::from_wire).expect("approving node exists")),
            chosen_cost_estimate: Some(median_cost(&approving)),
            average_confidence: Some(mean_confidence(&approving)),
            nodes,
        }
    }

    async fn dispatch_leg(&self, node_id: u32, url: &str, prompt: &ConsensusPrompt) -> Option<ConsensusNode> {
        let started = Instant::now();
        let fut = self.http.post(format!("{url}/verdict")).json(prompt).send();
        let resp = match tokio::time::timeout(self.per_node_timeout, fut).await {
            Ok(Ok(resp)) if resp.status().is_success() => resp,
            Ok(Ok(resp)) => {
                warn!(%url, status = %resp.status(), "llm_node_error_status");
                return None;
            }
            Ok(Err(e)) => {
                warn!(%url, error = %e, "llm_node_request_failed");
                return None;
            }
            Err(_) => {
                warn!(%url, "llm_node_timeout");
                return None;
            }
        };

        let body = match resp.text().await {
            Ok(b) => b,
            Err(e) => {
                warn!(%url, error = %e, "llm_node_body_read_failed");
                return None;
            }
        };

        let verdict = match parse_verdict(&body) {
            Some(v) => v,
            None => {
                warn!(%url, "llm_node_parse_failed");
                return None;
            }
        };

        let recommended_aid = AidClass::from_wire(verdict.recommended_aid)?;
        let recommended_fulfiller = FulfillerClass::from_wire(verdict.fulfiller_type)?;
        Some(ConsensusNode {
            node_id,
            model_id: url.to_string(),
            approve: verdict.approved,
            recommended_aid,
            recommended_fulfiller,
            estimated_cost: verdict.estimated_cost,
            confidence: verdict.confidence as f64,
            latency_ms: started.elapsed().as_millis() as u64,
        })
    }
}

/// Strip markdown code-fence markers before parsing, then parse the JSON
/// verdict (spec §4.4 step 3).
fn parse_verdict(body: &str) -> Option<RawVerdict> {
    let trimmed = body.trim();
    let unfenced = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed)
        .trim_end_matches("```")
        .trim();
    serde_json::from_str(unfenced).ok()
}

/// Plurality vote over a categorical field, ties broken by the lowest
/// numeric value (spec §4.4 step 6 — deterministic tie rule).
fn plurality(values: impl Iterator<Item = u8>) -> Option<u8> {
    let mut counts: HashMap<u8, usize> = HashMap::new();
    for v in values {
        *counts.entry(v).or_default() += 1;
    }
    let max = *counts.values().max()?;
    counts.iter().filter(|(_, &c)| c == max).map(|(&k, _)| k).min()
}

/// Lower median of the approving nodes' cost estimates (spec §4.4 step 6 —
/// robust against order-of-magnitude LLM cost outliers).
fn median_cost(nodes: &[&ConsensusNode]) -> u64 {
    let mut costs: Vec<u64> = nodes.iter().map(|n| n.estimated_cost).collect();
    costs.sort_unstable();
    let mid = costs.len() / 2;
    if costs.len() % 2 == 0 {
        costs[mid - 1]
    } else {
        costs[mid]
    }
}

fn mean_confidence(nodes: &[&ConsensusNode]) -> f64 {
    let sum: f64 = nodes.iter().map(|n| n.confidence).sum();
    sum / nodes.len() as f64
}
