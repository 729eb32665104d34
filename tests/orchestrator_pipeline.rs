// End-to-end pipeline tests. Every upstream dependency (ledger, GNSS
// authenticator, event providers, LLM panel, fulfiller) is a wiremock
// server; the orchestrator drives real HTTP calls against them and we
// observe the outcome on the event bus, matching the boundary scenarios
// enumerated in the design notes.

use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use aidchain_orchestrator::bus::{EventBus, StageStatus};
use aidchain_orchestrator::consensus::ConsensusEngine;
use aidchain_orchestrator::domain::{AidClass, AidRequest, RequestStatus, Urgency};
use aidchain_orchestrator::events_attestation::EventAttestationEngine;
use aidchain_orchestrator::fulfiller::FulfillerClient;
use aidchain_orchestrator::geo::degrees_to_e7;
use aidchain_orchestrator::gnss::GnssAuthenticatorClient;
use aidchain_orchestrator::ledger::HttpLedgerAdapter;
use aidchain_orchestrator::pipeline::stages::Orchestrator;
use aidchain_orchestrator::pipeline::PipelineRegistry;

const TARGET_LAT: f64 = -17.0523;
const TARGET_LNG: f64 = 36.8714;

fn request(id: u64) -> AidRequest {
    AidRequest {
        id,
        requester: "0xabc".into(),
        aid_class: AidClass::Medical,
        urgency: Urgency::High,
        lat_e7: degrees_to_e7(TARGET_LAT),
        lng_e7: degrees_to_e7(TARGET_LNG),
        details_digest: [0u8; 32],
        status: RequestStatus::Submitted,
        created_at_ms: 0,
    }
}

async fn mount_ledger_writes_ok(ledger: &MockServer) {
    for op in ["verify", "consensus", "assign_fulfiller", "verify_delivery", "release_payout", "timeout"] {
        Mock::given(method("POST"))
            .and(path(format!("/tx/{op}")))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"tx_hash": "0xdead", "block": 1})))
            .mount(ledger)
            .await;
    }
}

async fn mount_approved_fulfillers(ledger: &MockServer, aerial_addr: &str) {
    Mock::given(method("GET"))
        .and(path("/fulfillers/approved"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
            {"class": 0, "address": aerial_addr},
            {"class": 1, "address": "human-fulfiller"},
        ])))
        .mount(ledger)
        .await;
}

fn gnss_snapshot(lat_e7: i64, lng_e7: i64, cnr_stddev: f64) -> serde_json::Value {
    serde_json::json!({
        "authenticated_satellite_count": 8,
        "navigation_chain_ok": true,
        "carrier_to_noise_stddev_db": cnr_stddev,
        "low_elevation_mean_db": -10.0,
        "high_elevation_mean_db": -8.0,
        "fix_lat_e7": lat_e7,
        "fix_lng_e7": lng_e7,
        "authenticated_timestamp_ms": 0,
        "auth_key_id": "k1",
    })
}

fn flood_event(lat_e7: i64, lng_e7: i64, active: bool) -> serde_json::Value {
    serde_json::json!([{
        "event_id": "flood-1",
        "event_class": "flood",
        "severity": "critical",
        "region": "Zambezia",
        "centre_lat_e7": lat_e7,
        "centre_lng_e7": lng_e7,
        "radius_km": 50.0,
        "active": active,
        "timestamp_ms": 0,
    }])
}

fn llm_verdict(approved: bool, aid: u8, fulfiller: u8, cost: u64) -> serde_json::Value {
    serde_json::json!({
        "approved": approved,
        "reason": "matches the attested event",
        "recommended_aid": aid,
        "fulfiller_type": fulfiller,
        "estimated_cost": cost,
        "confidence": 90,
        "priority_score": 5,
    })
}

struct Harness {
    orchestrator: Orchestrator,
    _ledger: MockServer,
    _gnss: MockServer,
    _events: MockServer,
    _llms: Vec<MockServer>,
    _fulfiller: MockServer,
}

async fn build_harness(llm_verdicts: Vec<serde_json::Value>) -> Harness {
    let ledger_srv = MockServer::start().await;
    let gnss_srv = MockServer::start().await;
    let event_srv = MockServer::start().await;
    let fulfiller_srv = MockServer::start().await;

    mount_ledger_writes_ok(&ledger_srv).await;
    mount_approved_fulfillers(&ledger_srv, &fulfiller_srv.uri()).await;

    Mock::given(method("GET")).and(path("/events")).respond_with(ResponseTemplate::new(200).set_body_json(flood_event(
        degrees_to_e7(-17.05),
        degrees_to_e7(36.87),
        true,
    ))).mount(&event_srv).await;

    Mock::given(method("POST")).and(path("/dispatch")).respond_with(
        ResponseTemplate::new(200).set_body_json(serde_json::json!({"dispatch_id": "d1", "eta_ms": 60_000})),
    ).mount(&fulfiller_srv).await;

    let mut llm_servers = Vec::new();
    let mut llm_urls = Vec::new();
    for verdict in llm_verdicts {
        let srv = MockServer::start().await;
        Mock::given(method("POST")).and(path("/verdict")).respond_with(ResponseTemplate::new(200).set_body_json(verdict)).mount(&srv).await;
        llm_urls.push(srv.uri());
        llm_servers.push(srv);
    }

    let ledger = Arc::new(HttpLedgerAdapter::new(ledger_srv.uri(), Some([7u8; 32]), Duration::from_secs(5)));
    let gnss = Arc::new(GnssAuthenticatorClient::new(gnss_srv.uri(), Duration::from_secs(5)));
    let events = Arc::new(EventAttestationEngine::new(vec![event_srv.uri()], Duration::from_secs(5)));
    let consensus = Arc::new(ConsensusEngine::new(llm_urls, Duration::from_secs(5), 3));
    let fulfiller = Arc::new(FulfillerClient::new(vec![(0, fulfiller_srv.uri())], Duration::from_secs(5)));

    let orchestrator = Orchestrator {
        ledger,
        gnss,
        events,
        consensus,
        fulfiller,
        bus: EventBus::new(),
        registry: PipelineRegistry::new(),
        event_search_radius_km: 100.0,
        delivery_timeout: Duration::from_secs(5),
    };

    Harness { orchestrator, _ledger: ledger_srv, _gnss: gnss_srv, _events: event_srv, _llms: llm_servers, _fulfiller: fulfiller_srv }
}

async fn next_terminal(rx: &mut tokio::sync::mpsc::Receiver<aidchain_orchestrator::bus::PipelineEvent>) -> aidchain_orchestrator::bus::PipelineEvent {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("pipeline did not terminate in time")
            .expect("bus channel closed unexpectedly");
        if event.status == StageStatus::Failed || event.stage == "timeout" || (event.stage == "settlement" && event.status == StageStatus::Completed) {
            return event;
        }
    }
}

#[tokio::test]
async fn happy_aerial_path_settles() {
    let harness = build_harness(vec![
        llm_verdict(true, 0, 0, 120),
        llm_verdict(true, 0, 0, 140),
        llm_verdict(true, 0, 0, 150),
        llm_verdict(true, 0, 0, 160),
        llm_verdict(true, 0, 0, 200),
    ])
    .await;

    Mock::given(method("POST"))
        .and(path("/verify"))
        .respond_with(ResponseTemplate::new(200).set_body_json(gnss_snapshot(degrees_to_e7(TARGET_LAT), degrees_to_e7(TARGET_LNG), 2.0)))
        .mount(&harness._gnss)
        .await;

    let mut all_events = harness.orchestrator.bus.subscribe(Some(1)).await;
    let delivery_rx = harness.orchestrator.registry.create(1).await;
    drop(delivery_rx);

    harness.orchestrator.submit(request(1), Some("dev-1".into()), vec![1, 2, 3]);

    // wait for fulfillment dispatched, then submit the delivery proof.
    loop {
        let event = all_events.recv().await.expect("bus closed");
        if event.stage == "fulfillment" && event.status == StageStatus::Completed {
            break;
        }
    }
    let proof = aidchain_orchestrator::domain::DeliveryProof::Aerial {
        drop_lat_e7: degrees_to_e7(-17.05231),
        drop_lng_e7: degrees_to_e7(36.87138),
        payload_image_digest: [9u8; 32],
        drone_id: "drone-1".into(),
        timestamp_ms: 0,
    };
    harness.orchestrator.registry.submit_delivery_proof(1, proof).await.expect("delivery accepted");

    let terminal = next_terminal(&mut all_events).await;
    assert_eq!(terminal.stage, "settlement");
    assert_eq!(terminal.status, StageStatus::Completed);
}

#[tokio::test]
async fn spoofed_gnss_halts_before_any_other_call() {
    let harness = build_harness(vec![]).await;

    Mock::given(method("POST"))
        .and(path("/verify"))
        .respond_with(ResponseTemplate::new(200).set_body_json(gnss_snapshot(degrees_to_e7(TARGET_LAT), degrees_to_e7(TARGET_LNG), 0.2)))
        .mount(&harness._gnss)
        .await;

    let mut events = harness.orchestrator.bus.subscribe(Some(2)).await;
    let _rx = harness.orchestrator.registry.create(2).await;
    harness.orchestrator.submit(request(2), Some("dev-1".into()), vec![1]);

    let terminal = next_terminal(&mut events).await;
    assert_eq!(terminal.stage, "gnss_verify");
    assert_eq!(terminal.status, StageStatus::Failed);
    assert!(harness.orchestrator.registry.snapshot(2).await.is_none());
}

#[tokio::test]
async fn no_matching_event_halts_before_consensus() {
    let harness = build_harness(vec![]).await;

    Mock::given(method("POST"))
        .and(path("/verify"))
        .respond_with(ResponseTemplate::new(200).set_body_json(gnss_snapshot(degrees_to_e7(TARGET_LAT), degrees_to_e7(TARGET_LNG), 2.0)))
        .mount(&harness._gnss)
        .await;

    // override the /events mock mounted by the harness default with an empty page.
    Mock::given(method("GET"))
        .and(path("/events"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([])))
        .with_priority(1)
        .mount(&harness._events)
        .await;

    let mut events = harness.orchestrator.bus.subscribe(Some(3)).await;
    let _rx = harness.orchestrator.registry.create(3).await;
    harness.orchestrator.submit(request(3), Some("dev-1".into()), vec![1]);

    let terminal = next_terminal(&mut events).await;
    assert_eq!(terminal.stage, "event_verify");
    assert_eq!(terminal.status, StageStatus::Failed);
}

#[tokio::test]
async fn split_llm_panel_rejects() {
    // 3 approve, 2 reject: 3*3=9 is not > 2*5=10, so this fails supermajority.
    let harness = build_harness(vec![
        llm_verdict(true, 0, 0, 120),
        llm_verdict(true, 0, 0, 140),
        llm_verdict(true, 0, 0, 150),
        llm_verdict(false, 0, 0, 0),
        llm_verdict(false, 0, 0, 0),
    ])
    .await;

    Mock::given(method("POST"))
        .and(path("/verify"))
        .respond_with(ResponseTemplate::new(200).set_body_json(gnss_snapshot(degrees_to_e7(TARGET_LAT), degrees_to_e7(TARGET_LNG), 2.0)))
        .mount(&harness._gnss)
        .await;

    let mut events = harness.orchestrator.bus.subscribe(Some(4)).await;
    let _rx = harness.orchestrator.registry.create(4).await;
    harness.orchestrator.submit(request(4), Some("dev-1".into()), vec![1]);

    let terminal = next_terminal(&mut events).await;
    assert_eq!(terminal.stage, "consensus");
    assert_eq!(terminal.status, StageStatus::Failed);
}

#[tokio::test]
async fn delivery_outside_tolerance_times_out_instead_of_settling() {
    let harness = build_harness(vec![
        llm_verdict(true, 0, 0, 120),
        llm_verdict(true, 0, 0, 140),
        llm_verdict(true, 0, 0, 150),
        llm_verdict(true, 0, 0, 160),
        llm_verdict(true, 0, 0, 200),
    ])
    .await;

    Mock::given(method("POST"))
        .and(path("/verify"))
        .respond_with(ResponseTemplate::new(200).set_body_json(gnss_snapshot(degrees_to_e7(TARGET_LAT), degrees_to_e7(TARGET_LNG), 2.0)))
        .mount(&harness._gnss)
        .await;

    let mut events = harness.orchestrator.bus.subscribe(Some(5)).await;
    let _rx = harness.orchestrator.registry.create(5).await;
    harness.orchestrator.submit(request(5), Some("dev-1".into()), vec![1]);

    loop {
        let event = events.recv().await.expect("bus closed");
        if event.stage == "fulfillment" && event.status == StageStatus::Completed {
            break;
        }
    }

    // ~95m off target, outside the 30m aerial drop tolerance.
    let proof = aidchain_orchestrator::domain::DeliveryProof::Aerial {
        drop_lat_e7: degrees_to_e7(-17.0530),
        drop_lng_e7: degrees_to_e7(36.8720),
        payload_image_digest: [9u8; 32],
        drone_id: "drone-1".into(),
        timestamp_ms: 0,
    };
    harness.orchestrator.registry.submit_delivery_proof(5, proof).await.expect("delivery accepted");

    // Delivery verification fails immediately, but `timeout_request` is only
    // invoked after a fresh delivery-timeout window elapses — not on the
    // spot — so this waits out that second window too.
    let terminal = loop {
        let event = tokio::time::timeout(Duration::from_secs(10), events.recv())
            .await
            .expect("pipeline did not terminate in time")
            .expect("bus channel closed unexpectedly");
        if event.stage == "timeout" {
            break event;
        }
    };
    assert_eq!(terminal.stage, "timeout");
}

#[tokio::test]
async fn ledger_transient_failure_is_retried_not_duplicated() {
    let harness = build_harness(vec![
        llm_verdict(true, 0, 0, 120),
        llm_verdict(true, 0, 0, 140),
        llm_verdict(true, 0, 0, 150),
        llm_verdict(true, 0, 0, 160),
        llm_verdict(true, 0, 0, 200),
    ])
    .await;

    Mock::given(method("POST"))
        .and(path("/verify"))
        .respond_with(ResponseTemplate::new(200).set_body_json(gnss_snapshot(degrees_to_e7(TARGET_LAT), degrees_to_e7(TARGET_LNG), 2.0)))
        .mount(&harness._gnss)
        .await;

    // first /tx/verify attempt times out at the transport level, second succeeds;
    // this mock has higher priority and is consumed after a single match.
    Mock::given(method("POST"))
        .and(path("/tx/verify"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&harness._ledger)
        .await;

    let mut events = harness.orchestrator.bus.subscribe(Some(6)).await;
    let delivery_rx = harness.orchestrator.registry.create(6).await;
    drop(delivery_rx);
    harness.orchestrator.submit(request(6), Some("dev-1".into()), vec![1]);

    loop {
        let event = events.recv().await.expect("bus closed");
        if event.stage == "fulfillment" && event.status == StageStatus::Completed {
            break;
        }
    }
    let proof = aidchain_orchestrator::domain::DeliveryProof::Aerial {
        drop_lat_e7: degrees_to_e7(-17.05231),
        drop_lng_e7: degrees_to_e7(36.87138),
        payload_image_digest: [9u8; 32],
        drone_id: "drone-1".into(),
        timestamp_ms: 0,
    };
    harness.orchestrator.registry.submit_delivery_proof(6, proof).await.expect("delivery accepted");

    let terminal = next_terminal(&mut events).await;
    assert_eq!(terminal.stage, "settlement");
    assert_eq!(terminal.status, StageStatus::Completed);

    let verify_requests = harness._ledger.received_requests().await.expect("request recording enabled");
    let verify_count = verify_requests.iter().filter(|r| r.url.path() == "/tx/verify").count();
    assert_eq!(verify_count, 2, "expected one failed attempt and one retry");
}
