// AIDCHAIN ORCHESTRATOR — off-chain pipeline service for the aidchain
// humanitarian-aid protocol (Rust/Axum/Tokio).
//
// Wires C1-C8 together: reads and writes against the ledger, authenticates
// GNSS claims, cross-references disaster events, polls an LLM consensus
// panel, dispatches and verifies fulfillers, and drives each request's
// pipeline from submission through settlement while publishing progress on
// an in-process event bus that the HTTP and WebSocket surface exposes.

use std::net::SocketAddr;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use tracing::{error, info, warn};

use aidchain_orchestrator::bus::EventBus;
use aidchain_orchestrator::config::Config;
use aidchain_orchestrator::consensus::ConsensusEngine;
use aidchain_orchestrator::events_attestation::EventAttestationEngine;
use aidchain_orchestrator::fulfiller::FulfillerClient;
use aidchain_orchestrator::gnss::GnssAuthenticatorClient;
use aidchain_orchestrator::http::{self, AppState};
use aidchain_orchestrator::ledger::HttpLedgerAdapter;
use aidchain_orchestrator::pipeline::stages::Orchestrator;
use aidchain_orchestrator::pipeline::PipelineRegistry;
use aidchain_orchestrator::bus;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "aidchain_orchestrator=info,tower_http=info".into()))
        .json()
        .init();

    let config = Arc::new(Config::from_env());
    info!(production = config.production, port = config.port, "aidchain orchestrator starting");

    if config.oracle_signing_key.is_none() {
        warn!("ORACLE_SIGNING_KEY not set — ledger writes are disabled, the orchestrator will fail every pipeline at its first write");
    }

    let ledger = Arc::new(HttpLedgerAdapter::new(config.ledger_rpc_url.clone(), config.oracle_signing_key, config.ledger_rpc_timeout));
    let gnss = Arc::new(GnssAuthenticatorClient::new(config.gnss_endpoint.clone(), config.gnss_timeout));
    let events = Arc::new(EventAttestationEngine::new(config.event_provider_urls.clone(), config.event_provider_timeout));
    let consensus = Arc::new(ConsensusEngine::new(config.llm_endpoints.clone(), config.llm_timeout, config.consensus_quorum_floor));
    let fulfiller = Arc::new(FulfillerClient::new(config.fulfiller_base_urls.clone(), config.fulfiller_dispatch_timeout));
    let bus = EventBus::new();
    let registry = PipelineRegistry::new();

    let orchestrator = Orchestrator {
        ledger: ledger.clone(),
        gnss,
        events,
        consensus,
        fulfiller,
        bus: bus.clone(),
        registry,
        event_search_radius_km: config.event_search_radius_km,
        delivery_timeout: config.delivery_timeout,
    };

    let next_request_id = Arc::new(AtomicU64::new(ledger.get_request_count().await.unwrap_or(0) + 1));

    let state = AppState { config: config.clone(), orchestrator: orchestrator.clone(), next_request_id };

    tokio::spawn({
        let ledger = ledger.clone();
        let cursor_path = config.ledger_cursor_path.clone();
        let poll_interval = config.ledger_poll_interval;
        async move {
            ledger
                .poll_events(cursor_path, poll_interval, |event| {
                    info!(?event, "ledger_event_observed");
                })
                .await;
        }
    });

    tokio::spawn({
        let bus = bus.clone();
        async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(60));
            loop {
                interval.tick().await;
                bus.prune_closed().await;
            }
        }
    });

    let app = http::router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    info!(%addr, "listening");

    let listener = tokio::net::TcpListener::bind(addr).await.unwrap_or_else(|e| {
        error!(error = %e, %addr, "failed to bind listener");
        std::process::exit(1);
    });

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown(orchestrator))
        .await
        .unwrap_or_else(|e| {
            error!(error = %e, "server error");
            std::process::exit(1);
        });
}

/// On operator signal: stop accepting new requests (handled by axum once
/// this future resolves), let in-flight stages run to their own deadlines,
/// and tell every still-active pipeline's subscribers that the process is
/// going down (spec §5's shutdown clause — the ledger cursor is already
/// persisted incrementally by the poll loop).
async fn shutdown(orchestrator: Orchestrator) {
    tokio::signal::ctrl_c().await.ok();
    info!("shutdown signal received");

    for record in orchestrator.registry.list_active().await {
        orchestrator
            .bus
            .publish(bus::PipelineEvent::new(record.request_id, "shutdown", bus::StageStatus::Pending, "orchestrator is shutting down"))
            .await;
    }
}
