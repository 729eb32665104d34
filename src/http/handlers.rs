// C8 External Surface handlers (spec §6). Thin: validate, delegate to the
// ledger adapter or the orchestrator, shape the response.

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::atomic::Ordering;
use std::time::Duration;

use crate::bus::StageStatus;
use crate::digest::{digest_of, hex_decode};
use crate::domain::{AidClass, AidRequest, DeliveryProof, RequestStatus, Urgency};
use crate::error::AppError;
use crate::geo::degrees_to_e7;
use crate::ledger::LedgerError;

use super::auth::{self, TokenClaims};
use super::{ApiError, AppState};

pub async fn health() -> StatusCode {
    StatusCode::OK
}

pub async fn ready(State(state): State<AppState>) -> StatusCode {
    if state.orchestrator.ledger.get_request_count().await.is_ok() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

#[derive(Serialize)]
pub struct MetricsResponse {
    active_pipelines: usize,
}

pub async fn metrics(State(state): State<AppState>) -> Json<MetricsResponse> {
    let active_pipelines = state.orchestrator.registry.list_active().await.len();
    Json(MetricsResponse { active_pipelines })
}

#[derive(Deserialize)]
pub struct SubmitRequestBody {
    aid_type: u8,
    urgency: u8,
    lat: f64,
    lng: f64,
    details: Option<String>,
    gnss_data: GnssDataBody,
    device_id: Option<String>,
}

#[derive(Deserialize)]
pub struct GnssDataBody {
    raw_signal_bundle_b64: String,
}

#[derive(Serialize)]
pub struct SubmitResponse {
    request_id: u64,
    status: &'static str,
    pipeline_url: String,
}

pub async fn submit_request(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<SubmitRequestBody>,
) -> Result<(StatusCode, Json<SubmitResponse>), ApiError> {
    let claims = require_auth(&state, &headers)?;

    let aid_class = AidClass::from_wire(body.aid_type).ok_or_else(|| state.api_error(AppError::Validation("unknown aid_type".into())))?;
    let urgency = Urgency::from_wire(body.urgency).ok_or_else(|| state.api_error(AppError::Validation("unknown urgency".into())))?;
    let raw_signal_bundle = STANDARD
        .decode(&body.gnss_data.raw_signal_bundle_b64)
        .map_err(|_| state.api_error(AppError::Validation("gnss_data.raw_signal_bundle_b64 is not valid base64".into())))?;

    let request_id = state.next_request_id.fetch_add(1, Ordering::SeqCst);
    let request = AidRequest {
        id: request_id,
        requester: claims.subject,
        aid_class,
        urgency,
        lat_e7: degrees_to_e7(body.lat),
        lng_e7: degrees_to_e7(body.lng),
        details_digest: digest_of(&body.details.clone().unwrap_or_default()),
        status: RequestStatus::Submitted,
        created_at_ms: chrono::Utc::now().timestamp_millis() as u64,
    };

    state.orchestrator.submit(request, body.device_id, raw_signal_bundle);

    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitResponse {
            request_id,
            status: "pipeline_started",
            pipeline_url: format!("/api/requests/{request_id}/pipeline"),
        }),
    ))
}

pub async fn get_request(State(state): State<AppState>, Path(id): Path<u64>) -> Result<Json<AidRequest>, ApiError> {
    state
        .orchestrator
        .ledger
        .get_request(id)
        .await
        .map(Json)
        .map_err(|e| state.api_error(ledger_error_to_app(e)))
}

#[derive(Serialize)]
#[serde(untagged)]
pub enum PipelineResponse {
    Active {
        request_id: u64,
        current_stage: crate::pipeline::Stage,
        elapsed_ms: i64,
        stages: std::collections::HashMap<String, i64>,
        error: Option<String>,
    },
    Inactive {
        status: &'static str,
    },
}

pub async fn get_pipeline(State(state): State<AppState>, Path(id): Path<u64>) -> Json<PipelineResponse> {
    match state.orchestrator.registry.snapshot(id).await {
        Some(record) => Json(PipelineResponse::Active {
            request_id: record.request_id,
            current_stage: record.current_stage,
            elapsed_ms: record.elapsed_ms(),
            stages: record.stage_completed_at,
            error: record.last_error,
        }),
        None => Json(PipelineResponse::Inactive { status: "not_active" }),
    }
}

pub async fn get_user_requests(State(state): State<AppState>, Path(addr): Path<String>) -> Result<Json<serde_json::Value>, ApiError> {
    let ids = state
        .orchestrator
        .ledger
        .get_user_requests(&addr)
        .await
        .map_err(|e| state.api_error(ledger_error_to_app(e)))?;
    Ok(Json(json!({"address": addr, "request_ids": ids})))
}

#[derive(Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum ProofBody {
    Aerial { drop_lat: f64, drop_lng: f64, payload_image_digest_hex: String, drone_id: String, timestamp_ms: u64 },
    Human { officer_id: String, signature_hex: String, timestamp_ms: u64 },
}

fn to_domain_proof(proof: ProofBody) -> Result<DeliveryProof, AppError> {
    match proof {
        ProofBody::Aerial { drop_lat, drop_lng, payload_image_digest_hex, drone_id, timestamp_ms } => {
            let bytes = hex_decode(&payload_image_digest_hex).ok_or_else(|| AppError::Validation("payload_image_digest_hex is not valid hex".into()))?;
            let payload_image_digest: [u8; 32] = bytes.try_into().map_err(|_| AppError::Validation("payload_image_digest_hex must be 32 bytes".into()))?;
            Ok(DeliveryProof::Aerial {
                drop_lat_e7: degrees_to_e7(drop_lat),
                drop_lng_e7: degrees_to_e7(drop_lng),
                payload_image_digest,
                drone_id,
                timestamp_ms,
            })
        }
        ProofBody::Human { officer_id, signature_hex, timestamp_ms } => {
            let signature = hex_decode(&signature_hex).ok_or_else(|| AppError::Validation("signature_hex is not valid hex".into()))?;
            Ok(DeliveryProof::Human { officer_id, signature, timestamp_ms })
        }
    }
}

#[derive(Deserialize)]
pub struct ConfirmDeliveryBody {
    request_id: u64,
    #[serde(flatten)]
    proof: ProofBody,
}

const CONFIRM_DELIVERY_WAIT: Duration = Duration::from_secs(60);

/// Submits the proof into the pipeline's delivery rendezvous, then waits on
/// the bus for that request's own terminal event so the caller learns the
/// settlement outcome synchronously (spec §6's `{status:"settled"}` /
/// `{status:"failed", reason}` response pair).
pub async fn confirm_delivery(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<ConfirmDeliveryBody>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<serde_json::Value>)> {
    require_auth(&state, &headers).map_err(|e| (StatusCode::BAD_REQUEST, Json(json!({"status": "failed", "reason": e.err.to_string()}))))?;

    let request_id = body.request_id;
    let proof = to_domain_proof(body.proof).map_err(|e| (StatusCode::BAD_REQUEST, Json(json!({"status": "failed", "reason": e.to_string()}))))?;

    let mut events = state.orchestrator.bus.subscribe(Some(request_id)).await;
    if state.orchestrator.registry.submit_delivery_proof(request_id, proof).await.is_err() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(json!({"status": "failed", "reason": "no pipeline awaiting delivery for this request, or proof already submitted"})),
        ));
    }

    loop {
        match tokio::time::timeout(CONFIRM_DELIVERY_WAIT, events.recv()).await {
            Ok(Some(event)) if event.stage == "settlement" && event.status == StageStatus::Completed => {
                return Ok(Json(json!({"status": "settled"})));
            }
            Ok(Some(event)) if event.status == StageStatus::Failed || event.stage == "timeout" => {
                return Err((StatusCode::BAD_REQUEST, Json(json!({"status": "failed", "reason": event.message}))));
            }
            Ok(Some(_)) => continue,
            Ok(None) | Err(_) => {
                return Err((StatusCode::BAD_REQUEST, Json(json!({"status": "failed", "reason": "timed out waiting for settlement"}))));
            }
        }
    }
}

pub async fn fund_stats(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    let stats = state.orchestrator.ledger.get_pool_stats().await.map_err(|e| state.api_error(ledger_error_to_app(e)))?;
    Ok(Json(json!({
        "total_deposited": minor_units_to_decimal_string(stats.deposited),
        "total_escrowed": minor_units_to_decimal_string(stats.escrowed),
        "total_paid_out": minor_units_to_decimal_string(stats.paid_out),
        "available_balance": minor_units_to_decimal_string(stats.available),
    })))
}

fn minor_units_to_decimal_string(v: u64) -> String {
    format!("{}.{:06}", v / 1_000_000, v % 1_000_000)
}

pub async fn active_pipelines(State(state): State<AppState>) -> Json<Vec<serde_json::Value>> {
    let records = state.orchestrator.registry.list_active().await;
    Json(
        records
            .into_iter()
            .map(|r| json!({"request_id": r.request_id, "current_stage": r.current_stage, "elapsed_ms": r.elapsed_ms(), "error": r.last_error}))
            .collect(),
    )
}

#[derive(Deserialize)]
pub struct LoginBody {
    address: String,
    signature: String,
    message: String,
}

#[derive(Serialize)]
pub struct LoginResponse {
    token: String,
    address: String,
    verified: bool,
    expires_in: u64,
}

pub async fn login(State(state): State<AppState>, Json(body): Json<LoginBody>) -> Result<Json<LoginResponse>, ApiError> {
    let public_key: [u8; 32] = hex_decode(&body.address)
        .ok_or_else(|| state.api_error(AppError::Unauthorized))?
        .try_into()
        .map_err(|_| state.api_error(AppError::Unauthorized))?;
    let signature_bytes: [u8; 64] = hex_decode(&body.signature)
        .ok_or_else(|| state.api_error(AppError::Unauthorized))?
        .try_into()
        .map_err(|_| state.api_error(AppError::Unauthorized))?;

    let verifying_key = ed25519_dalek::VerifyingKey::from_bytes(&public_key).map_err(|_| state.api_error(AppError::Unauthorized))?;
    let signature = ed25519_dalek::Signature::from_bytes(&signature_bytes);
    use ed25519_dalek::Verifier;
    verifying_key.verify(body.message.as_bytes(), &signature).map_err(|_| state.api_error(AppError::Unauthorized))?;

    let verified = state.orchestrator.ledger.is_identity_verified(&body.address).await.unwrap_or(false);
    let expires_at = chrono::Utc::now().timestamp() + state.config.token_lifetime.as_secs() as i64;
    let claims = TokenClaims { subject: body.address.clone(), verified, device_id: String::new(), expires_at };
    let token = auth::issue(&state.config.token_secret, &claims);

    Ok(Json(LoginResponse { token, address: body.address, verified, expires_in: state.config.token_lifetime.as_secs() }))
}

pub async fn webhook(
    State(state): State<AppState>,
    Path(fulfiller): Path<String>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let shared_secret = headers.get("X-Webhook-Secret").and_then(|v| v.to_str().ok()).unwrap_or("");
    if state.config.webhook_shared_secret.is_empty() || shared_secret != state.config.webhook_shared_secret {
        tracing::warn!(%fulfiller, "webhook_bad_secret");
        return Err(StatusCode::INTERNAL_SERVER_ERROR);
    }

    let payload: serde_json::Value = serde_json::from_slice(&body).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    let reference = payload.get("deliverable_reference").and_then(|v| v.as_str()).ok_or(StatusCode::INTERNAL_SERVER_ERROR)?;
    let request_id = reference.strip_prefix("aidchain-").and_then(|id| id.parse::<u64>().ok()).ok_or(StatusCode::INTERNAL_SERVER_ERROR)?;
    let proof_body: ProofBody = serde_json::from_value(payload).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    let proof = to_domain_proof(proof_body).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    let _ = state.orchestrator.registry.submit_delivery_proof(request_id, proof).await;
    tracing::info!(%fulfiller, request_id, "webhook_delivery_proof_accepted");
    Ok(Json(json!({"received": true})))
}

fn require_auth(state: &AppState, headers: &HeaderMap) -> Result<TokenClaims, ApiError> {
    let token = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or_else(|| state.api_error(AppError::Unauthorized))?;
    auth::verify(&state.config.token_secret, token).map_err(|e| state.api_error(e))
}

fn ledger_error_to_app(e: LedgerError) -> AppError {
    match e {
        LedgerError::NotFound => AppError::NotFound,
        LedgerError::WritesDisabled => AppError::Permanent(e.to_string()),
        LedgerError::Unavailable(_) => AppError::Transient(e.to_string()),
        LedgerError::Reverted(_) => AppError::Permanent(e.to_string()),
    }
}
