// C8: External Surface. Thin HTTP + WebSocket layer over the orchestrator
// and ledger adapter (spec §4.8, wire contract in spec §6).

pub mod auth;
pub mod handlers;
pub mod ws;

use axum::extract::DefaultBodyLimit;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::error::AppError;
use crate::pipeline::stages::Orchestrator;

const MAX_BODY_BYTES: usize = 64 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub orchestrator: Orchestrator,
    pub next_request_id: Arc<AtomicU64>,
}

impl AppState {
    pub fn api_error(&self, err: AppError) -> ApiError {
        ApiError { err, production: self.config.production }
    }
}

/// Wraps an `AppError` with the flag that decides whether the raw cause is
/// echoed back to the caller (spec §7: `details` only in non-production).
pub struct ApiError {
    pub err: AppError,
    pub production: bool,
}

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: safe_message(&self.err),
            details: if self.production { None } else { Some(self.err.to_string()) },
        };
        (self.err.status(), Json(body)).into_response()
    }
}

fn safe_message(e: &AppError) -> &'static str {
    match e {
        AppError::Validation(_) => "invalid_request",
        AppError::Attestation { .. } => "attestation_failed",
        AppError::Transient(_) => "dependency_unavailable",
        AppError::Permanent(_) => "dependency_fault",
        AppError::Internal(_) => "internal_error",
        AppError::NotFound => "not_found",
        AppError::Unauthorized => "unauthorized",
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/requests", post(handlers::submit_request))
        .route("/api/requests/user/:addr", get(handlers::get_user_requests))
        .route("/api/requests/:id", get(handlers::get_request))
        .route("/api/requests/:id/pipeline", get(handlers::get_pipeline))
        .route("/api/delivery/confirm", post(handlers::confirm_delivery))
        .route("/api/fund/stats", get(handlers::fund_stats))
        .route("/api/pipeline/active", get(handlers::active_pipelines))
        .route("/api/auth/login", post(handlers::login))
        .route("/api/webhooks/:fulfiller", post(handlers::webhook))
        .route("/ws", get(ws::handler))
        .route("/health", get(handlers::health))
        .route("/ready", get(handlers::ready))
        .route("/metrics", get(handlers::metrics))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CompressionLayer::new())
                .layer(CorsLayer::permissive())
                .layer(DefaultBodyLimit::max(MAX_BODY_BYTES)),
        )
}
