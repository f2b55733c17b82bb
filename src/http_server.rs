use axum::{
  extract::{Path, State},
  http::StatusCode,
  response::IntoResponse,
  routing::{get, post},
  Json, Router,
};
use governor::{Quota, RateLimiter};
use std::{num::NonZeroU32, sync::Arc};
use tracing::error;

use crate::error::ServiceError;
use crate::ledger::BroadcastClient;
use crate::mail::MailRelay;
use crate::referral::ReferralConfig;
use crate::service::Service;
use crate::store::postgres::PgRecordStore;

pub type AppService = Service<PgRecordStore, BroadcastClient, MailRelay>;

#[derive(Clone)]
pub struct AppState {
  pub svc: Arc<AppService>,
  pub referral: ReferralConfig,
  pub limiter: Arc<RateLimiter<governor::state::direct::NotKeyed, governor::state::InMemoryState, governor::clock::DefaultClock>>,
}

#[derive(serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegisterBody {
  email: String,
  address: String,
  referral_code: Option<String>,
}

#[derive(serde::Deserialize)]
struct ConfirmBody {
  email: String,
  code: String,
}

pub fn build_router(state: AppState) -> Router {
  Router::new()
    .route("/healthz", get(healthz))
    .route("/v1/register", post(register))
    .route("/v1/confirm", post(confirm))
    .route("/v1/register/stats", get(register_stats))
    .route("/v1/referral/config", get(referral_config))
    .route("/v1/referral/code/:address", get(own_referral_code))
    .route("/v1/referral/code/:address/registration", get(registration_referral_code))
    .route("/v1/referral/track/install/:address", post(track_install))
    .route("/v1/referral/track/stats/:address", get(tracking_stats))
    .with_state(state)
}

async fn healthz() -> impl IntoResponse {
  Json(serde_json::json!({"status": "ok"}))
}

async fn register(State(state): State<AppState>, Json(body): Json<RegisterBody>) -> impl IntoResponse {
  if state.limiter.check().is_err() {
    return (StatusCode::TOO_MANY_REQUESTS, Json(serde_json::json!({"error": "rate_limited"}))).into_response();
  }
  if !body.email.contains('@') || body.address.is_empty() {
    return (StatusCode::BAD_REQUEST, Json(serde_json::json!({"error": "invalid request"}))).into_response();
  }
  match state.svc.register(&body.email, &body.address, body.referral_code.as_deref()).await {
    Ok(()) => StatusCode::OK.into_response(),
    Err(err) => error_response(&err).into_response(),
  }
}

async fn confirm(State(state): State<AppState>, Json(body): Json<ConfirmBody>) -> impl IntoResponse {
  if state.limiter.check().is_err() {
    return (StatusCode::TOO_MANY_REQUESTS, Json(serde_json::json!({"error": "rate_limited"}))).into_response();
  }
  match state.svc.confirm(&body.email, &body.code).await {
    Ok(()) => StatusCode::OK.into_response(),
    Err(err) => error_response(&err).into_response(),
  }
}

async fn track_install(State(state): State<AppState>, Path(address): Path<String>) -> impl IntoResponse {
  match state.svc.track_installation(&address).await {
    Ok(()) => StatusCode::OK.into_response(),
    Err(err) => error_response(&err).into_response(),
  }
}

async fn own_referral_code(State(state): State<AppState>, Path(address): Path<String>) -> impl IntoResponse {
  match state.svc.own_referral_code(&address).await {
    Ok(code) => Json(serde_json::json!({"code": code})).into_response(),
    Err(err) => error_response(&err).into_response(),
  }
}

async fn registration_referral_code(
  State(state): State<AppState>,
  Path(address): Path<String>,
) -> impl IntoResponse {
  match state.svc.registration_referral_code(&address).await {
    Ok(code) => Json(serde_json::json!({"code": code})).into_response(),
    Err(err) => error_response(&err).into_response(),
  }
}

async fn tracking_stats(State(state): State<AppState>, Path(address): Path<String>) -> impl IntoResponse {
  match state.svc.referral_tracking_stats(&address).await {
    Ok(stats) => Json(serde_json::json!({"total": stats[0], "last30Days": stats[1]})).into_response(),
    Err(err) => error_response(&err).into_response(),
  }
}

async fn referral_config(State(state): State<AppState>) -> impl IntoResponse {
  Json(state.referral.clone())
}

async fn register_stats(State(state): State<AppState>) -> impl IntoResponse {
  match state.svc.register_stats().await {
    Ok((total, stats)) => Json(serde_json::json!({"total": total, "stats": stats})).into_response(),
    Err(err) => error_response(&err).into_response(),
  }
}

fn error_response(err: &ServiceError) -> (StatusCode, Json<serde_json::Value>) {
  let (status, message) = match err {
    ServiceError::AlreadyExists | ServiceError::AlreadyConfirmed => (StatusCode::CONFLICT, err.to_string()),
    ServiceError::NotFound | ServiceError::TrackingNotFound => (StatusCode::NOT_FOUND, err.to_string()),
    ServiceError::TooManyAttempts => (StatusCode::TOO_MANY_REQUESTS, err.to_string()),
    ServiceError::ReferralCodeNotFound => (StatusCode::UNPROCESSABLE_ENTITY, err.to_string()),
    ServiceError::InvalidTrackingStatus => (StatusCode::CONFLICT, err.to_string()),
    ServiceError::FraudEmail => (StatusCode::BAD_REQUEST, err.to_string()),
    ServiceError::Store(_) | ServiceError::Ledger(_) => {
      error!("internal error: {}", err);
      (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
    }
  };
  (status, Json(serde_json::json!({"error": message})))
}

pub fn rate_limiter(rps: u32) -> RateLimiter<governor::state::direct::NotKeyed, governor::state::InMemoryState, governor::clock::DefaultClock> {
  let rps = NonZeroU32::new(rps.max(1)).unwrap();
  RateLimiter::direct(Quota::per_second(rps))
}
