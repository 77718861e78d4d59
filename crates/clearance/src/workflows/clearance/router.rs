use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};

use super::certificate::{QrPayload, VerificationFailure, VerificationResult};
use super::domain::ApplicationId;
use super::engine::DecisionInput;
use super::rate_limit::ScopeKind;
use super::reapply::ReapplyRequest;
use super::repository::{ClearanceRepository, NotificationPublisher};
use super::service::{ClearanceService, ClearanceServiceError};

/// Body of the bulk decision endpoint: one decision applied to every listed application.
#[derive(Debug, Deserialize)]
pub struct BulkDecisionRequest {
    pub application_ids: Vec<ApplicationId>,
    #[serde(flatten)]
    pub decision: DecisionInput,
}

/// `qr_data` is either the scanned QR string or the already decoded JSON object.
#[derive(Debug, Deserialize)]
pub struct VerifyRequest {
    pub qr_data: Value,
}

/// Router builder exposing the decision, reapplication, and certificate endpoints.
pub fn clearance_router<R, N>(service: Arc<ClearanceService<R, N>>) -> Router
where
    R: ClearanceRepository + 'static,
    N: NotificationPublisher + 'static,
{
    Router::new()
        .route(
            "/api/v1/clearance/applications/:application_id",
            get(status_handler::<R, N>),
        )
        .route(
            "/api/v1/clearance/applications/:application_id/decisions",
            post(decision_handler::<R, N>),
        )
        .route(
            "/api/v1/clearance/decisions/bulk",
            post(bulk_decision_handler::<R, N>),
        )
        .route(
            "/api/v1/clearance/applications/:application_id/reapply",
            post(reapply_handler::<R, N>),
        )
        .route(
            "/api/v1/clearance/applications/:application_id/reapplications",
            get(history_handler::<R, N>),
        )
        .route(
            "/api/v1/clearance/applications/:application_id/eligibility",
            get(eligibility_handler::<R, N>),
        )
        .route(
            "/api/v1/clearance/applications/:application_id/certificate",
            post(issue_handler::<R, N>),
        )
        .route(
            "/api/v1/clearance/applications/:application_id/certificate/payload",
            get(payload_handler::<R, N>),
        )
        .route("/api/v1/certificates/verify", post(verify_handler::<R, N>))
        .route(
            "/api/v1/certificates/:application_id/verifications",
            get(verifications_handler::<R, N>),
        )
        .with_state(service)
}

/// JSON error body; rate-limit and cooldown denials also carry `Retry-After`.
pub fn error_response(err: ClearanceServiceError) -> Response {
    let status = err.status_code();
    let retry_after = err.retry_after_secs();
    let mut payload = json!({
        "error": err.to_string(),
        "code": err.code(),
    });
    if let Some(secs) = retry_after {
        payload["retry_after_secs"] = json!(secs);
    }

    let mut response = (status, Json(payload)).into_response();
    if let Some(secs) = retry_after {
        if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
            response.headers_mut().insert(header::RETRY_AFTER, value);
        }
    }
    response
}

fn respond<T: serde::Serialize>(
    status: StatusCode,
    result: Result<T, ClearanceServiceError>,
) -> Response {
    match result {
        Ok(body) => (status, Json(body)).into_response(),
        Err(err) => error_response(err),
    }
}

pub(crate) async fn status_handler<R, N>(
    State(service): State<Arc<ClearanceService<R, N>>>,
    Path(application_id): Path<String>,
) -> Response
where
    R: ClearanceRepository + 'static,
    N: NotificationPublisher + 'static,
{
    let id = ApplicationId(application_id);
    respond(
        StatusCode::OK,
        service.application(&id).map(|application| application.status_view()),
    )
}

pub(crate) async fn decision_handler<R, N>(
    State(service): State<Arc<ClearanceService<R, N>>>,
    Path(application_id): Path<String>,
    Json(input): Json<DecisionInput>,
) -> Response
where
    R: ClearanceRepository + 'static,
    N: NotificationPublisher + 'static,
{
    let id = ApplicationId(application_id);
    match service.record_decision(&id, &input) {
        Ok(state) => {
            let payload = json!({
                "application_id": id.0,
                "department": input.department,
                "state": state,
            });
            (StatusCode::OK, Json(payload)).into_response()
        }
        Err(err) => error_response(err),
    }
}

pub(crate) async fn bulk_decision_handler<R, N>(
    State(service): State<Arc<ClearanceService<R, N>>>,
    Json(request): Json<BulkDecisionRequest>,
) -> Response
where
    R: ClearanceRepository + 'static,
    N: NotificationPublisher + 'static,
{
    let outcomes = service.record_bulk_decisions(&request.application_ids, &request.decision);
    let succeeded = outcomes.iter().filter(|outcome| outcome.error.is_none()).count();
    let payload = json!({
        "succeeded": succeeded,
        "failed": outcomes.len() - succeeded,
        "results": outcomes,
    });
    (StatusCode::OK, Json(payload)).into_response()
}

pub(crate) async fn reapply_handler<R, N>(
    State(service): State<Arc<ClearanceService<R, N>>>,
    Path(application_id): Path<String>,
    Json(request): Json<ReapplyRequest>,
) -> Response
where
    R: ClearanceRepository + 'static,
    N: NotificationPublisher + 'static,
{
    let id = ApplicationId(application_id);
    respond(StatusCode::OK, service.reapply(&id, &request))
}

pub(crate) async fn history_handler<R, N>(
    State(service): State<Arc<ClearanceService<R, N>>>,
    Path(application_id): Path<String>,
) -> Response
where
    R: ClearanceRepository + 'static,
    N: NotificationPublisher + 'static,
{
    let id = ApplicationId(application_id);
    respond(StatusCode::OK, service.reapplication_history(&id))
}

pub(crate) async fn eligibility_handler<R, N>(
    State(service): State<Arc<ClearanceService<R, N>>>,
    Path(application_id): Path<String>,
) -> Response
where
    R: ClearanceRepository + 'static,
    N: NotificationPublisher + 'static,
{
    let id = ApplicationId(application_id);
    respond(StatusCode::OK, service.eligibility(&id))
}

pub(crate) async fn issue_handler<R, N>(
    State(service): State<Arc<ClearanceService<R, N>>>,
    Path(application_id): Path<String>,
) -> Response
where
    R: ClearanceRepository + 'static,
    N: NotificationPublisher + 'static,
{
    let id = ApplicationId(application_id);
    respond(StatusCode::OK, service.issue_certificate(&id))
}

pub(crate) async fn payload_handler<R, N>(
    State(service): State<Arc<ClearanceService<R, N>>>,
    Path(application_id): Path<String>,
) -> Response
where
    R: ClearanceRepository + 'static,
    N: NotificationPublisher + 'static,
{
    let id = ApplicationId(application_id);
    match service.presentation_payload(&id) {
        Ok(payload) => {
            let encoded = serde_json::to_string(&payload).unwrap_or_default();
            let body = json!({
                "payload": payload,
                "qr_data": encoded,
            });
            (StatusCode::OK, Json(body)).into_response()
        }
        Err(err) => error_response(err),
    }
}

pub(crate) async fn verify_handler<R, N>(
    State(service): State<Arc<ClearanceService<R, N>>>,
    headers: HeaderMap,
    Json(request): Json<VerifyRequest>,
) -> Response
where
    R: ClearanceRepository + 'static,
    N: NotificationPublisher + 'static,
{
    let client = client_key(&headers).unwrap_or_else(|| "anonymous".to_string());
    let limiter = service.limiter();
    let policy = service.rate_limits().read;
    let admission = limiter.admit(ScopeKind::Read, &client, &policy);
    if !admission.allowed {
        let secs = admission.retry_after_secs().max(1);
        let mut response = (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({
                "error": "too many verification requests",
                "code": "rate_limited",
                "retry_after_secs": secs,
            })),
        )
            .into_response();
        if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
            response.headers_mut().insert(header::RETRY_AFTER, value);
        }
        return response;
    }

    let result = match request.qr_data {
        Value::String(raw) => service.verify_encoded(&raw),
        object @ Value::Object(_) => match serde_json::from_value::<QrPayload>(object) {
            Ok(payload) => service.verify(&payload),
            Err(err) => Ok(malformed(format!("payload is not a certificate QR code: {err}"))),
        },
        _ => Ok(malformed("qr_data must be a string or an object".to_string())),
    };

    match result {
        Ok(outcome) => {
            let status = if outcome.reason == Some(VerificationFailure::Malformed) {
                StatusCode::BAD_REQUEST
            } else {
                StatusCode::OK
            };
            (status, Json(outcome)).into_response()
        }
        Err(err) => error_response(err),
    }
}

pub(crate) async fn verifications_handler<R, N>(
    State(service): State<Arc<ClearanceService<R, N>>>,
    Path(application_id): Path<String>,
) -> Response
where
    R: ClearanceRepository + 'static,
    N: NotificationPublisher + 'static,
{
    let id = ApplicationId(application_id);
    respond(StatusCode::OK, service.verification_history(&id))
}

fn malformed(message: String) -> VerificationResult {
    VerificationResult {
        valid: false,
        reason: Some(VerificationFailure::Malformed),
        message,
        tampered_fields: Vec::new(),
        verification_count: None,
        certificate: None,
    }
}

/// First `x-forwarded-for` hop, used as the rate-limit key for unauthenticated callers.
pub fn client_key(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
