use crate::infra::{default_departments, AppState};
use axum::extract::State;
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use clearance::workflows::clearance::{
    clearance_router, client_key, error_response, ApplicantFacts, ClearanceRepository,
    ClearanceService, DepartmentName, NotificationPublisher, ScopeKind,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::warn;

/// Intake body: applicant facts plus an optional department list.
#[derive(Debug, Deserialize)]
pub(crate) struct IntakeRequest {
    #[serde(flatten)]
    pub(crate) facts: ApplicantFacts,
    #[serde(default)]
    pub(crate) departments: Vec<DepartmentName>,
}

pub(crate) fn with_clearance_routes<R, N>(service: Arc<ClearanceService<R, N>>) -> Router
where
    R: ClearanceRepository + 'static,
    N: NotificationPublisher + 'static,
{
    let intake = Router::new()
        .route(
            "/api/v1/clearance/applications",
            post(intake_endpoint::<R, N>),
        )
        .with_state(service.clone());

    clearance_router(service)
        .merge(intake)
        .route("/health", get(healthcheck))
        .route("/ready", get(readiness_endpoint))
        .route("/metrics", get(metrics_endpoint))
}

pub(crate) async fn healthcheck() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

pub(crate) async fn readiness_endpoint(Extension(state): Extension<AppState>) -> impl IntoResponse {
    let ready = state.readiness.load(std::sync::atomic::Ordering::Relaxed);
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let payload = if ready {
        json!({ "status": "ready" })
    } else {
        json!({ "status": "initializing" })
    };

    (status, Json(payload))
}

pub(crate) async fn metrics_endpoint(Extension(state): Extension<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}

/// Opens a clearance application. Submissions are throttled per client under the submission policy.
pub(crate) async fn intake_endpoint<R, N>(
    State(service): State<Arc<ClearanceService<R, N>>>,
    headers: HeaderMap,
    Json(request): Json<IntakeRequest>,
) -> Response
where
    R: ClearanceRepository + 'static,
    N: NotificationPublisher + 'static,
{
    let client = client_key(&headers)
        .unwrap_or_else(|| request.facts.registration_no.trim().to_ascii_uppercase());

    let policy = service.rate_limits().submission;
    let admission = service
        .limiter()
        .admit(ScopeKind::Submission, &client, &policy);
    if !admission.allowed {
        let secs = admission.retry_after_secs().max(1);
        warn!(client = %client, retry_after_secs = secs, "clearance submission throttled");
        let mut response = (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({
                "error": "too many submissions",
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

    let departments = if request.departments.is_empty() {
        default_departments()
    } else {
        request.departments
    };

    match service.open_application(request.facts, departments) {
        Ok(application) => (StatusCode::CREATED, Json(application.status_view())).into_response(),
        Err(err) => error_response(err),
    }
}
