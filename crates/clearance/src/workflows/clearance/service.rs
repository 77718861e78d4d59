use std::sync::Arc;

use axum::http::StatusCode;

use crate::config::ClearanceConfig;

use super::certificate::{
    CertificateError, CertificateIntegrityService, QrPayload, VerificationResult,
};
use super::clock::Clock;
use super::domain::{
    ApplicantFacts, ApplicationId, ApplicationState, CertificateRecord, ClearanceApplication,
    DepartmentName, ReapplicationHistoryEntry, VerificationAttempt,
};
use super::engine::{BulkDecisionOutcome, DecisionInput, WorkflowError, WorkflowStatusEngine};
use super::rate_limit::{RateLimitPolicies, RateLimiter};
use super::reapply::{
    ReapplicationController, ReapplicationPolicy, ReapplicationResult, ReapplyEligibility,
    ReapplyError, ReapplyRequest,
};
use super::repository::{ClearanceRepository, NotificationPublisher, RepositoryError};

/// Facade wiring the workflow engine, reapplication controller, and certificate service over
/// one repository.
pub struct ClearanceService<R, N> {
    repository: Arc<R>,
    engine: WorkflowStatusEngine<R, N>,
    reapplication: ReapplicationController<R, N>,
    certificates: Arc<CertificateIntegrityService<R>>,
    limiter: Arc<dyn RateLimiter>,
    clock: Arc<dyn Clock>,
}

impl<R, N> ClearanceService<R, N>
where
    R: ClearanceRepository + 'static,
    N: NotificationPublisher + 'static,
{
    pub fn new(
        repository: Arc<R>,
        notifier: Arc<N>,
        limiter: Arc<dyn RateLimiter>,
        clock: Arc<dyn Clock>,
        config: &ClearanceConfig,
    ) -> Self {
        let certificates = Arc::new(CertificateIntegrityService::new(
            repository.clone(),
            clock.clone(),
            config.certificate.clone(),
        ));
        let engine = WorkflowStatusEngine::new(
            repository.clone(),
            notifier.clone(),
            certificates.clone(),
            clock.clone(),
        );
        let reapplication = ReapplicationController::new(
            repository.clone(),
            notifier,
            limiter.clone(),
            clock.clone(),
            config.reapplication.clone(),
        );

        Self {
            repository,
            engine,
            reapplication,
            certificates,
            limiter,
            clock,
        }
    }

    pub fn limiter(&self) -> Arc<dyn RateLimiter> {
        self.limiter.clone()
    }

    pub fn reapplication_policy(&self) -> &ReapplicationPolicy {
        self.reapplication.policy()
    }

    /// Named request-rate policies, including the ones applied at the HTTP edge.
    pub fn rate_limits(&self) -> &RateLimitPolicies {
        &self.reapplication.policy().limits
    }

    /// Create an application with one pending row per department.
    pub fn open_application(
        &self,
        facts: ApplicantFacts,
        departments: Vec<DepartmentName>,
    ) -> Result<ClearanceApplication, ClearanceServiceError> {
        if facts.identity_id.trim().is_empty()
            || facts.registration_no.trim().is_empty()
            || facts.full_name.trim().is_empty()
        {
            return Err(ClearanceServiceError::Invalid(
                "identity id, registration number and name are required".to_string(),
            ));
        }
        if departments.is_empty() {
            return Err(ClearanceServiceError::Invalid(
                "at least one department is required".to_string(),
            ));
        }

        let application = ClearanceApplication::open(facts, departments, self.clock.now());
        let stored = self.repository.insert(application)?;
        tracing::info!(
            application_id = %stored.id,
            departments = stored.departments.len(),
            "clearance application opened"
        );
        Ok(stored)
    }

    pub fn application(
        &self,
        application_id: &ApplicationId,
    ) -> Result<ClearanceApplication, ClearanceServiceError> {
        self.repository
            .fetch(application_id)?
            .ok_or_else(|| ClearanceServiceError::NotFound(application_id.clone()))
    }

    pub fn application_by_registration(
        &self,
        registration_no: &str,
    ) -> Result<Option<ClearanceApplication>, ClearanceServiceError> {
        Ok(self.repository.fetch_by_registration(registration_no)?)
    }

    pub fn record_decision(
        &self,
        application_id: &ApplicationId,
        input: &DecisionInput,
    ) -> Result<ApplicationState, ClearanceServiceError> {
        Ok(self.engine.record_decision(application_id, input)?)
    }

    pub fn record_bulk_decisions(
        &self,
        application_ids: &[ApplicationId],
        input: &DecisionInput,
    ) -> Vec<BulkDecisionOutcome> {
        self.engine.record_bulk_decisions(application_ids, input)
    }

    pub fn reapply(
        &self,
        application_id: &ApplicationId,
        request: &ReapplyRequest,
    ) -> Result<ReapplicationResult, ClearanceServiceError> {
        Ok(self.reapplication.reapply(application_id, request)?)
    }

    pub fn reapplication_history(
        &self,
        application_id: &ApplicationId,
    ) -> Result<Vec<ReapplicationHistoryEntry>, ClearanceServiceError> {
        Ok(self.reapplication.history(application_id)?)
    }

    pub fn eligibility(
        &self,
        application_id: &ApplicationId,
    ) -> Result<ReapplyEligibility, ClearanceServiceError> {
        Ok(self.reapplication.eligibility(application_id)?)
    }

    pub fn issue_certificate(
        &self,
        application_id: &ApplicationId,
    ) -> Result<CertificateRecord, ClearanceServiceError> {
        Ok(self.certificates.issue(application_id)?)
    }

    pub fn certificate(
        &self,
        application_id: &ApplicationId,
    ) -> Result<Option<CertificateRecord>, ClearanceServiceError> {
        Ok(self.certificates.certificate(application_id)?)
    }

    pub fn presentation_payload(
        &self,
        application_id: &ApplicationId,
    ) -> Result<QrPayload, ClearanceServiceError> {
        Ok(self.certificates.presentation_payload(application_id)?)
    }

    pub fn verify(&self, payload: &QrPayload) -> Result<VerificationResult, ClearanceServiceError> {
        Ok(self.certificates.verify(payload)?)
    }

    pub fn verify_encoded(&self, raw: &str) -> Result<VerificationResult, ClearanceServiceError> {
        Ok(self.certificates.verify_encoded(raw)?)
    }

    pub fn verification_history(
        &self,
        application_id: &ApplicationId,
    ) -> Result<Vec<VerificationAttempt>, ClearanceServiceError> {
        Ok(self.certificates.verification_history(application_id)?)
    }
}

/// Error raised by the clearance service.
#[derive(Debug, thiserror::Error)]
pub enum ClearanceServiceError {
    #[error("application {0} not found")]
    NotFound(ApplicationId),
    #[error("{0}")]
    Invalid(String),
    #[error(transparent)]
    Workflow(#[from] WorkflowError),
    #[error(transparent)]
    Reapply(#[from] ReapplyError),
    #[error(transparent)]
    Certificate(#[from] CertificateError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

impl ClearanceServiceError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ClearanceServiceError::NotFound(_) => StatusCode::NOT_FOUND,
            ClearanceServiceError::Invalid(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ClearanceServiceError::Workflow(err) => match err {
                WorkflowError::ApplicationNotFound(_) | WorkflowError::DepartmentNotFound(_) => {
                    StatusCode::NOT_FOUND
                }
                WorkflowError::InvalidTransition { .. } | WorkflowError::Conflict { .. } => {
                    StatusCode::CONFLICT
                }
                WorkflowError::ValidationFailed(_) => StatusCode::UNPROCESSABLE_ENTITY,
                WorkflowError::Repository(err) => repository_status(err),
                WorkflowError::Certificate(err) => certificate_status(err),
            },
            ClearanceServiceError::Reapply(err) => match err {
                ReapplyError::NotFound(_) | ReapplyError::DepartmentNotFound(_) => {
                    StatusCode::NOT_FOUND
                }
                ReapplyError::InvalidState(_)
                | ReapplyError::LimitReached { .. }
                | ReapplyError::Conflict { .. } => StatusCode::CONFLICT,
                ReapplyError::RateLimited { .. } | ReapplyError::CooldownActive { .. } => {
                    StatusCode::TOO_MANY_REQUESTS
                }
                ReapplyError::ValidationFailed(_) => StatusCode::UNPROCESSABLE_ENTITY,
                ReapplyError::Repository(err) => repository_status(err),
            },
            ClearanceServiceError::Certificate(err) => certificate_status(err),
            ClearanceServiceError::Repository(err) => repository_status(err),
        }
    }

    /// Machine-readable label so callers can tell which constraint failed.
    pub fn code(&self) -> &'static str {
        match self {
            ClearanceServiceError::NotFound(_) => "not_found",
            ClearanceServiceError::Invalid(_) => "validation_failed",
            ClearanceServiceError::Workflow(err) => match err {
                WorkflowError::ApplicationNotFound(_) | WorkflowError::DepartmentNotFound(_) => {
                    "not_found"
                }
                WorkflowError::InvalidTransition { .. } => "invalid_transition",
                WorkflowError::ValidationFailed(_) => "validation_failed",
                WorkflowError::Conflict { .. } => "conflict",
                WorkflowError::Repository(_) => "repository",
                WorkflowError::Certificate(_) => "certificate",
            },
            ClearanceServiceError::Reapply(err) => match err {
                ReapplyError::NotFound(_) | ReapplyError::DepartmentNotFound(_) => "not_found",
                ReapplyError::InvalidState(_) => "invalid_state",
                ReapplyError::RateLimited { .. } => "rate_limited",
                ReapplyError::CooldownActive { .. } => "cooldown_active",
                ReapplyError::LimitReached { .. } => "limit_reached",
                ReapplyError::ValidationFailed(_) => "validation_failed",
                ReapplyError::Conflict { .. } => "conflict",
                ReapplyError::Repository(_) => "repository",
            },
            ClearanceServiceError::Certificate(err) => match err {
                CertificateError::NotFound(_) | CertificateError::NotIssued(_) => "not_found",
                CertificateError::NotCompleted { .. } => "invalid_state",
                CertificateError::Encoding(_) | CertificateError::Repository(_) => "certificate",
            },
            ClearanceServiceError::Repository(RepositoryError::Conflict) => "conflict",
            ClearanceServiceError::Repository(_) => "repository",
        }
    }

    /// Seconds the caller should wait before retrying, for rate-limit and cooldown denials.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            ClearanceServiceError::Reapply(ReapplyError::RateLimited {
                retry_after_secs, ..
            }) => Some(*retry_after_secs),
            ClearanceServiceError::Reapply(ReapplyError::CooldownActive { remaining_secs }) => {
                Some(*remaining_secs)
            }
            _ => None,
        }
    }
}

fn repository_status(err: &RepositoryError) -> StatusCode {
    match err {
        RepositoryError::NotFound => StatusCode::NOT_FOUND,
        RepositoryError::Conflict | RepositoryError::VersionConflict { .. } => StatusCode::CONFLICT,
        RepositoryError::Timeout(_) | RepositoryError::Unavailable(_) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

fn certificate_status(err: &CertificateError) -> StatusCode {
    match err {
        CertificateError::NotFound(_) | CertificateError::NotIssued(_) => StatusCode::NOT_FOUND,
        CertificateError::NotCompleted { .. } => StatusCode::CONFLICT,
        CertificateError::Encoding(_) => StatusCode::INTERNAL_SERVER_ERROR,
        CertificateError::Repository(err) => repository_status(err),
    }
}
