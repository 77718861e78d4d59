//! Clearance workflow: per-department decisions, governed reapplication, request rate limits,
//! and tamper-evident certificates.
//!
//! Components are leaf-first: the rate limiter has no dependencies, the workflow engine owns
//! the aggregate state machine, the reapplication controller layers abuse controls on top, and
//! the certificate service is invoked once an application first completes.

pub mod certificate;
pub mod clock;
pub mod domain;
pub mod engine;
pub mod memory;
pub mod rate_limit;
pub mod reapply;
pub mod repository;
pub mod router;
pub mod service;

#[cfg(test)]
mod tests;

pub use certificate::{
    CertificateError, CertificateIntegrityService, CertificateSettings, QrPayload,
    VerificationFailure, VerificationResult, VerifiedCertificate,
};
pub use clock::{Clock, SystemClock};
pub use domain::{
    ActorId, ApplicantFacts, ApplicationId, ApplicationState, ApplicationStatusView,
    CertificateFacts, CertificateRecord, ClearanceApplication, Decision, DepartmentDecisionStatus,
    DepartmentName, DepartmentStatus, EditableField, FieldChange, ReapplicationHistoryEntry,
    ReapplyTarget, VerificationAttempt, VerificationOutcome,
};
pub use engine::{BulkDecisionOutcome, DecisionInput, WorkflowError, WorkflowStatusEngine};
pub use memory::{InMemoryClearanceRepository, InMemoryNotificationPublisher};
pub use rate_limit::{
    spawn_sweeper, FixedWindowRateLimiter, LimitDecision, RateLimitError, RateLimitPolicies,
    RateLimitPolicy, RateLimiter, ScopeKind,
};
pub use reapply::{
    DepartmentEligibility, ReapplicationController, ReapplicationPolicy, ReapplicationResult,
    ReapplicationValidator, ReapplyEligibility, ReapplyError, ReapplyRequest, ResetScope,
    StandardValidator,
};
pub use repository::{
    ClearanceNotice, ClearanceRepository, NotificationPublisher, NotifyError, RepositoryError,
};
pub use router::{
    clearance_router, client_key, error_response, BulkDecisionRequest, VerifyRequest,
};
pub use service::{ClearanceService, ClearanceServiceError};
