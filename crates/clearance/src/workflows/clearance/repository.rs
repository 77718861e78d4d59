use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::domain::{
    ApplicationId, CertificateRecord, ClearanceApplication, ReapplicationHistoryEntry,
    VerificationAttempt,
};

/// Storage abstraction for applications, their department rows, and the audit trails.
///
/// `update` and `update_with_history` are compare-and-swap writes: they commit only when the
/// stored `version` still equals `application.version`, bump it, and return the stored copy.
/// Department rows live inside the application, so one write covers the whole aggregate.
pub trait ClearanceRepository: Send + Sync {
    fn insert(
        &self,
        application: ClearanceApplication,
    ) -> Result<ClearanceApplication, RepositoryError>;
    fn fetch(&self, id: &ApplicationId) -> Result<Option<ClearanceApplication>, RepositoryError>;
    fn fetch_by_registration(
        &self,
        registration_no: &str,
    ) -> Result<Option<ClearanceApplication>, RepositoryError>;
    fn update(
        &self,
        application: ClearanceApplication,
    ) -> Result<ClearanceApplication, RepositoryError>;
    fn update_with_history(
        &self,
        application: ClearanceApplication,
        entry: ReapplicationHistoryEntry,
    ) -> Result<ClearanceApplication, RepositoryError>;
    fn history(&self, id: &ApplicationId)
        -> Result<Vec<ReapplicationHistoryEntry>, RepositoryError>;
    /// Unique on application id: a second insert fails with `Conflict`.
    fn insert_certificate(
        &self,
        record: CertificateRecord,
    ) -> Result<CertificateRecord, RepositoryError>;
    fn certificate(&self, id: &ApplicationId)
        -> Result<Option<CertificateRecord>, RepositoryError>;
    /// Appends the attempt and returns how many valid verifications the certificate has.
    fn record_verification(&self, attempt: VerificationAttempt) -> Result<u64, RepositoryError>;
    /// Newest first.
    fn verifications(
        &self,
        id: &ApplicationId,
        limit: usize,
    ) -> Result<Vec<VerificationAttempt>, RepositoryError>;
}

/// Error enumeration for repository failures.
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("record already exists")]
    Conflict,
    #[error("record not found")]
    NotFound,
    #[error("stale write: expected version {expected}, found {found}")]
    VersionConflict { expected: u64, found: u64 },
    #[error("repository timed out: {0}")]
    Timeout(String),
    #[error("repository unavailable: {0}")]
    Unavailable(String),
}

impl RepositoryError {
    /// Failures worth another attempt of a read-modify-write cycle.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RepositoryError::VersionConflict { .. } | RepositoryError::Timeout(_)
        )
    }
}

/// Outbound notification hook (e-mail, realtime channel). Fire-and-forget from the core's view.
pub trait NotificationPublisher: Send + Sync {
    fn publish(&self, notice: ClearanceNotice) -> Result<(), NotifyError>;
}

/// Simple notice payload so routes/tests can assert integration boundaries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClearanceNotice {
    pub template: String,
    pub application_id: ApplicationId,
    pub details: BTreeMap<String, String>,
}

impl ClearanceNotice {
    pub const STATUS_CHANGED: &'static str = "status_changed";
    pub const CERTIFICATE_READY: &'static str = "certificate_ready";
    pub const REAPPLIED: &'static str = "reapplied";

    pub fn new(template: &str, application_id: ApplicationId) -> Self {
        Self {
            template: template.to_string(),
            application_id,
            details: BTreeMap::new(),
        }
    }

    pub fn with_detail(mut self, key: &str, value: impl Into<String>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }
}

/// Notification dispatch error.
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("notification transport unavailable: {0}")]
    Transport(String),
}
