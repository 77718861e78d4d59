use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::certificate::{CertificateError, CertificateIntegrityService};
use super::clock::Clock;
use super::domain::{
    ActorId, ApplicationId, ApplicationState, CertificateRecord, ClearanceApplication, Decision,
    DepartmentDecisionStatus, DepartmentName,
};
use super::repository::{
    ClearanceNotice, ClearanceRepository, NotificationPublisher, RepositoryError,
};

pub(crate) const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// One department's action on an application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionInput {
    pub department: DepartmentName,
    pub decision: Decision,
    pub actor: ActorId,
    /// Required when rejecting.
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub remarks: Option<String>,
}

/// Per-application result of a bulk decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BulkDecisionOutcome {
    pub application_id: ApplicationId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<ApplicationState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("application {0} not found")]
    ApplicationNotFound(ApplicationId),
    #[error("department {0} has no status row on this application")]
    DepartmentNotFound(DepartmentName),
    #[error(
        "department {department} already recorded {current}, refusing to change it to {requested:?}"
    )]
    InvalidTransition {
        department: DepartmentName,
        current: DepartmentDecisionStatus,
        requested: Decision,
    },
    #[error("{0}")]
    ValidationFailed(String),
    #[error("application is being updated concurrently, gave up after {attempts} attempts")]
    Conflict { attempts: u32 },
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error(transparent)]
    Certificate(#[from] CertificateError),
}

/// Re-derive the aggregate state after the department rows changed.
pub(crate) fn recompute_aggregate(application: &mut ClearanceApplication, now: DateTime<Utc>) {
    application.state = application.derived_state();
    application.updated_at = now;
}

/// Applies department decisions and keeps the aggregate state consistent with the rows.
pub struct WorkflowStatusEngine<R, N> {
    repository: Arc<R>,
    notifier: Arc<N>,
    certificates: Arc<CertificateIntegrityService<R>>,
    clock: Arc<dyn Clock>,
    max_attempts: u32,
}

impl<R, N> WorkflowStatusEngine<R, N>
where
    R: ClearanceRepository + 'static,
    N: NotificationPublisher + 'static,
{
    pub fn new(
        repository: Arc<R>,
        notifier: Arc<N>,
        certificates: Arc<CertificateIntegrityService<R>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            repository,
            notifier,
            certificates,
            clock,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Record a department decision and return the resulting aggregate state.
    ///
    /// Repeating the stored decision is a no-op. The row update and the aggregate recompute are
    /// committed as one versioned write; stale reads are retried a bounded number of times.
    pub fn record_decision(
        &self,
        application_id: &ApplicationId,
        input: &DecisionInput,
    ) -> Result<ApplicationState, WorkflowError> {
        let reason = validate_decision(input)?;

        for attempt in 1..=self.max_attempts {
            let mut application = self
                .repository
                .fetch(application_id)?
                .ok_or_else(|| WorkflowError::ApplicationNotFound(application_id.clone()))?;
            let previous_state = application.state;
            let now = self.clock.now();

            let row = application
                .department_mut(&input.department)
                .ok_or_else(|| WorkflowError::DepartmentNotFound(input.department.clone()))?;

            if row.status == input.decision.status() {
                debug!(
                    application_id = %application_id,
                    department = %input.department,
                    "decision already recorded"
                );
                if application.state == ApplicationState::Completed
                    && self.repository.certificate(application_id)?.is_none()
                {
                    self.secure_certificate(application_id);
                }
                return Ok(application.state);
            }
            if row.status != DepartmentDecisionStatus::Pending {
                return Err(WorkflowError::InvalidTransition {
                    department: input.department.clone(),
                    current: row.status,
                    requested: input.decision,
                });
            }

            row.status = input.decision.status();
            row.action_by = Some(input.actor.clone());
            row.action_at = Some(now);
            row.rejection_reason = reason.clone();
            row.remarks = input
                .remarks
                .as_ref()
                .map(|remarks| remarks.trim().to_string())
                .filter(|remarks| !remarks.is_empty());
            recompute_aggregate(&mut application, now);

            match self.repository.update(application) {
                Ok(stored) => {
                    info!(
                        application_id = %application_id,
                        department = %input.department,
                        decision = ?input.decision,
                        state = %stored.state,
                        "department decision recorded"
                    );
                    self.after_commit(previous_state, &stored, input);
                    return Ok(stored.state);
                }
                Err(err) if err.is_transient() => {
                    debug!(
                        application_id = %application_id,
                        attempt,
                        error = %err,
                        "retrying department decision"
                    );
                }
                Err(err) => return Err(err.into()),
            }
        }

        warn!(
            application_id = %application_id,
            attempts = self.max_attempts,
            "department decision abandoned after repeated write conflicts"
        );
        Err(WorkflowError::Conflict {
            attempts: self.max_attempts,
        })
    }

    /// Apply one decision to many applications. A failure is reported per application.
    pub fn record_bulk_decisions(
        &self,
        application_ids: &[ApplicationId],
        input: &DecisionInput,
    ) -> Vec<BulkDecisionOutcome> {
        application_ids
            .iter()
            .map(|application_id| match self.record_decision(application_id, input) {
                Ok(state) => BulkDecisionOutcome {
                    application_id: application_id.clone(),
                    state: Some(state),
                    error: None,
                },
                Err(err) => BulkDecisionOutcome {
                    application_id: application_id.clone(),
                    state: None,
                    error: Some(err.to_string()),
                },
            })
            .collect()
    }

    /// Runs once the decision is durable, so nothing here may fail the call.
    fn after_commit(
        &self,
        previous_state: ApplicationState,
        stored: &ClearanceApplication,
        input: &DecisionInput,
    ) {
        let completed_now = stored.state == ApplicationState::Completed
            && previous_state != ApplicationState::Completed;
        // Only the writer that committed the completing transition gets here with `completed_now`.
        let certificate = if completed_now {
            self.issue_with_retry(&stored.id)
        } else {
            None
        };

        self.notify(
            ClearanceNotice::new(ClearanceNotice::STATUS_CHANGED, stored.id.clone())
                .with_detail("department", input.department.0.clone())
                .with_detail("decision", input.decision.status().label())
                .with_detail("state", stored.state.label()),
        );
        if let Some(record) = certificate {
            self.announce_certificate(&record);
        }
    }

    /// Issue a certificate that an earlier completing write failed to secure.
    fn secure_certificate(&self, application_id: &ApplicationId) {
        if let Some(record) = self.issue_with_retry(application_id) {
            info!(
                application_id = %application_id,
                transaction_id = %record.transaction_id,
                "deferred certificate secured"
            );
            self.announce_certificate(&record);
        }
    }

    /// Transient storage errors are retried. Any other failure leaves the application completed
    /// without a certificate until a replayed approval or an explicit issue secures it.
    fn issue_with_retry(&self, application_id: &ApplicationId) -> Option<CertificateRecord> {
        for attempt in 1..=self.max_attempts {
            match self.certificates.issue(application_id) {
                Ok(record) => return Some(record),
                Err(CertificateError::Repository(err)) if err.is_transient() => {
                    debug!(
                        application_id = %application_id,
                        attempt,
                        error = %err,
                        "retrying certificate issuance"
                    );
                }
                Err(err) => {
                    warn!(
                        application_id = %application_id,
                        error = %err,
                        "certificate issuance deferred"
                    );
                    return None;
                }
            }
        }

        warn!(
            application_id = %application_id,
            attempts = self.max_attempts,
            "certificate issuance deferred after repeated storage failures"
        );
        None
    }

    fn announce_certificate(&self, record: &CertificateRecord) {
        self.notify(
            ClearanceNotice::new(ClearanceNotice::CERTIFICATE_READY, record.application_id.clone())
                .with_detail("transaction_id", record.transaction_id.clone()),
        );
    }

    fn notify(&self, notice: ClearanceNotice) {
        let template = notice.template.clone();
        let application_id = notice.application_id.clone();
        if let Err(err) = self.notifier.publish(notice) {
            warn!(
                application_id = %application_id,
                template = %template,
                error = %err,
                "notification dropped"
            );
        }
    }
}

fn validate_decision(input: &DecisionInput) -> Result<Option<String>, WorkflowError> {
    let reason = input
        .reason
        .as_ref()
        .map(|reason| reason.trim().to_string())
        .filter(|reason| !reason.is_empty());
    match input.decision {
        Decision::Rejected if reason.is_none() => Err(WorkflowError::ValidationFailed(
            "a rejection reason is required".to_string(),
        )),
        Decision::Rejected => Ok(reason),
        Decision::Approved => Ok(None),
    }
}
