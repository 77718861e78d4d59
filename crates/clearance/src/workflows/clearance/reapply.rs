use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::clock::Clock;
use super::domain::{
    ApplicantFacts, ApplicationId, ApplicationState, ClearanceApplication, DepartmentName,
    EditableField, FieldChange, ReapplicationHistoryEntry, ReapplyTarget,
};
use super::engine::{recompute_aggregate, DEFAULT_MAX_ATTEMPTS};
use super::rate_limit::{RateLimitPolicies, RateLimiter, ScopeKind};
use super::repository::{
    ClearanceNotice, ClearanceRepository, NotificationPublisher, RepositoryError,
};

/// Which department rows a reapplication resets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResetScope {
    /// Only the department named in the request (every decided row when the target is `all`).
    TargetedDepartment,
    /// Every decided row, whatever the target.
    AllDepartments,
}

impl ResetScope {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "targeted" | "department" | "targeted_department" => Some(Self::TargetedDepartment),
            "all" | "all_departments" => Some(Self::AllDepartments),
            _ => None,
        }
    }
}

/// Abuse controls and eligibility switches for reapplication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReapplicationPolicy {
    pub cooldown: Duration,
    pub min_reason_chars: usize,
    pub max_reapplications: u32,
    pub max_department_reapplications: u32,
    pub reset_scope: ResetScope,
    /// Allow reopening an application that already completed.
    pub allow_completed: bool,
    /// Allow reopening a pending application on which some department has already acted.
    pub allow_in_progress: bool,
    pub limits: RateLimitPolicies,
}

impl Default for ReapplicationPolicy {
    fn default() -> Self {
        Self {
            cooldown: Duration::from_secs(24 * 60 * 60),
            min_reason_chars: 5,
            max_reapplications: 5,
            max_department_reapplications: 5,
            reset_scope: ResetScope::TargetedDepartment,
            allow_completed: true,
            allow_in_progress: true,
            limits: RateLimitPolicies::default(),
        }
    }
}

/// Student request to put an application back into the approval pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReapplyRequest {
    pub target: ReapplyTarget,
    pub reason: String,
    #[serde(default)]
    pub edited_fields: BTreeMap<EditableField, String>,
    /// Key for the global limiter, normally the authenticated actor. Falls back to the
    /// registration number when empty.
    #[serde(default)]
    pub actor_scope: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReapplicationResult {
    pub application_id: ApplicationId,
    pub state: ApplicationState,
    pub reapplication_count: u32,
    pub reset_departments: Vec<DepartmentName>,
    pub edited_fields: Vec<FieldChange>,
}

/// Per-department view of what a student may reapply for right now.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DepartmentEligibility {
    pub department: DepartmentName,
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rejection_reason: Option<String>,
    pub reapplications_used: u32,
    pub reapplications_remaining: u32,
    pub can_reapply: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReapplyEligibility {
    pub application_id: ApplicationId,
    pub state: ApplicationState,
    pub reapplication_count: u32,
    pub reapplications_remaining: u32,
    pub cooldown_remaining_secs: u64,
    pub departments: Vec<DepartmentEligibility>,
}

#[derive(Debug, thiserror::Error)]
pub enum ReapplyError {
    #[error("application {0} not found")]
    NotFound(ApplicationId),
    #[error("department {0} has no status row on this application")]
    DepartmentNotFound(DepartmentName),
    #[error("application cannot be reapplied: {0}")]
    InvalidState(String),
    #[error("too many reapply requests ({scope}), retry in {retry_after_secs}s")]
    RateLimited {
        scope: ScopeKind,
        retry_after_secs: u64,
    },
    #[error("reapplication cooldown active, {remaining_secs}s remaining")]
    CooldownActive { remaining_secs: u64 },
    #[error("reapplication limit of {limit} reached for {scope}")]
    LimitReached { limit: u32, scope: String },
    #[error("{0}")]
    ValidationFailed(String),
    #[error("application is being updated concurrently, gave up after {attempts} attempts")]
    Conflict { attempts: u32 },
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

/// Domain checks on the reason text and corrected fields.
pub trait ReapplicationValidator: Send + Sync {
    fn validate(&self, request: &ReapplyRequest) -> Result<(), String>;
}

/// Length and shape rules applied to every reapplication.
#[derive(Debug, Clone)]
pub struct StandardValidator {
    min_reason_chars: usize,
}

impl StandardValidator {
    pub fn new(min_reason_chars: usize) -> Self {
        Self { min_reason_chars }
    }
}

impl ReapplicationValidator for StandardValidator {
    fn validate(&self, request: &ReapplyRequest) -> Result<(), String> {
        let reason_chars = request.reason.trim().chars().count();
        if reason_chars < self.min_reason_chars {
            return Err(format!(
                "reason must be at least {} characters",
                self.min_reason_chars
            ));
        }

        for (field, value) in &request.edited_fields {
            let value = value.trim();
            if value.is_empty() {
                return Err(format!("{} cannot be empty", field.label()));
            }
            let valid = match field {
                EditableField::PersonalEmail | EditableField::CollegeEmail => is_email(value),
                EditableField::ContactNo => {
                    (6..=15).contains(&value.len()) && value.chars().all(|c| c.is_ascii_digit())
                }
                EditableField::AdmissionYear | EditableField::PassingYear => {
                    value.len() == 4 && value.chars().all(|c| c.is_ascii_digit())
                }
                EditableField::CountryCode => {
                    let digits = value.strip_prefix('+').unwrap_or(value);
                    (1..=4).contains(&digits.len()) && digits.chars().all(|c| c.is_ascii_digit())
                }
                _ => value.chars().count() <= 120,
            };
            if !valid {
                return Err(format!("{} has an invalid value", field.label()));
            }
        }
        Ok(())
    }
}

fn is_email(value: &str) -> bool {
    match value.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && !domain.contains('@')
                && domain
                    .split_once('.')
                    .is_some_and(|(host, tld)| !host.is_empty() && !tld.is_empty())
                && !value.contains(char::is_whitespace)
        }
        None => false,
    }
}

/// Moves a rejected or reopened application back toward `pending` under rate limits, a cooldown,
/// lifetime caps, and validation, recording an audit entry for every accepted reapplication.
pub struct ReapplicationController<R, N> {
    repository: Arc<R>,
    notifier: Arc<N>,
    limiter: Arc<dyn RateLimiter>,
    validator: Arc<dyn ReapplicationValidator>,
    clock: Arc<dyn Clock>,
    policy: ReapplicationPolicy,
    max_attempts: u32,
}

impl<R, N> ReapplicationController<R, N>
where
    R: ClearanceRepository + 'static,
    N: NotificationPublisher + 'static,
{
    pub fn new(
        repository: Arc<R>,
        notifier: Arc<N>,
        limiter: Arc<dyn RateLimiter>,
        clock: Arc<dyn Clock>,
        policy: ReapplicationPolicy,
    ) -> Self {
        let validator = Arc::new(StandardValidator::new(policy.min_reason_chars));
        Self {
            repository,
            notifier,
            limiter,
            validator,
            clock,
            policy,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    pub fn with_validator(mut self, validator: Arc<dyn ReapplicationValidator>) -> Self {
        self.validator = validator;
        self
    }

    pub fn policy(&self) -> &ReapplicationPolicy {
        &self.policy
    }

    /// Reopen an application. Preconditions are checked in a fixed order and the first failure
    /// wins: eligibility, global, per-department and per-student rate limits, cooldown, lifetime
    /// caps, then validation.
    pub fn reapply(
        &self,
        application_id: &ApplicationId,
        request: &ReapplyRequest,
    ) -> Result<ReapplicationResult, ReapplyError> {
        let application = self.load(application_id)?;
        self.check_eligible(&application, &request.target)?;
        self.check_rate_limits(&application, request)?;
        let now = self.clock.now();
        self.check_cooldown(&application, now)?;
        self.check_caps(&application, &request.target)?;
        self.validator
            .validate(request)
            .map_err(ReapplyError::ValidationFailed)?;

        let mut current = application;
        for attempt in 1..=self.max_attempts {
            let (updated, entry, reset, changes) = self.prepare(current, request, now);
            match self.repository.update_with_history(updated, entry) {
                Ok(stored) => {
                    info!(
                        application_id = %application_id,
                        target = %request.target,
                        reapplication_count = stored.reapplication_count,
                        state = %stored.state,
                        "application reapplied"
                    );
                    self.notify(&stored, &request.target);
                    return Ok(ReapplicationResult {
                        application_id: stored.id.clone(),
                        state: stored.state,
                        reapplication_count: stored.reapplication_count,
                        reset_departments: reset,
                        edited_fields: changes,
                    });
                }
                Err(err) if err.is_transient() => {
                    debug!(
                        application_id = %application_id,
                        attempt,
                        error = %err,
                        "retrying reapplication"
                    );
                    // Another writer got in first; its changes may have closed the door.
                    current = self.load(application_id)?;
                    self.check_eligible(&current, &request.target)?;
                    self.check_cooldown(&current, self.clock.now())?;
                    self.check_caps(&current, &request.target)?;
                }
                Err(err) => return Err(err.into()),
            }
        }

        warn!(
            application_id = %application_id,
            attempts = self.max_attempts,
            "reapplication abandoned after repeated write conflicts"
        );
        Err(ReapplyError::Conflict {
            attempts: self.max_attempts,
        })
    }

    /// Chronological reapplication audit trail.
    pub fn history(
        &self,
        application_id: &ApplicationId,
    ) -> Result<Vec<ReapplicationHistoryEntry>, ReapplyError> {
        self.load(application_id)?;
        let mut entries = self.repository.history(application_id)?;
        entries.sort_by_key(|entry| entry.reapplication_number);
        Ok(entries)
    }

    /// What the student could reapply for right now, ignoring request-rate limits.
    pub fn eligibility(
        &self,
        application_id: &ApplicationId,
    ) -> Result<ReapplyEligibility, ReapplyError> {
        let application = self.load(application_id)?;
        let cooldown_remaining_secs = self.cooldown_remaining(&application, self.clock.now());
        let reapplications_remaining = self
            .policy
            .max_reapplications
            .saturating_sub(application.reapplication_count);
        let state_open = self.state_problem(&application).is_none();

        let departments = application
            .departments
            .iter()
            .map(|row| {
                let remaining = self
                    .policy
                    .max_department_reapplications
                    .saturating_sub(row.reapplication_count);
                DepartmentEligibility {
                    department: row.department.clone(),
                    status: row.status.label(),
                    rejection_reason: row.rejection_reason.clone(),
                    reapplications_used: row.reapplication_count,
                    reapplications_remaining: remaining,
                    can_reapply: state_open
                        && row.is_decided()
                        && cooldown_remaining_secs == 0
                        && reapplications_remaining > 0
                        && remaining > 0,
                }
            })
            .collect();

        Ok(ReapplyEligibility {
            application_id: application.id.clone(),
            state: application.state,
            reapplication_count: application.reapplication_count,
            reapplications_remaining,
            cooldown_remaining_secs,
            departments,
        })
    }

    fn load(&self, application_id: &ApplicationId) -> Result<ClearanceApplication, ReapplyError> {
        self.repository
            .fetch(application_id)?
            .ok_or_else(|| ReapplyError::NotFound(application_id.clone()))
    }

    fn state_problem(&self, application: &ClearanceApplication) -> Option<String> {
        match application.state {
            ApplicationState::Rejected => None,
            ApplicationState::Completed if self.policy.allow_completed => None,
            ApplicationState::Completed => Some("application is already completed".to_string()),
            ApplicationState::Pending if application.is_in_progress() => {
                if self.policy.allow_in_progress {
                    None
                } else {
                    Some("application is still in progress".to_string())
                }
            }
            ApplicationState::Pending => {
                Some("no department has acted on this application yet".to_string())
            }
        }
    }

    fn check_eligible(
        &self,
        application: &ClearanceApplication,
        target: &ReapplyTarget,
    ) -> Result<(), ReapplyError> {
        if let Some(problem) = self.state_problem(application) {
            return Err(ReapplyError::InvalidState(problem));
        }
        if let ReapplyTarget::Department(department) = target {
            let row = application
                .department(department)
                .ok_or_else(|| ReapplyError::DepartmentNotFound(department.clone()))?;
            if !row.is_decided() {
                return Err(ReapplyError::InvalidState(format!(
                    "{department} has not acted on this application yet"
                )));
            }
        }
        Ok(())
    }

    fn check_rate_limits(
        &self,
        application: &ClearanceApplication,
        request: &ReapplyRequest,
    ) -> Result<(), ReapplyError> {
        let department_key = format!("{}:{}", application.id, request.target);
        let actor_key = match request.actor_scope.trim() {
            "" => application.facts.registration_no.as_str(),
            actor => actor,
        };
        let checks = [
            (ScopeKind::ReapplyGlobal, actor_key),
            (ScopeKind::ReapplyPerDepartment, department_key.as_str()),
            (
                ScopeKind::ReapplyPerStudent,
                application.facts.registration_no.as_str(),
            ),
        ];

        for (scope, key) in checks {
            let policy = self.policy.limits.policy_for(scope);
            let decision = self.limiter.admit(scope, key, &policy);
            if !decision.allowed {
                let retry_after_secs = decision.retry_after_secs().max(1);
                warn!(
                    application_id = %application.id,
                    scope = scope.label(),
                    retry_after_secs,
                    "reapplication rate limited"
                );
                return Err(ReapplyError::RateLimited {
                    scope,
                    retry_after_secs,
                });
            }
        }
        Ok(())
    }

    fn cooldown_remaining(&self, application: &ClearanceApplication, now: DateTime<Utc>) -> u64 {
        let Some(last) = application.last_reapplied_at else {
            return 0;
        };
        let elapsed = (now - last).to_std().unwrap_or(Duration::ZERO);
        let remaining = self.policy.cooldown.saturating_sub(elapsed);
        remaining.as_secs() + u64::from(remaining.subsec_nanos() > 0)
    }

    fn check_cooldown(
        &self,
        application: &ClearanceApplication,
        now: DateTime<Utc>,
    ) -> Result<(), ReapplyError> {
        match self.cooldown_remaining(application, now) {
            0 => Ok(()),
            remaining_secs => {
                warn!(
                    application_id = %application.id,
                    remaining_secs,
                    "reapplication cooldown active"
                );
                Err(ReapplyError::CooldownActive { remaining_secs })
            }
        }
    }

    fn check_caps(
        &self,
        application: &ClearanceApplication,
        target: &ReapplyTarget,
    ) -> Result<(), ReapplyError> {
        if application.reapplication_count >= self.policy.max_reapplications {
            return Err(ReapplyError::LimitReached {
                limit: self.policy.max_reapplications,
                scope: "application".to_string(),
            });
        }
        for department in self.rows_to_reset(application, target) {
            let used = application
                .department(&department)
                .map(|row| row.reapplication_count)
                .unwrap_or(0);
            if used >= self.policy.max_department_reapplications {
                return Err(ReapplyError::LimitReached {
                    limit: self.policy.max_department_reapplications,
                    scope: department.0,
                });
            }
        }
        Ok(())
    }

    fn rows_to_reset(
        &self,
        application: &ClearanceApplication,
        target: &ReapplyTarget,
    ) -> Vec<DepartmentName> {
        match (self.policy.reset_scope, target) {
            (ResetScope::TargetedDepartment, ReapplyTarget::Department(department)) => {
                vec![department.clone()]
            }
            _ => application
                .departments
                .iter()
                .filter(|row| row.is_decided())
                .map(|row| row.department.clone())
                .collect(),
        }
    }

    fn prepare(
        &self,
        mut application: ClearanceApplication,
        request: &ReapplyRequest,
        now: DateTime<Utc>,
    ) -> (
        ClearanceApplication,
        ReapplicationHistoryEntry,
        Vec<DepartmentName>,
        Vec<FieldChange>,
    ) {
        let previous_statuses = application.departments.clone();
        let reset = self.rows_to_reset(&application, &request.target);
        for department in &reset {
            if let Some(row) = application.department_mut(department) {
                row.reset();
            }
        }

        let changes = apply_edits(&mut application.facts, &request.edited_fields);

        application.is_reapplication = true;
        application.reapplication_count = application.reapplication_count.saturating_add(1);
        application.last_reapplied_at = Some(now);
        recompute_aggregate(&mut application, now);

        let entry = ReapplicationHistoryEntry {
            application_id: application.id.clone(),
            reapplication_number: application.reapplication_count,
            target: request.target.clone(),
            reason: request.reason.trim().to_string(),
            previous_statuses,
            edited_fields: changes.clone(),
            created_at: now,
        };
        (application, entry, reset, changes)
    }

    fn notify(&self, application: &ClearanceApplication, target: &ReapplyTarget) {
        let notice = ClearanceNotice::new(ClearanceNotice::REAPPLIED, application.id.clone())
            .with_detail("target", target.to_string())
            .with_detail(
                "reapplication_number",
                application.reapplication_count.to_string(),
            )
            .with_detail("state", application.state.label());
        if let Err(err) = self.notifier.publish(notice) {
            warn!(application_id = %application.id, error = %err, "notification dropped");
        }
    }
}

/// Apply corrected fields, returning only the ones whose value actually changed.
fn apply_edits(
    facts: &mut ApplicantFacts,
    edits: &BTreeMap<EditableField, String>,
) -> Vec<FieldChange> {
    let mut changes = Vec::new();
    for (field, value) in edits {
        let updated = value.trim().to_string();
        let previous = facts.value_of(*field).map(str::to_string);
        if previous.as_deref() == Some(updated.as_str()) {
            continue;
        }
        facts.apply(*field, updated.clone());
        changes.push(FieldChange {
            field: *field,
            previous,
            updated,
        });
    }
    changes
}
