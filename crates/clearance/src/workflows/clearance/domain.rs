use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier wrapper for clearance applications.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ApplicationId(pub String);

impl ApplicationId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl fmt::Display for ApplicationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Organizational unit that independently signs off an application (library, hostel, accounts).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DepartmentName(pub String);

impl DepartmentName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }
}

impl fmt::Display for DepartmentName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Staff member or student acting on an application.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActorId(pub String);

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Aggregate state derived from every department row. Never set directly by a department.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplicationState {
    Pending,
    Rejected,
    Completed,
}

impl ApplicationState {
    pub const fn label(self) -> &'static str {
        match self {
            ApplicationState::Pending => "pending",
            ApplicationState::Rejected => "rejected",
            ApplicationState::Completed => "completed",
        }
    }
}

impl fmt::Display for ApplicationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Status of one department's row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DepartmentDecisionStatus {
    Pending,
    Approved,
    Rejected,
}

impl DepartmentDecisionStatus {
    pub const fn label(self) -> &'static str {
        match self {
            DepartmentDecisionStatus::Pending => "pending",
            DepartmentDecisionStatus::Approved => "approved",
            DepartmentDecisionStatus::Rejected => "rejected",
        }
    }
}

impl fmt::Display for DepartmentDecisionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Decision a department may record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Approved,
    Rejected,
}

impl Decision {
    pub const fn status(self) -> DepartmentDecisionStatus {
        match self {
            Decision::Approved => DepartmentDecisionStatus::Approved,
            Decision::Rejected => DepartmentDecisionStatus::Rejected,
        }
    }
}

/// One row per (application, department) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepartmentStatus {
    pub department: DepartmentName,
    pub status: DepartmentDecisionStatus,
    pub action_by: Option<ActorId>,
    pub action_at: Option<DateTime<Utc>>,
    pub rejection_reason: Option<String>,
    pub remarks: Option<String>,
    /// Number of times a reapplication has reset this row.
    pub reapplication_count: u32,
}

impl DepartmentStatus {
    pub fn pending(department: DepartmentName) -> Self {
        Self {
            department,
            status: DepartmentDecisionStatus::Pending,
            action_by: None,
            action_at: None,
            rejection_reason: None,
            remarks: None,
            reapplication_count: 0,
        }
    }

    pub fn is_decided(&self) -> bool {
        self.status != DepartmentDecisionStatus::Pending
    }

    pub(crate) fn reset(&mut self) {
        self.status = DepartmentDecisionStatus::Pending;
        self.action_by = None;
        self.action_at = None;
        self.rejection_reason = None;
        self.remarks = None;
        self.reapplication_count = self.reapplication_count.saturating_add(1);
    }
}

/// Fields a student may correct while reapplying. Identity fields are deliberately absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EditableField {
    #[serde(rename = "student_name", alias = "full_name")]
    FullName,
    ParentName,
    AdmissionYear,
    PassingYear,
    School,
    Course,
    Branch,
    CountryCode,
    ContactNo,
    PersonalEmail,
    CollegeEmail,
}

impl EditableField {
    pub const fn label(self) -> &'static str {
        match self {
            EditableField::FullName => "student_name",
            EditableField::ParentName => "parent_name",
            EditableField::AdmissionYear => "admission_year",
            EditableField::PassingYear => "passing_year",
            EditableField::School => "school",
            EditableField::Course => "course",
            EditableField::Branch => "branch",
            EditableField::CountryCode => "country_code",
            EditableField::ContactNo => "contact_no",
            EditableField::PersonalEmail => "personal_email",
            EditableField::CollegeEmail => "college_email",
        }
    }
}

/// Identity and academic facts captured at submission time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicantFacts {
    pub identity_id: String,
    pub registration_no: String,
    pub full_name: String,
    #[serde(default)]
    pub parent_name: Option<String>,
    pub school: String,
    pub course: String,
    pub branch: String,
    #[serde(default)]
    pub admission_year: Option<String>,
    #[serde(default)]
    pub passing_year: Option<String>,
    #[serde(default)]
    pub country_code: Option<String>,
    #[serde(default)]
    pub contact_no: Option<String>,
    #[serde(default)]
    pub personal_email: Option<String>,
    #[serde(default)]
    pub college_email: Option<String>,
}

impl ApplicantFacts {
    pub fn value_of(&self, field: EditableField) -> Option<&str> {
        match field {
            EditableField::FullName => Some(self.full_name.as_str()),
            EditableField::ParentName => self.parent_name.as_deref(),
            EditableField::AdmissionYear => self.admission_year.as_deref(),
            EditableField::PassingYear => self.passing_year.as_deref(),
            EditableField::School => Some(self.school.as_str()),
            EditableField::Course => Some(self.course.as_str()),
            EditableField::Branch => Some(self.branch.as_str()),
            EditableField::CountryCode => self.country_code.as_deref(),
            EditableField::ContactNo => self.contact_no.as_deref(),
            EditableField::PersonalEmail => self.personal_email.as_deref(),
            EditableField::CollegeEmail => self.college_email.as_deref(),
        }
    }

    pub fn apply(&mut self, field: EditableField, value: String) {
        match field {
            EditableField::FullName => self.full_name = value,
            EditableField::ParentName => self.parent_name = Some(value),
            EditableField::AdmissionYear => self.admission_year = Some(value),
            EditableField::PassingYear => self.passing_year = Some(value),
            EditableField::School => self.school = value,
            EditableField::Course => self.course = value,
            EditableField::Branch => self.branch = value,
            EditableField::CountryCode => self.country_code = Some(value),
            EditableField::ContactNo => self.contact_no = Some(value),
            EditableField::PersonalEmail => self.personal_email = Some(value),
            EditableField::CollegeEmail => self.college_email = Some(value),
        }
    }
}

/// One student submission spanning every department.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClearanceApplication {
    pub id: ApplicationId,
    pub facts: ApplicantFacts,
    pub state: ApplicationState,
    pub departments: Vec<DepartmentStatus>,
    pub is_reapplication: bool,
    pub reapplication_count: u32,
    pub last_reapplied_at: Option<DateTime<Utc>>,
    /// Optimistic concurrency token, bumped by the repository on every committed write.
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ClearanceApplication {
    /// Build a fresh application with one pending row per department.
    pub fn open<I>(mut facts: ApplicantFacts, departments: I, now: DateTime<Utc>) -> Self
    where
        I: IntoIterator<Item = DepartmentName>,
    {
        facts.registration_no = normalize_registration_no(&facts.registration_no);
        let mut rows: Vec<DepartmentStatus> = Vec::new();
        for department in departments {
            if rows.iter().all(|row| row.department != department) {
                rows.push(DepartmentStatus::pending(department));
            }
        }

        Self {
            id: ApplicationId::generate(),
            facts,
            state: ApplicationState::Pending,
            departments: rows,
            is_reapplication: false,
            reapplication_count: 0,
            last_reapplied_at: None,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn department(&self, department: &DepartmentName) -> Option<&DepartmentStatus> {
        self.departments
            .iter()
            .find(|row| &row.department == department)
    }

    pub(crate) fn department_mut(
        &mut self,
        department: &DepartmentName,
    ) -> Option<&mut DepartmentStatus> {
        self.departments
            .iter_mut()
            .find(|row| &row.department == department)
    }

    pub fn derived_state(&self) -> ApplicationState {
        derive_state(&self.departments)
    }

    /// At least one department has acted while the aggregate is still pending.
    pub fn is_in_progress(&self) -> bool {
        self.state == ApplicationState::Pending
            && self.departments.iter().any(|row| row.is_decided())
    }

    pub fn status_view(&self) -> ApplicationStatusView {
        ApplicationStatusView {
            application_id: self.id.clone(),
            registration_no: self.facts.registration_no.clone(),
            state: self.state.label(),
            is_reapplication: self.is_reapplication,
            reapplication_count: self.reapplication_count,
            last_reapplied_at: self.last_reapplied_at,
            departments: self
                .departments
                .iter()
                .map(|row| DepartmentStatusView {
                    department: row.department.clone(),
                    status: row.status.label(),
                    rejection_reason: row.rejection_reason.clone(),
                    remarks: row.remarks.clone(),
                    action_at: row.action_at,
                })
                .collect(),
        }
    }
}

/// Aggregate rule: any rejection wins, then unanimous approval completes, otherwise pending.
pub fn derive_state(rows: &[DepartmentStatus]) -> ApplicationState {
    if rows
        .iter()
        .any(|row| row.status == DepartmentDecisionStatus::Rejected)
    {
        ApplicationState::Rejected
    } else if !rows.is_empty()
        && rows
            .iter()
            .all(|row| row.status == DepartmentDecisionStatus::Approved)
    {
        ApplicationState::Completed
    } else {
        ApplicationState::Pending
    }
}

pub fn normalize_registration_no(raw: &str) -> String {
    raw.trim().to_ascii_uppercase()
}

/// Which department rows a reapplication addresses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReapplyTarget {
    Department(DepartmentName),
    All,
}

impl fmt::Display for ReapplyTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReapplyTarget::Department(name) => write!(f, "{name}"),
            ReapplyTarget::All => f.write_str("all"),
        }
    }
}

/// Before/after pair for a corrected field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldChange {
    pub field: EditableField,
    pub previous: Option<String>,
    pub updated: String,
}

/// Append-only audit row written by every successful reapplication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReapplicationHistoryEntry {
    pub application_id: ApplicationId,
    pub reapplication_number: u32,
    pub target: ReapplyTarget,
    pub reason: String,
    pub previous_statuses: Vec<DepartmentStatus>,
    pub edited_fields: Vec<FieldChange>,
    pub created_at: DateTime<Utc>,
}

/// Canonical hash input. Field order is the serialization order and must not change.
///
/// `status` mirrors the live aggregate state, so it reads `completed` at issuance and any later
/// regression shows up as a changed field on verification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CertificateFacts {
    pub identity_id: String,
    pub registration_no: String,
    pub full_name: String,
    pub course: String,
    pub branch: String,
    pub status: String,
}

impl CertificateFacts {
    pub fn from_application(application: &ClearanceApplication) -> Self {
        Self {
            identity_id: application.facts.identity_id.clone(),
            registration_no: application.facts.registration_no.clone(),
            full_name: application.facts.full_name.clone(),
            course: application.facts.course.clone(),
            branch: application.facts.branch.clone(),
            status: application.state.label().to_string(),
        }
    }

    /// Names of the fields whose values differ between two snapshots.
    pub fn diff(&self, other: &CertificateFacts) -> Vec<String> {
        let pairs = [
            ("identityId", &self.identity_id, &other.identity_id),
            ("registrationNo", &self.registration_no, &other.registration_no),
            ("fullName", &self.full_name, &other.full_name),
            ("course", &self.course, &other.course),
            ("branch", &self.branch, &other.branch),
            ("status", &self.status, &other.status),
        ];
        pairs
            .into_iter()
            .filter(|(_, left, right)| left != right)
            .map(|(name, _, _)| name.to_string())
            .collect()
    }
}

/// Issued once per application when it first reaches `completed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateRecord {
    pub application_id: ApplicationId,
    pub hash: String,
    pub transaction_id: String,
    pub block_number: u64,
    pub issued_at: DateTime<Utc>,
    pub hashed_facts: CertificateFacts,
}

/// Result label stored for each verification attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationOutcome {
    Valid,
    Tampered,
    TransactionMismatch,
    NotBlockchainSecured,
}

/// Audit row for a verification attempt against a resolved application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationAttempt {
    pub application_id: ApplicationId,
    pub transaction_id: String,
    pub outcome: VerificationOutcome,
    pub tampered_fields: Vec<String>,
    pub verified_at: DateTime<Utc>,
}

/// Sanitized representation of an application's exposed status.
#[derive(Debug, Clone, Serialize)]
pub struct ApplicationStatusView {
    pub application_id: ApplicationId,
    pub registration_no: String,
    pub state: &'static str,
    pub is_reapplication: bool,
    pub reapplication_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_reapplied_at: Option<DateTime<Utc>>,
    pub departments: Vec<DepartmentStatusView>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DepartmentStatusView {
    pub department: DepartmentName,
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rejection_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remarks: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action_at: Option<DateTime<Utc>>,
}
