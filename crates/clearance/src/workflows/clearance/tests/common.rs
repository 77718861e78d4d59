use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::response::Response;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;

use crate::config::ClearanceConfig;
use crate::workflows::clearance::{
    ActorId, ApplicantFacts, ApplicationId, CertificateRecord, ClearanceApplication,
    ClearanceNotice, ClearanceRepository, ClearanceService, Clock, Decision, DecisionInput,
    DepartmentName, FixedWindowRateLimiter, InMemoryClearanceRepository,
    InMemoryNotificationPublisher, LimitDecision, NotificationPublisher, NotifyError,
    RateLimitError, RateLimitPolicy, RateLimiter, ReapplicationHistoryEntry, ReapplyRequest,
    ReapplyTarget, RepositoryError, ScopeKind, VerificationAttempt,
};

pub(super) const DEPARTMENTS: [&str; 3] = ["library", "hostel", "accounts"];

/// Clock that only moves when a test tells it to.
pub(super) struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub(super) fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub(super) fn advance(&self, by: Duration) {
        let mut now = self.now.lock().expect("clock mutex poisoned");
        *now += chrono::Duration::from_std(by).expect("duration in range");
    }

    pub(super) fn now_millis(&self) -> i64 {
        self.now().timestamp_millis()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().expect("clock mutex poisoned")
    }
}

pub(super) fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 14, 9, 0, 0)
        .single()
        .expect("valid timestamp")
}

pub(super) fn department(name: &str) -> DepartmentName {
    DepartmentName::new(name)
}

pub(super) fn departments() -> Vec<DepartmentName> {
    DEPARTMENTS.iter().map(|name| department(name)).collect()
}

pub(super) fn facts(registration_no: &str) -> ApplicantFacts {
    ApplicantFacts {
        identity_id: format!("stu-{}", registration_no.to_ascii_lowercase()),
        registration_no: registration_no.to_string(),
        full_name: "Asha Verma".to_string(),
        parent_name: Some("Rakesh Verma".to_string()),
        school: "School of Engineering".to_string(),
        course: "B.Tech".to_string(),
        branch: "Computer Science".to_string(),
        admission_year: Some("2021".to_string()),
        passing_year: Some("2025".to_string()),
        country_code: Some("+91".to_string()),
        contact_no: Some("9876543210".to_string()),
        personal_email: Some("asha@example.com".to_string()),
        college_email: Some("asha.verma@college.edu".to_string()),
    }
}

pub(super) fn approve(name: &str) -> DecisionInput {
    DecisionInput {
        department: department(name),
        decision: Decision::Approved,
        actor: ActorId(format!("{name}-clerk")),
        reason: None,
        remarks: None,
    }
}

pub(super) fn reject(name: &str, reason: &str) -> DecisionInput {
    DecisionInput {
        department: department(name),
        decision: Decision::Rejected,
        actor: ActorId(format!("{name}-clerk")),
        reason: Some(reason.to_string()),
        remarks: None,
    }
}

pub(super) fn reapply_to(name: &str, reason: &str) -> ReapplyRequest {
    ReapplyRequest {
        target: ReapplyTarget::Department(department(name)),
        reason: reason.to_string(),
        edited_fields: Default::default(),
        actor_scope: "student-portal".to_string(),
    }
}

/// Config with request-rate limits wide open so tests can isolate one control at a time.
pub(super) fn relaxed_config() -> ClearanceConfig {
    let mut config = ClearanceConfig::default();
    let roomy = RateLimitPolicy::new(1_000, Duration::from_secs(60));
    config.reapplication.limits.reapply_global = roomy;
    config.reapplication.limits.reapply_per_department = roomy;
    config.reapplication.limits.reapply_per_student = roomy;
    config
}

pub(super) type MemoryService =
    ClearanceService<InMemoryClearanceRepository, InMemoryNotificationPublisher>;

pub(super) struct Harness {
    pub(super) service: Arc<MemoryService>,
    pub(super) repository: Arc<InMemoryClearanceRepository>,
    pub(super) notifier: Arc<InMemoryNotificationPublisher>,
    pub(super) clock: Arc<ManualClock>,
    pub(super) limiter: Arc<FixedWindowRateLimiter>,
}

impl Harness {
    pub(super) fn open(&self, registration_no: &str) -> ApplicationId {
        self.service
            .open_application(facts(registration_no), departments())
            .expect("application opens")
            .id
    }

    pub(super) fn fetch(&self, id: &ApplicationId) -> ClearanceApplication {
        self.repository
            .fetch(id)
            .expect("fetch succeeds")
            .expect("application present")
    }

    pub(super) fn notices(&self, template: &str) -> Vec<ClearanceNotice> {
        self.notifier
            .events()
            .into_iter()
            .filter(|notice| notice.template == template)
            .collect()
    }

    /// Record decisions so that every department approves.
    pub(super) fn complete(&self, id: &ApplicationId) {
        for name in DEPARTMENTS {
            self.service
                .record_decision(id, &approve(name))
                .expect("approval recorded");
        }
    }
}

pub(super) fn build_harness() -> Harness {
    build_harness_with(ClearanceConfig::default())
}

pub(super) fn build_harness_with(config: ClearanceConfig) -> Harness {
    let repository = Arc::new(InMemoryClearanceRepository::default());
    let notifier = Arc::new(InMemoryNotificationPublisher::default());
    let clock = Arc::new(ManualClock::new(start_time()));
    let limiter = Arc::new(FixedWindowRateLimiter::new(clock.clone()));
    let service = Arc::new(ClearanceService::new(
        repository.clone(),
        notifier.clone(),
        limiter.clone(),
        clock.clone(),
        &config,
    ));
    Harness {
        service,
        repository,
        notifier,
        clock,
        limiter,
    }
}

/// Wraps the in-memory store and fails the next `failures` writes with a version conflict.
/// Certificate inserts can be made to time out independently.
#[derive(Default)]
pub(super) struct FlakyRepository {
    pub(super) inner: InMemoryClearanceRepository,
    failures: AtomicU32,
    certificate_failures: AtomicU32,
}

impl FlakyRepository {
    pub(super) fn failing(failures: u32) -> Self {
        Self {
            failures: AtomicU32::new(failures),
            ..Self::default()
        }
    }

    pub(super) fn fail_next(&self, failures: u32) {
        self.failures.store(failures, Ordering::SeqCst);
    }

    pub(super) fn time_out_certificates(&self, failures: u32) {
        self.certificate_failures.store(failures, Ordering::SeqCst);
    }

    fn trip(&self) -> Result<(), RepositoryError> {
        let tripped = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if tripped {
            Err(RepositoryError::VersionConflict {
                expected: 0,
                found: 1,
            })
        } else {
            Ok(())
        }
    }
}

impl ClearanceRepository for FlakyRepository {
    fn insert(
        &self,
        application: ClearanceApplication,
    ) -> Result<ClearanceApplication, RepositoryError> {
        self.inner.insert(application)
    }

    fn fetch(&self, id: &ApplicationId) -> Result<Option<ClearanceApplication>, RepositoryError> {
        self.inner.fetch(id)
    }

    fn fetch_by_registration(
        &self,
        registration_no: &str,
    ) -> Result<Option<ClearanceApplication>, RepositoryError> {
        self.inner.fetch_by_registration(registration_no)
    }

    fn update(
        &self,
        application: ClearanceApplication,
    ) -> Result<ClearanceApplication, RepositoryError> {
        self.trip()?;
        self.inner.update(application)
    }

    fn update_with_history(
        &self,
        application: ClearanceApplication,
        entry: ReapplicationHistoryEntry,
    ) -> Result<ClearanceApplication, RepositoryError> {
        self.trip()?;
        self.inner.update_with_history(application, entry)
    }

    fn history(
        &self,
        id: &ApplicationId,
    ) -> Result<Vec<ReapplicationHistoryEntry>, RepositoryError> {
        self.inner.history(id)
    }

    fn insert_certificate(
        &self,
        record: CertificateRecord,
    ) -> Result<CertificateRecord, RepositoryError> {
        let tripped = self
            .certificate_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if tripped {
            return Err(RepositoryError::Timeout("lock wait".to_string()));
        }
        self.inner.insert_certificate(record)
    }

    fn certificate(
        &self,
        id: &ApplicationId,
    ) -> Result<Option<CertificateRecord>, RepositoryError> {
        self.inner.certificate(id)
    }

    fn record_verification(&self, attempt: VerificationAttempt) -> Result<u64, RepositoryError> {
        self.inner.record_verification(attempt)
    }

    fn verifications(
        &self,
        id: &ApplicationId,
        limit: usize,
    ) -> Result<Vec<VerificationAttempt>, RepositoryError> {
        self.inner.verifications(id, limit)
    }
}

pub(super) type FlakyService = ClearanceService<FlakyRepository, InMemoryNotificationPublisher>;

pub(super) fn flaky_service(
    failures: u32,
) -> (FlakyService, Arc<FlakyRepository>, Arc<ManualClock>) {
    let (service, repository, _, clock) = flaky_service_with_notifier(failures);
    (service, repository, clock)
}

pub(super) fn flaky_service_with_notifier(
    failures: u32,
) -> (
    FlakyService,
    Arc<FlakyRepository>,
    Arc<InMemoryNotificationPublisher>,
    Arc<ManualClock>,
) {
    let repository = Arc::new(FlakyRepository::failing(failures));
    let notifier = Arc::new(InMemoryNotificationPublisher::default());
    let clock = Arc::new(ManualClock::new(start_time()));
    let service = ClearanceService::new(
        repository.clone(),
        notifier.clone(),
        Arc::new(FixedWindowRateLimiter::new(clock.clone())),
        clock.clone(),
        &relaxed_config(),
    );
    (service, repository, notifier, clock)
}

/// Publisher whose transport is always down.
#[derive(Default)]
pub(super) struct FailingPublisher;

impl NotificationPublisher for FailingPublisher {
    fn publish(&self, _notice: ClearanceNotice) -> Result<(), NotifyError> {
        Err(NotifyError::Transport("smtp relay offline".to_string()))
    }
}

/// Limiter whose backing store is always unavailable.
pub(super) struct BrokenLimiter;

impl RateLimiter for BrokenLimiter {
    fn check(
        &self,
        _scope: ScopeKind,
        _key: &str,
        _policy: &RateLimitPolicy,
    ) -> Result<LimitDecision, RateLimitError> {
        Err(RateLimitError::StoreUnavailable("redis offline".to_string()))
    }

    fn sweep_expired(&self) -> Result<usize, RateLimitError> {
        Err(RateLimitError::StoreUnavailable("redis offline".to_string()))
    }
}

pub(super) async fn read_json_body(response: Response) -> Value {
    let body = axum::body::to_bytes(response.into_body(), 64 * 1024)
        .await
        .expect("read body");
    serde_json::from_slice(&body).expect("json payload")
}
