use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::clock::Clock;

/// Named family of counters. Each family keeps its own windows per scope key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeKind {
    Submission,
    ReapplyGlobal,
    ReapplyPerDepartment,
    ReapplyPerStudent,
    Read,
}

impl ScopeKind {
    pub const fn label(self) -> &'static str {
        match self {
            ScopeKind::Submission => "submission",
            ScopeKind::ReapplyGlobal => "reapply-global",
            ScopeKind::ReapplyPerDepartment => "reapply-per-department",
            ScopeKind::ReapplyPerStudent => "reapply-per-student",
            ScopeKind::Read => "read",
        }
    }
}

impl fmt::Display for ScopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitPolicy {
    pub max_requests: u32,
    pub window: Duration,
}

impl RateLimitPolicy {
    pub const fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests,
            window,
        }
    }
}

/// The policy table consumed by the clearance engine and its intake collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitPolicies {
    pub submission: RateLimitPolicy,
    pub reapply_global: RateLimitPolicy,
    pub reapply_per_department: RateLimitPolicy,
    pub reapply_per_student: RateLimitPolicy,
    pub read: RateLimitPolicy,
}

impl Default for RateLimitPolicies {
    fn default() -> Self {
        let minute = Duration::from_secs(60);
        Self {
            submission: RateLimitPolicy::new(20, minute),
            reapply_global: RateLimitPolicy::new(3, minute),
            reapply_per_department: RateLimitPolicy::new(2, minute),
            reapply_per_student: RateLimitPolicy::new(5, minute),
            read: RateLimitPolicy::new(60, minute),
        }
    }
}

impl RateLimitPolicies {
    pub fn policy_for(&self, scope: ScopeKind) -> RateLimitPolicy {
        match scope {
            ScopeKind::Submission => self.submission,
            ScopeKind::ReapplyGlobal => self.reapply_global,
            ScopeKind::ReapplyPerDepartment => self.reapply_per_department,
            ScopeKind::ReapplyPerStudent => self.reapply_per_student,
            ScopeKind::Read => self.read,
        }
    }
}

/// Outcome of one `check`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LimitDecision {
    pub allowed: bool,
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
    /// Set only on denial.
    pub retry_after: Option<Duration>,
}

impl LimitDecision {
    fn fail_open(policy: &RateLimitPolicy) -> Self {
        let window =
            chrono::Duration::from_std(policy.window).unwrap_or_else(|_| chrono::Duration::zero());
        Self {
            allowed: true,
            remaining: policy.max_requests,
            reset_at: Utc::now() + window,
            retry_after: None,
        }
    }

    /// Whole seconds until the window resets, rounded up.
    pub fn retry_after_secs(&self) -> u64 {
        self.retry_after
            .map(|wait| wait.as_secs() + u64::from(wait.subsec_nanos() > 0))
            .unwrap_or(0)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RateLimitError {
    #[error("rate limit store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("rate limit window out of range: {0:?}")]
    InvalidWindow(Duration),
}

/// Counter service bounding how often an action runs per scope key.
pub trait RateLimiter: Send + Sync {
    /// Count one request and report whether it fits the policy. Increment and compare are one step.
    fn check(
        &self,
        scope: ScopeKind,
        key: &str,
        policy: &RateLimitPolicy,
    ) -> Result<LimitDecision, RateLimitError>;

    /// Drop windows whose reset time has passed. Returns how many were removed.
    fn sweep_expired(&self) -> Result<usize, RateLimitError>;

    /// `check` that fails open: internal errors allow the request.
    fn admit(&self, scope: ScopeKind, key: &str, policy: &RateLimitPolicy) -> LimitDecision {
        match self.check(scope, key, policy) {
            Ok(decision) => decision,
            Err(err) => {
                warn!(scope = scope.label(), key, error = %err, "rate limiter failed open");
                LimitDecision::fail_open(policy)
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Window {
    count: u32,
    reset_at: DateTime<Utc>,
}

/// In-process fixed-window counter. Windows reset lazily on the first request after expiry.
pub struct FixedWindowRateLimiter {
    windows: Mutex<HashMap<(ScopeKind, String), Window>>,
    clock: Arc<dyn Clock>,
}

impl FixedWindowRateLimiter {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            windows: Mutex::new(HashMap::new()),
            clock,
        }
    }

    /// Number of live windows, for monitoring.
    pub fn tracked_windows(&self) -> usize {
        self.windows.lock().map(|windows| windows.len()).unwrap_or(0)
    }

    /// Forget a single counter (administrative override).
    pub fn clear(&self, scope: ScopeKind, key: &str) -> bool {
        self.windows
            .lock()
            .map(|mut windows| windows.remove(&(scope, key.to_string())).is_some())
            .unwrap_or(false)
    }
}

impl RateLimiter for FixedWindowRateLimiter {
    fn check(
        &self,
        scope: ScopeKind,
        key: &str,
        policy: &RateLimitPolicy,
    ) -> Result<LimitDecision, RateLimitError> {
        let span = chrono::Duration::from_std(policy.window)
            .map_err(|_| RateLimitError::InvalidWindow(policy.window))?;
        let mut windows = self
            .windows
            .lock()
            .map_err(|_| RateLimitError::StoreUnavailable("window mutex poisoned".to_string()))?;
        let now = self.clock.now();

        let window = windows
            .entry((scope, key.to_string()))
            .and_modify(|window| {
                if now >= window.reset_at {
                    *window = Window {
                        count: 1,
                        reset_at: now + span,
                    };
                } else {
                    window.count = window.count.saturating_add(1);
                }
            })
            .or_insert(Window {
                count: 1,
                reset_at: now + span,
            });

        let allowed = window.count <= policy.max_requests;
        let retry_after = if allowed {
            None
        } else {
            (window.reset_at - now).to_std().ok()
        };

        Ok(LimitDecision {
            allowed,
            remaining: policy.max_requests.saturating_sub(window.count),
            reset_at: window.reset_at,
            retry_after,
        })
    }

    fn sweep_expired(&self) -> Result<usize, RateLimitError> {
        let mut windows = self
            .windows
            .lock()
            .map_err(|_| RateLimitError::StoreUnavailable("window mutex poisoned".to_string()))?;
        let now = self.clock.now();
        let before = windows.len();
        windows.retain(|_, window| window.reset_at > now);
        Ok(before - windows.len())
    }
}

/// Periodically reclaim expired windows so `check` never has to scan.
pub fn spawn_sweeper(limiter: Arc<dyn RateLimiter>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match limiter.sweep_expired() {
                Ok(0) => {}
                Ok(removed) => debug!(removed, "swept expired rate limit windows"),
                Err(err) => warn!(error = %err, "rate limit sweep failed"),
            }
        }
    })
}
