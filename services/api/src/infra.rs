use clearance::config::ClearanceConfig;
use clearance::workflows::clearance::{
    ClearanceService, Clock, DepartmentName, InMemoryClearanceRepository,
    InMemoryNotificationPublisher, RateLimiter,
};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

/// Departments every new application must be cleared by unless the intake request names its own.
pub(crate) const DEFAULT_DEPARTMENTS: [&str; 5] =
    ["library", "hostel", "accounts", "laboratory", "sports"];

pub(crate) type MemoryClearanceService =
    ClearanceService<InMemoryClearanceRepository, InMemoryNotificationPublisher>;

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) readiness: Arc<AtomicBool>,
    pub(crate) metrics: Arc<PrometheusHandle>,
}

pub(crate) fn default_departments() -> Vec<DepartmentName> {
    DEFAULT_DEPARTMENTS
        .iter()
        .map(|name| DepartmentName::new(*name))
        .collect()
}

/// Wires the clearance facade over the in-memory store.
pub(crate) fn build_clearance_service(
    config: &ClearanceConfig,
    limiter: Arc<dyn RateLimiter>,
    clock: Arc<dyn Clock>,
) -> (Arc<MemoryClearanceService>, Arc<InMemoryNotificationPublisher>) {
    let notifier = Arc::new(InMemoryNotificationPublisher::default());
    let service = ClearanceService::new(
        Arc::new(InMemoryClearanceRepository::default()),
        notifier.clone(),
        limiter,
        clock,
        config,
    );
    (Arc::new(service), notifier)
}
