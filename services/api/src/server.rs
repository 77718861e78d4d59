use crate::cli::ServeArgs;
use crate::infra::{build_clearance_service, AppState};
use crate::routes::with_clearance_routes;
use axum::Extension;
use axum_prometheus::PrometheusMetricLayer;
use clearance::config::AppConfig;
use clearance::error::AppError;
use clearance::telemetry;
use clearance::workflows::clearance::{spawn_sweeper, FixedWindowRateLimiter, SystemClock};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::info;

pub(crate) async fn run(mut args: ServeArgs) -> Result<(), AppError> {
    let mut config = AppConfig::load()?;

    if let Some(host) = args.host.take() {
        config.server.host = host;
    }
    if let Some(port) = args.port.take() {
        config.server.port = port;
    }

    telemetry::init(&config.telemetry)?;

    let (prometheus_layer, prometheus_handle) = PrometheusMetricLayer::pair();
    let readiness_flag = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let app_state = AppState {
        readiness: readiness_flag.clone(),
        metrics: Arc::new(prometheus_handle),
    };

    let clock = Arc::new(SystemClock);
    let limiter = Arc::new(FixedWindowRateLimiter::new(clock.clone()));
    let (clearance_service, _notifier) =
        build_clearance_service(&config.clearance, limiter.clone(), clock);
    let sweeper = spawn_sweeper(limiter, config.clearance.sweep_interval);

    let app = with_clearance_routes(clearance_service)
        .layer(Extension(app_state))
        .layer(prometheus_layer);

    let addr = config.server.socket_addr()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    readiness_flag.store(true, Ordering::Release);

    info!(
        ?config.environment,
        %addr,
        sweep_interval_secs = config.clearance.sweep_interval.as_secs(),
        "clearance service ready"
    );

    let served = axum::serve(listener, app).await;
    sweeper.abort();
    served?;
    Ok(())
}
