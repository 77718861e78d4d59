use std::env;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use crate::workflows::clearance::{
    CertificateSettings, RateLimitPolicies, ReapplicationPolicy, ResetScope,
};

/// Distinguishes runtime behavior for different stages of the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppEnvironment {
    Development,
    Test,
    Production,
}

impl AppEnvironment {
    fn from_str(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "prod" | "production" => Self::Production,
            "test" | "ci" => Self::Test,
            _ => Self::Development,
        }
    }
}

/// Top-level configuration for the application.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub environment: AppEnvironment,
    pub server: ServerConfig,
    pub telemetry: TelemetryConfig,
    pub clearance: ClearanceConfig,
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let environment = AppEnvironment::from_str(
            &env::var("APP_ENV").unwrap_or_else(|_| "development".to_string()),
        );

        let host = env::var("APP_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let port = env::var("APP_PORT")
            .unwrap_or_else(|_| "3000".to_string())
            .parse::<u16>()
            .map_err(|_| ConfigError::InvalidPort)?;

        let log_level = env::var("APP_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            environment,
            server: ServerConfig { host, port },
            telemetry: TelemetryConfig { log_level },
            clearance: ClearanceConfig::from_env()?,
        })
    }
}

/// Settings controlling the HTTP server binding.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl ServerConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        if self.host.eq_ignore_ascii_case("localhost") {
            return Ok(SocketAddr::new(IpAddr::from([127, 0, 0, 1]), self.port));
        }

        let ip: IpAddr = self
            .host
            .parse()
            .map_err(|source| ConfigError::InvalidHost { source })?;

        Ok(SocketAddr::new(ip, self.port))
    }
}

/// Tracing controls.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub log_level: String,
}

/// Reapplication, certificate, and rate-limit dials for the clearance engine.
#[derive(Debug, Clone)]
pub struct ClearanceConfig {
    pub reapplication: ReapplicationPolicy,
    pub certificate: CertificateSettings,
    pub sweep_interval: Duration,
}

impl Default for ClearanceConfig {
    fn default() -> Self {
        Self {
            reapplication: ReapplicationPolicy::default(),
            certificate: CertificateSettings::default(),
            sweep_interval: Duration::from_secs(300),
        }
    }
}

impl ClearanceConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let policy = defaults.reapplication;

        let mut limits = RateLimitPolicies::default();
        limits.reapply_per_department.max_requests = read_var(
            "CLEARANCE_REAPPLY_PER_DEPARTMENT_MAX",
            limits.reapply_per_department.max_requests,
        )?;
        limits.reapply_per_student.max_requests = read_var(
            "CLEARANCE_REAPPLY_PER_STUDENT_MAX",
            limits.reapply_per_student.max_requests,
        )?;

        let reset_scope = match env::var("CLEARANCE_RESET_SCOPE") {
            Ok(raw) => ResetScope::parse(&raw).ok_or(ConfigError::InvalidValue {
                variable: "CLEARANCE_RESET_SCOPE",
                value: raw,
            })?,
            Err(_) => policy.reset_scope,
        };

        let reapplication = ReapplicationPolicy {
            cooldown: Duration::from_secs(read_var(
                "CLEARANCE_REAPPLY_COOLDOWN_SECS",
                policy.cooldown.as_secs(),
            )?),
            min_reason_chars: read_var("CLEARANCE_MIN_REASON_CHARS", policy.min_reason_chars)?,
            max_reapplications: read_var(
                "CLEARANCE_MAX_REAPPLICATIONS",
                policy.max_reapplications,
            )?,
            max_department_reapplications: read_var(
                "CLEARANCE_MAX_DEPARTMENT_REAPPLICATIONS",
                policy.max_department_reapplications,
            )?,
            reset_scope,
            allow_completed: read_var("CLEARANCE_ALLOW_COMPLETED_REAPPLY", policy.allow_completed)?,
            allow_in_progress: read_var(
                "CLEARANCE_ALLOW_IN_PROGRESS_REAPPLY",
                policy.allow_in_progress,
            )?,
            limits,
        };

        let certificate = CertificateSettings {
            verify_base_url: env::var("CLEARANCE_VERIFY_BASE_URL")
                .unwrap_or(defaults.certificate.verify_base_url),
            clock_skew: Duration::from_secs(read_var(
                "CLEARANCE_CLOCK_SKEW_SECS",
                defaults.certificate.clock_skew.as_secs(),
            )?),
            ..defaults.certificate
        };

        let sweep_interval = Duration::from_secs(read_var(
            "CLEARANCE_SWEEP_INTERVAL_SECS",
            defaults.sweep_interval.as_secs(),
        )?);
        if sweep_interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                variable: "CLEARANCE_SWEEP_INTERVAL_SECS",
                value: "0".to_string(),
            });
        }

        Ok(Self {
            reapplication,
            certificate,
            sweep_interval,
        })
    }
}

fn read_var<T: std::str::FromStr>(variable: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(variable) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|_| ConfigError::InvalidValue {
                variable,
                value: raw,
            }),
        Err(_) => Ok(default),
    }
}

#[derive(Debug)]
pub enum ConfigError {
    InvalidPort,
    InvalidHost { source: std::net::AddrParseError },
    InvalidValue { variable: &'static str, value: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::InvalidPort => write!(f, "APP_PORT must be a valid u16"),
            ConfigError::InvalidHost { .. } => {
                write!(f, "APP_HOST must parse to an IPv4 or IPv6 address")
            }
            ConfigError::InvalidValue { variable, value } => {
                write!(f, "{variable} has an invalid value '{value}'")
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::InvalidPort | ConfigError::InvalidValue { .. } => None,
            ConfigError::InvalidHost { source } => Some(source),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::{Mutex, OnceLock};

    fn env_guard() -> &'static Mutex<()> {
        static GUARD: OnceLock<Mutex<()>> = OnceLock::new();
        GUARD.get_or_init(|| Mutex::new(()))
    }

    fn reset_env() {
        for variable in [
            "APP_ENV",
            "APP_HOST",
            "APP_PORT",
            "APP_LOG_LEVEL",
            "CLEARANCE_REAPPLY_COOLDOWN_SECS",
            "CLEARANCE_MIN_REASON_CHARS",
            "CLEARANCE_MAX_REAPPLICATIONS",
            "CLEARANCE_MAX_DEPARTMENT_REAPPLICATIONS",
            "CLEARANCE_RESET_SCOPE",
            "CLEARANCE_ALLOW_COMPLETED_REAPPLY",
            "CLEARANCE_ALLOW_IN_PROGRESS_REAPPLY",
            "CLEARANCE_REAPPLY_PER_DEPARTMENT_MAX",
            "CLEARANCE_REAPPLY_PER_STUDENT_MAX",
            "CLEARANCE_VERIFY_BASE_URL",
            "CLEARANCE_CLOCK_SKEW_SECS",
            "CLEARANCE_SWEEP_INTERVAL_SECS",
        ] {
            env::remove_var(variable);
        }
    }

    #[test]
    fn load_uses_defaults_when_env_missing() {
        let _lock = env_guard().lock().expect("env mutex poisoned");
        reset_env();
        let config = AppConfig::load().expect("config loads with defaults");
        assert_eq!(config.environment, AppEnvironment::Development);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.telemetry.log_level, "info");
        assert_eq!(
            config.clearance.reapplication.cooldown,
            Duration::from_secs(86_400)
        );
        assert_eq!(config.clearance.reapplication.min_reason_chars, 5);
        assert_eq!(
            config.clearance.reapplication.reset_scope,
            ResetScope::TargetedDepartment
        );
        assert_eq!(
            config.clearance.reapplication.limits.reapply_global.max_requests,
            3
        );
    }

    #[test]
    fn accepts_localhost_host() {
        let _lock = env_guard().lock().expect("env mutex poisoned");
        reset_env();
        env::set_var("APP_HOST", "localhost");
        let config = AppConfig::load().expect("config loads");
        let addr = config.server.socket_addr().expect("localhost resolves");
        assert_eq!(addr, SocketAddr::new(IpAddr::from([127, 0, 0, 1]), 3000));
        reset_env();
    }

    #[test]
    fn clearance_overrides_are_applied() {
        let _lock = env_guard().lock().expect("env mutex poisoned");
        reset_env();
        env::set_var("CLEARANCE_RESET_SCOPE", "all");
        env::set_var("CLEARANCE_REAPPLY_COOLDOWN_SECS", "60");
        env::set_var("CLEARANCE_ALLOW_COMPLETED_REAPPLY", "false");
        env::set_var("CLEARANCE_REAPPLY_PER_STUDENT_MAX", "9");
        let config = AppConfig::load().expect("config loads");
        let policy = &config.clearance.reapplication;
        assert_eq!(policy.reset_scope, ResetScope::AllDepartments);
        assert_eq!(policy.cooldown, Duration::from_secs(60));
        assert!(!policy.allow_completed);
        assert_eq!(policy.limits.reapply_per_student.max_requests, 9);
        reset_env();
    }

    #[test]
    fn rejects_unknown_reset_scope() {
        let _lock = env_guard().lock().expect("env mutex poisoned");
        reset_env();
        env::set_var("CLEARANCE_RESET_SCOPE", "everything");
        match AppConfig::load() {
            Err(ConfigError::InvalidValue { variable, .. }) => {
                assert_eq!(variable, "CLEARANCE_RESET_SCOPE")
            }
            other => panic!("expected invalid reset scope, got {other:?}"),
        }
        reset_env();
    }
}
