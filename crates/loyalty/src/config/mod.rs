use std::env;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::workflows::receipts::evaluation::DecisionPolicy;
use crate::workflows::rewards::accrual::AccrualPolicy;

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
    pub pipeline: PipelineConfig,
    pub collaborators: CollaboratorConfig,
    pub sweep: SweepConfig,
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

        let decision = DecisionPolicy {
            fraud_reject_threshold: number("LOYALTY_FRAUD_REJECT_THRESHOLD", 70)?,
            fraud_review_threshold: number("LOYALTY_FRAUD_REVIEW_THRESHOLD", 40)?,
        };
        if decision.fraud_reject_threshold > 100
            || decision.fraud_review_threshold > decision.fraud_reject_threshold
        {
            return Err(ConfigError::InvalidThresholds {
                review: decision.fraud_review_threshold,
                reject: decision.fraud_reject_threshold,
            });
        }

        let accrual = AccrualPolicy {
            period_days: positive("LOYALTY_PERIOD_DAYS", 45)?,
            reward_validity_days: positive("LOYALTY_REWARD_VALIDITY_DAYS", 30)?,
            default_visits_needed: positive("LOYALTY_DEFAULT_VISITS_NEEDED", 5)?,
        };

        let pipeline = PipelineConfig {
            decision,
            accrual,
            upstream_timeout: Duration::from_millis(positive(
                "LOYALTY_UPSTREAM_TIMEOUT_MS",
                15_000,
            )?),
        };

        let collaborators = CollaboratorConfig {
            extractor_url: optional("LOYALTY_EXTRACTOR_URL"),
            fraud_scorer_url: optional("LOYALTY_FRAUD_SCORER_URL"),
            notify_url: optional("LOYALTY_NOTIFY_URL"),
            stores_file: optional("LOYALTY_STORES_FILE").map(PathBuf::from),
        };

        let sweep = SweepConfig {
            interval_secs: number("LOYALTY_SWEEP_INTERVAL_SECS", 0)?,
            stale_pending_hours: positive("LOYALTY_STALE_PENDING_HOURS", 24)?,
        };

        Ok(Self {
            environment,
            server: ServerConfig { host, port },
            telemetry: TelemetryConfig { log_level },
            pipeline,
            collaborators,
            sweep,
        })
    }
}

fn optional(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn number<T: FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match optional(key) {
        Some(value) => value
            .parse::<T>()
            .map_err(|_| ConfigError::InvalidNumber { key, value }),
        None => Ok(default),
    }
}

fn positive<T: FromStr + PartialOrd + Default>(
    key: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    let value = number(key, default)?;
    if value <= T::default() {
        return Err(ConfigError::NotPositive { key });
    }
    Ok(value)
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

/// Tracing and metrics controls.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub log_level: String,
}

/// Thresholds and windows the receipt pipeline and accrual run with.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PipelineConfig {
    pub decision: DecisionPolicy,
    pub accrual: AccrualPolicy,
    pub upstream_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            decision: DecisionPolicy::default(),
            accrual: AccrualPolicy::default(),
            upstream_timeout: Duration::from_secs(15),
        }
    }
}

/// Where the external collaborators live. Unset URLs fall back to local stand-ins.
#[derive(Debug, Clone, Default)]
pub struct CollaboratorConfig {
    pub extractor_url: Option<String>,
    pub fraud_scorer_url: Option<String>,
    pub notify_url: Option<String>,
    pub stores_file: Option<PathBuf>,
}

/// Background maintenance; an interval of zero disables it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepConfig {
    pub interval_secs: u64,
    pub stale_pending_hours: u32,
}

impl SweepConfig {
    pub fn interval(&self) -> Option<Duration> {
        (self.interval_secs > 0).then(|| Duration::from_secs(self.interval_secs))
    }

    pub fn stale_pending_after(&self) -> chrono::Duration {
        chrono::Duration::hours(i64::from(self.stale_pending_hours))
    }
}

#[derive(Debug)]
pub enum ConfigError {
    InvalidPort,
    InvalidHost { source: std::net::AddrParseError },
    InvalidNumber { key: &'static str, value: String },
    NotPositive { key: &'static str },
    InvalidThresholds { review: u8, reject: u8 },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::InvalidPort => write!(f, "APP_PORT must be a valid u16"),
            ConfigError::InvalidHost { .. } => {
                write!(f, "APP_HOST must parse to an IPv4 or IPv6 address")
            }
            ConfigError::InvalidNumber { key, value } => {
                write!(f, "{key} must be a number, got '{value}'")
            }
            ConfigError::NotPositive { key } => write!(f, "{key} must be greater than zero"),
            ConfigError::InvalidThresholds { review, reject } => write!(
                f,
                "fraud review threshold {review} must not exceed reject threshold {reject} (max 100)"
            ),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::InvalidHost { source } => Some(source),
            _ => None,
        }
    }
}
