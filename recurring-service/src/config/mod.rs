//! Configuration module for recurring-service.

use rust_decimal::Decimal;
use service_core::config::{self as core_config, env_optional, env_or, env_required};
use service_core::error::AppError;
use std::env;
use std::time::Duration;

use crate::schedule::SettlementPolicy;

#[derive(Debug, Clone)]
pub struct RecurringConfig {
    pub common: core_config::Config,
    pub service_name: String,
    pub service_version: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub database: DatabaseConfig,
    pub inference_service: CollaboratorConfig,
    pub notification_service: CollaboratorConfig,
    pub matching: MatchingConfig,
    pub sweep: SweepConfig,
    pub replica: ReplicaConfig,
    pub experiment: ExperimentConfig,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub replica_url: Option<String>,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone)]
pub struct CollaboratorConfig {
    pub url: String,
    pub timeout: Duration,
}

/// Tuning for per-account reconciliation.
#[derive(Debug, Clone)]
pub struct MatchingConfig {
    pub look_back_days: i64,
    pub look_forward_days: i64,
    pub settlement: SettlementPolicy,
    /// Income below this is never matched.
    pub min_income_amount: Decimal,
    /// Fractional deviation from the reference amount still accepted.
    pub amount_variance: Decimal,
    pub drift_window_days: i64,
    pub drift_confidence_threshold: f64,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            look_back_days: 60,
            look_forward_days: 3,
            settlement: SettlementPolicy::default(),
            min_income_amount: Decimal::new(1000, 2),
            amount_variance: Decimal::new(5, 2),
            drift_window_days: 180,
            drift_confidence_threshold: 0.8,
        }
    }
}

/// Tuning for the daily missed-lifecycle sweep.
#[derive(Debug, Clone)]
pub struct SweepConfig {
    /// Oldest expected date swept, in days before today.
    pub window_start_days: i64,
    /// Newest expected date swept, in days before today.
    pub window_end_days: i64,
    pub page_size: i64,
    /// A miss must be at least this old before a main-paycheck alert.
    pub alert_min_age_days: i64,
    pub interval: Duration,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            window_start_days: 8,
            window_end_days: 2,
            page_size: 500,
            alert_min_age_days: 2,
            interval: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// Maximum replica staleness an event-driven job tolerates before deferring.
/// The sweep always reads the primary.
#[derive(Debug, Clone)]
pub struct ReplicaConfig {
    pub detection_max_staleness: Duration,
}

impl Default for ReplicaConfig {
    fn default() -> Self {
        Self {
            detection_max_staleness: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExperimentConfig {
    pub name: String,
    pub treatment_percent: u8,
    pub rate_limit_attempts: u32,
    pub rate_limit_window_seconds: u64,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            name: "account-transition".to_string(),
            treatment_percent: 100,
            rate_limit_attempts: 6,
            rate_limit_window_seconds: 3600,
        }
    }
}

impl MatchingConfig {
    fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            look_back_days: env_or("MATCH_LOOK_BACK_DAYS", defaults.look_back_days),
            look_forward_days: env_or("MATCH_LOOK_FORWARD_DAYS", defaults.look_forward_days),
            settlement: SettlementPolicy {
                early_banking_days: env_or(
                    "SETTLEMENT_EARLY_BANKING_DAYS",
                    defaults.settlement.early_banking_days,
                ),
                grace_days: env_or("SETTLEMENT_GRACE_DAYS", defaults.settlement.grace_days),
            },
            min_income_amount: env_or("MIN_INCOME_AMOUNT", defaults.min_income_amount),
            amount_variance: env_or("AMOUNT_VARIANCE", defaults.amount_variance),
            drift_window_days: env_or("DRIFT_WINDOW_DAYS", defaults.drift_window_days),
            drift_confidence_threshold: env_or(
                "DRIFT_CONFIDENCE_THRESHOLD",
                defaults.drift_confidence_threshold,
            ),
        }
    }
}

impl SweepConfig {
    fn from_env() -> Result<Self, AppError> {
        let defaults = Self::default();
        Ok(Self {
            window_start_days: env_or("SWEEP_WINDOW_START_DAYS", defaults.window_start_days),
            window_end_days: env_or("SWEEP_WINDOW_END_DAYS", defaults.window_end_days),
            page_size: env_or("SWEEP_PAGE_SIZE", defaults.page_size),
            alert_min_age_days: env_or("MISSED_ALERT_MIN_AGE_DAYS", defaults.alert_min_age_days),
            interval: sweep_interval(env_or(
                "SWEEP_INTERVAL_SECONDS",
                defaults.interval.as_secs(),
            ))?,
        })
    }
}

/// The sweep ticker cannot run on a zero period.
fn sweep_interval(secs: u64) -> Result<Duration, AppError> {
    if secs == 0 {
        return Err(AppError::ConfigError(anyhow::anyhow!(
            "SWEEP_INTERVAL_SECONDS must be greater than zero"
        )));
    }
    Ok(Duration::from_secs(secs))
}

impl ReplicaConfig {
    fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            detection_max_staleness: Duration::from_secs(env_or(
                "DETECTION_MAX_STALENESS_SECONDS",
                defaults.detection_max_staleness.as_secs(),
            )),
        }
    }
}

impl ExperimentConfig {
    fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            name: env::var("EXPERIMENT_NAME").unwrap_or(defaults.name),
            treatment_percent: env_or("EXPERIMENT_TREATMENT_PERCENT", defaults.treatment_percent),
            rate_limit_attempts: env_or(
                "DETECTION_RATE_LIMIT_ATTEMPTS",
                defaults.rate_limit_attempts,
            ),
            rate_limit_window_seconds: env_or(
                "DETECTION_RATE_LIMIT_WINDOW_SECONDS",
                defaults.rate_limit_window_seconds,
            ),
        }
    }
}

impl RecurringConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common = core_config::Config::load()?;
        let collaborator_timeout = Duration::from_secs(env_or("COLLABORATOR_TIMEOUT_SECONDS", 10));

        Ok(Self {
            common,
            service_name: env::var("SERVICE_NAME")
                .unwrap_or_else(|_| "recurring-service".to_string()),
            service_version: env::var("SERVICE_VERSION")
                .unwrap_or_else(|_| env!("CARGO_PKG_VERSION").to_string()),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            otlp_endpoint: env_optional("OTLP_ENDPOINT"),
            database: DatabaseConfig {
                url: env_required("DATABASE_URL")?,
                replica_url: env_optional("DATABASE_REPLICA_URL"),
                max_connections: env_or("DATABASE_MAX_CONNECTIONS", 10),
                min_connections: env_or("DATABASE_MIN_CONNECTIONS", 2),
            },
            inference_service: CollaboratorConfig {
                url: env::var("INFERENCE_SERVICE_URL")
                    .unwrap_or_else(|_| "http://schedule-inference:3001".to_string()),
                timeout: collaborator_timeout,
            },
            notification_service: CollaboratorConfig {
                url: env::var("NOTIFICATION_SERVICE_URL")
                    .unwrap_or_else(|_| "http://notification-service:3001".to_string()),
                timeout: collaborator_timeout,
            },
            matching: MatchingConfig::from_env(),
            sweep: SweepConfig::from_env()?,
            replica: ReplicaConfig::from_env(),
            experiment: ExperimentConfig::from_env(),
        })
    }
}
