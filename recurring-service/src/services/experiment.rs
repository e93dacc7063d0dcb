//! Treatment/control bucketing and auto-detection frequency limits.

use service_core::rate_limit::{KeyedRateLimiter, check_key, create_keyed_rate_limiter};
use sha2::{Digest, Sha256};
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExperimentArm {
    Treatment,
    Control,
}

/// Outcome of gating one (user, account) detection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    Run,
    Control,
    RateLimited { retry_after_secs: u64 },
}

/// Constructed once at startup and shared.
pub struct ExperimentGate {
    name: String,
    treatment_percent: u8,
    limiter: KeyedRateLimiter,
}

impl ExperimentGate {
    pub fn new(
        name: impl Into<String>,
        treatment_percent: u8,
        attempts: u32,
        window_seconds: u64,
    ) -> Self {
        Self {
            name: name.into(),
            treatment_percent: treatment_percent.min(100),
            limiter: create_keyed_rate_limiter(attempts, window_seconds),
        }
    }

    /// Stable per-user bucket in `0..100`.
    fn bucket(&self, user_id: Uuid) -> u8 {
        let mut hasher = Sha256::new();
        hasher.update(self.name.as_bytes());
        hasher.update(user_id.as_bytes());
        let digest = hasher.finalize();
        let value = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
        (value % 100) as u8
    }

    pub fn arm(&self, user_id: Uuid) -> ExperimentArm {
        if self.bucket(user_id) < self.treatment_percent {
            ExperimentArm::Treatment
        } else {
            ExperimentArm::Control
        }
    }

    /// Control users never consume rate-limit quota.
    pub fn check(&self, user_id: Uuid, bank_account_id: Uuid) -> GateDecision {
        if self.arm(user_id) == ExperimentArm::Control {
            return GateDecision::Control;
        }
        let key = format!("{}:{}", user_id, bank_account_id);
        match check_key(&self.limiter, &key) {
            Ok(()) => GateDecision::Run,
            Err(retry_after_secs) => {
                debug!(key = %key, retry_after_secs, "Auto-detection rate limited");
                GateDecision::RateLimited { retry_after_secs }
            }
        }
    }
}
