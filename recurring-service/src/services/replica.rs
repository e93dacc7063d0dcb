//! Read-replica eligibility for inbound jobs.
//!
//! A job triggered by a message published `delivery_lag` ago may read from the
//! replica once the replica has replayed at least that far. If it has not, but
//! is within the job's tolerated staleness, the message is deferred with a
//! `TooEarly` so redelivery finds the data replicated. A replica further behind
//! than that is bypassed for the primary.

use async_trait::async_trait;
use service_core::error::AppError;
use std::time::Duration;
use tracing::debug;

use crate::services::repository::DataSource;

#[async_trait]
pub trait ReplicaLagProbe: Send + Sync {
    /// Current replay lag, or `None` when no replica is configured.
    async fn replica_lag(&self) -> Result<Option<Duration>, AppError>;
}

#[derive(Debug, Clone, Copy)]
pub struct ReplicaGate {
    pub max_staleness: Duration,
}

impl ReplicaGate {
    pub fn new(max_staleness: Duration) -> Self {
        Self { max_staleness }
    }

    pub fn decide(
        &self,
        replica_lag: Option<Duration>,
        delivery_lag: Duration,
    ) -> Result<DataSource, AppError> {
        let Some(replica_lag) = replica_lag else {
            return Ok(DataSource::Primary);
        };

        if replica_lag <= delivery_lag {
            return Ok(DataSource::Replica);
        }

        if replica_lag <= self.max_staleness {
            let wait = replica_lag.saturating_sub(delivery_lag);
            return Err(AppError::TooEarly {
                reason: format!(
                    "replica lag {}ms exceeds message age {}ms",
                    replica_lag.as_millis(),
                    delivery_lag.as_millis()
                ),
                retry_after_secs: Some(wait.as_secs().max(1)),
            });
        }

        debug!(
            replica_lag_ms = replica_lag.as_millis() as u64,
            "Replica too far behind, using primary"
        );
        Ok(DataSource::Primary)
    }

    /// Probe the replica and decide. Initial-signup jobs skip this and read
    /// the primary.
    pub async fn select(
        &self,
        probe: &dyn ReplicaLagProbe,
        delivery_lag: Duration,
    ) -> Result<DataSource, AppError> {
        let lag = probe.replica_lag().await?;
        self.decide(lag, delivery_lag)
    }
}
