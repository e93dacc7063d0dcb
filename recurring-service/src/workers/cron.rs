use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::matching::MissedSweep;
use crate::services::metrics::record_error;

/// Runs the missed-lifecycle sweep on a fixed interval until cancelled.
pub struct SweepCron {
    sweep: Arc<MissedSweep>,
    period: Duration,
    shutdown_token: CancellationToken,
}

impl SweepCron {
    pub fn new(sweep: Arc<MissedSweep>, period: Duration) -> Self {
        Self {
            sweep,
            period,
            shutdown_token: CancellationToken::new(),
        }
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    pub async fn start(self) {
        tracing::info!(period_secs = self.period.as_secs(), "Starting missed-lifecycle cron");

        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown_token.cancelled() => {
                    tracing::info!("Missed-lifecycle cron shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep.run(Utc::now()).await {
                        record_error(e.kind());
                        tracing::error!(error = %e, "Missed-lifecycle sweep failed");
                    }
                }
            }
        }
    }
}
