//! Bank connection update events.
//!
//! Each event names the accounts whose transactions just changed. Initial
//! updates (first sync after signup) read the primary; everything else asks
//! the replica gate, which may defer the event with `TooEarly`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::matching::{AccountTransitionMatcher, Matcher, TransitionOutcome};
use crate::services::metrics::record_error;
use crate::services::notifications::{Notification, Notifier, notify};
use crate::services::replica::{ReplicaGate, ReplicaLagProbe};
use crate::services::repository::DataSource;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UpdateType {
    Initial,
    Default,
    Historical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BankConnectionUpdated {
    pub user_id: Uuid,
    pub update_type: UpdateType,
    pub bank_account_ids: Vec<Uuid>,
    pub published_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EventSummary {
    pub accounts: usize,
    pub matched: usize,
    pub transitioned: usize,
    pub failed: usize,
}

pub struct EventHandler {
    matcher: Arc<Matcher>,
    transition: Arc<AccountTransitionMatcher>,
    notifier: Arc<dyn Notifier>,
    probe: Arc<dyn ReplicaLagProbe>,
    gate: ReplicaGate,
}

impl EventHandler {
    pub fn new(
        matcher: Arc<Matcher>,
        transition: Arc<AccountTransitionMatcher>,
        notifier: Arc<dyn Notifier>,
        probe: Arc<dyn ReplicaLagProbe>,
        gate: ReplicaGate,
    ) -> Self {
        Self {
            matcher,
            transition,
            notifier,
            probe,
            gate,
        }
    }

    /// Decode and handle a raw event body.
    pub async fn handle_payload(
        &self,
        payload: &[u8],
        now: DateTime<Utc>,
    ) -> Result<EventSummary, AppError> {
        let event: BankConnectionUpdated = serde_json::from_slice(payload)?;
        self.handle(&event, now).await
    }

    /// Only a `TooEarly` from the replica gate or a probe failure escapes;
    /// per-account failures are logged and counted.
    #[instrument(skip(self, event), fields(user_id = %event.user_id, update_type = ?event.update_type))]
    pub async fn handle(
        &self,
        event: &BankConnectionUpdated,
        now: DateTime<Utc>,
    ) -> Result<EventSummary, AppError> {
        let source = self.data_source(event, now).await?;

        let mut summary = EventSummary::default();
        for &bank_account_id in &event.bank_account_ids {
            summary.accounts += 1;
            match self.handle_account(event, bank_account_id, source, now).await {
                Ok((matched, transitioned)) => {
                    summary.matched += matched;
                    summary.transitioned += transitioned;
                }
                Err(e) => {
                    summary.failed += 1;
                    record_error(e.kind());
                    warn!(bank_account_id = %bank_account_id, error = %e, "Failed to process account");
                }
            }
        }

        if event.update_type == UpdateType::Initial {
            for &bank_account_id in &event.bank_account_ids {
                notify(
                    self.notifier.as_ref(),
                    Notification::ExpensesPredicted {
                        user_id: event.user_id,
                        bank_account_id,
                    },
                )
                .await;
            }
        }

        info!(
            accounts = summary.accounts,
            matched = summary.matched,
            transitioned = summary.transitioned,
            failed = summary.failed,
            source = source.as_str(),
            "Bank connection update handled"
        );
        Ok(summary)
    }

    async fn data_source(
        &self,
        event: &BankConnectionUpdated,
        now: DateTime<Utc>,
    ) -> Result<DataSource, AppError> {
        if event.update_type == UpdateType::Initial {
            return Ok(DataSource::Primary);
        }
        let delivery_lag = (now - event.published_at)
            .to_std()
            .unwrap_or(Duration::ZERO);
        self.gate.select(self.probe.as_ref(), delivery_lag).await
    }

    async fn handle_account(
        &self,
        event: &BankConnectionUpdated,
        bank_account_id: Uuid,
        source: DataSource,
        now: DateTime<Utc>,
    ) -> Result<(usize, usize), AppError> {
        let outcome = self
            .transition
            .run(event.user_id, bank_account_id, now)
            .await?;
        if let TransitionOutcome::RateLimited { retry_after_secs } = &outcome {
            info!(
                bank_account_id = %bank_account_id,
                retry_after_secs = *retry_after_secs,
                "Account transition rate limited"
            );
        }

        let moved = outcome.transitioned();
        for recurring in moved {
            notify(
                self.notifier.as_ref(),
                Notification::IncomeAdded {
                    user_id: recurring.user_id,
                    bank_account_id,
                    recurring_transaction_id: recurring.id,
                },
            )
            .await;
        }

        let summary = self
            .matcher
            .update_by_account(bank_account_id, source, now)
            .await?;
        Ok((summary.matched, moved.len()))
    }
}
