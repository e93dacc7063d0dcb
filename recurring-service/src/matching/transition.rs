//! Re-home income series when a user moves to a new bank account.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use service_core::error::AppError;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::config::MatchingConfig;
use crate::matching::matcher::pair_greedy;
use crate::matching::scorer::dedupe_candidates;
use crate::models::{
    BankTransaction, ExpectedMatch, ExpectedStatus, ExpectedTransaction, LedgerFilter,
    NewRecurringTransaction, RecurringTransaction,
};
use crate::services::experiment::{ExperimentGate, GateDecision};
use crate::services::ledger::{Ledger, QueryOptions};
use crate::services::metrics::{record_error, record_match};
use crate::services::repository::{DataSource, Repository};

#[derive(Debug, Clone)]
pub enum TransitionOutcome {
    /// Income already exists on the destination, or there is nowhere to move from.
    Skipped,
    Control,
    RateLimited { retry_after_secs: u64 },
    /// Series cloned onto the destination account; may be empty.
    Transitioned(Vec<RecurringTransaction>),
}

impl TransitionOutcome {
    pub fn transitioned(&self) -> &[RecurringTransaction] {
        match self {
            Self::Transitioned(created) => created,
            _ => &[],
        }
    }
}

pub struct AccountTransitionMatcher {
    repo: Arc<dyn Repository>,
    ledger: Arc<dyn Ledger>,
    gate: Arc<ExperimentGate>,
    config: MatchingConfig,
}

impl AccountTransitionMatcher {
    pub fn new(
        repo: Arc<dyn Repository>,
        ledger: Arc<dyn Ledger>,
        gate: Arc<ExperimentGate>,
        config: MatchingConfig,
    ) -> Self {
        Self {
            repo,
            ledger,
            gate,
            config,
        }
    }

    /// Runs at most once per destination account: any income ever seen there,
    /// deleted or not, turns this into a no-op.
    #[instrument(skip(self), fields(user_id = %user_id, bank_account_id = %bank_account_id))]
    pub async fn run(
        &self,
        user_id: Uuid,
        bank_account_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<TransitionOutcome, AppError> {
        if self
            .repo
            .count_incomes_including_deleted(bank_account_id)
            .await?
            > 0
        {
            debug!("Destination already has income history");
            return Ok(TransitionOutcome::Skipped);
        }

        let sources = self.repo.transition_sources(bank_account_id).await?;
        if sources.is_empty() {
            return Ok(TransitionOutcome::Skipped);
        }

        match self.gate.check(user_id, bank_account_id) {
            GateDecision::Run => {}
            GateDecision::Control => {
                debug!("User in control arm, skipping account transition");
                return Ok(TransitionOutcome::Control);
            }
            GateDecision::RateLimited { retry_after_secs } => {
                return Ok(TransitionOutcome::RateLimited { retry_after_secs });
            }
        }

        let today = now.date_naive();
        let mut created = Vec::new();
        for old_account in sources {
            let incomes = self.repo.valid_incomes_by_account(old_account).await?;
            for income in incomes {
                match self.transition(&income, bank_account_id, today).await {
                    Ok(Some(moved)) => created.push(moved),
                    Ok(None) => {}
                    Err(e) => {
                        record_error(e.kind());
                        warn!(
                            recurring_transaction_id = %income.id,
                            old_bank_account_id = %old_account,
                            error = %e,
                            "Failed to transition income"
                        );
                    }
                }
            }
        }

        info!(transitioned = created.len(), "Account transition completed");
        Ok(TransitionOutcome::Transitioned(created))
    }

    async fn transition(
        &self,
        income: &RecurringTransaction,
        bank_account_id: Uuid,
        today: NaiveDate,
    ) -> Result<Option<RecurringTransaction>, AppError> {
        let policy = self.config.settlement;
        let start = today - Duration::days(self.config.look_back_days);
        let end = today + Duration::days(self.config.look_forward_days);

        let predicted: Vec<ExpectedTransaction> = self
            .repo
            .expected_in_range(income.id, start, end, DataSource::Primary)
            .await?
            .into_iter()
            .filter(|e| e.status == ExpectedStatus::Predicted && !e.is_linked())
            .collect();

        let Some(window) = predicted
            .iter()
            .map(|e| income.schedule.window(e.expected_date, &policy))
            .reduce(|a, b| a.union(&b))
        else {
            return Ok(None);
        };

        let candidates: Vec<BankTransaction> = self
            .ledger
            .query(
                bank_account_id,
                &LedgerFilter::between(window.start, window.end).named(income.match_names()),
                QueryOptions::from_source(DataSource::Primary),
            )
            .await?;

        let pool = dedupe_candidates(candidates, income, self.config.min_income_amount);
        let schedule = income.schedule.clone();
        let pairs = pair_greedy(&predicted, pool, |date| schedule.window(date, &policy));
        if pairs.is_empty() {
            debug!(recurring_transaction_id = %income.id, "No matches on the new account");
            return Ok(None);
        }

        let moves: Vec<(Uuid, ExpectedMatch)> = pairs
            .iter()
            .map(|(idx, txn)| {
                let expected = &predicted[*idx];
                (expected.id, ExpectedMatch::from_transaction(expected, txn))
            })
            .collect();

        let moved = self
            .repo
            .transition_recurring(
                income,
                &NewRecurringTransaction::clone_onto(income, bank_account_id),
                &moves,
            )
            .await?;
        for _ in &moves {
            record_match("transition");
        }

        info!(
            old_recurring_transaction_id = %income.id,
            new_recurring_transaction_id = %moved.id,
            matched = moves.len(),
            "Income moved to new bank account"
        );
        Ok(Some(moved))
    }
}
