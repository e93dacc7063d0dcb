//! Per-account reconciliation of expectations against real transactions.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use service_core::error::AppError;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::config::MatchingConfig;
use crate::matching::drift::{DriftCorrector, DriftOutcome, has_drift};
use crate::matching::generator::Generator;
use crate::matching::scorer::dedupe_candidates;
use crate::models::{
    BankTransaction, ExpectedMatch, ExpectedStatus, ExpectedTransaction, LedgerFilter,
    RecurringTransaction, RecurringUpdate,
};
use crate::schedule::{SettlementPolicy, SettlementWindow};
use crate::services::audit::AuditLog;
use crate::services::inference::ScheduleInference;
use crate::services::ledger::{Ledger, QueryOptions};
use crate::services::metrics::{record_error, record_match};
use crate::services::repository::{DataSource, Repository};

/// Pair expectations with candidates, oldest expectation first. Each takes
/// the in-window candidate closest to its expected date, which then leaves
/// the pool. First match wins; the result is not a globally optimal
/// assignment. Returns `(index into expectations, candidate)` pairs.
pub fn pair_greedy<W>(
    expectations: &[ExpectedTransaction],
    candidates: Vec<BankTransaction>,
    window_of: W,
) -> Vec<(usize, BankTransaction)>
where
    W: Fn(NaiveDate) -> SettlementWindow,
{
    let mut order: Vec<usize> = (0..expectations.len()).collect();
    order.sort_by_key(|&i| expectations[i].expected_date);

    let mut pool = candidates;
    let mut pairs = Vec::new();

    for i in order {
        let expected_date = expectations[i].expected_date;
        let window = window_of(expected_date);

        let best = pool
            .iter()
            .enumerate()
            .filter(|(_, t)| window.contains(t.transaction_date))
            .min_by_key(|(_, t)| (t.transaction_date - expected_date).num_days().abs())
            .map(|(idx, _)| idx);

        if let Some(idx) = best {
            pairs.push((i, pool.remove(idx)));
        }
    }

    pairs
}

/// Rename to propagate when a matched transaction shows the series under a
/// different name.
pub fn rename_for(recurring: &RecurringTransaction, txn: &BankTransaction) -> Option<RecurringUpdate> {
    let mut update = RecurringUpdate::default();

    if let Some(pending) = txn.pending_display_name.as_ref().filter(|p| !p.is_empty()) {
        if recurring.pending_display_name.as_ref() != Some(pending) {
            update.pending_display_name = Some(pending.clone());
        }
    }

    if !txn.pending
        && !txn.display_name.is_empty()
        && txn.display_name != recurring.transaction_display_name
    {
        update.transaction_display_name = Some(txn.display_name.clone());
        update.possible_name_change = Some(Some(recurring.transaction_display_name.clone()));
    }

    (!update.is_empty()).then_some(update)
}

/// Persist a pairing and mirror it on the in-memory row.
pub async fn link(
    repo: &dyn Repository,
    expected: &mut ExpectedTransaction,
    txn: &BankTransaction,
) -> Result<(), AppError> {
    let matched = ExpectedMatch::from_transaction(expected, txn);
    repo.apply_expected_match(expected.id, &matched).await?;
    matched.apply_to(expected);
    Ok(())
}

/// Persist a rename; a collision with another series surfaces as `Conflict`.
pub async fn propagate_rename(
    repo: &dyn Repository,
    recurring: &mut RecurringTransaction,
    txn: &BankTransaction,
) -> Result<bool, AppError> {
    let Some(update) = rename_for(recurring, txn) else {
        return Ok(false);
    };
    repo.update_recurring(recurring.id, &update).await?;
    update.apply_to(recurring);
    info!(
        recurring_transaction_id = %recurring.id,
        display_name = %recurring.transaction_display_name,
        "Recurring transaction renamed from matched transaction"
    );
    Ok(true)
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AccountSummary {
    pub processed: usize,
    pub matched: usize,
    pub failed: usize,
    pub drift_corrected: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecurringOutcome {
    pub matched: usize,
    pub missed_cleared: bool,
    pub drift: Option<DriftOutcome>,
}

pub struct Matcher {
    repo: Arc<dyn Repository>,
    ledger: Arc<dyn Ledger>,
    generator: Generator,
    drift: DriftCorrector,
    config: MatchingConfig,
}

impl Matcher {
    pub fn new(
        repo: Arc<dyn Repository>,
        ledger: Arc<dyn Ledger>,
        inference: Arc<dyn ScheduleInference>,
        audit: Arc<dyn AuditLog>,
        config: MatchingConfig,
    ) -> Self {
        Self {
            generator: Generator::new(repo.clone()),
            drift: DriftCorrector::new(repo.clone(), inference, audit, &config),
            repo,
            ledger,
            config,
        }
    }

    pub fn generator(&self) -> &Generator {
        &self.generator
    }

    fn policy(&self) -> SettlementPolicy {
        self.config.settlement
    }

    /// Reconcile every matchable recurring transaction on an account, one at
    /// a time. A failing series is logged and counted; the rest continue.
    #[instrument(skip(self, source), fields(bank_account_id = %bank_account_id, source = source.as_str()))]
    pub async fn update_by_account(
        &self,
        bank_account_id: Uuid,
        source: DataSource,
        now: DateTime<Utc>,
    ) -> Result<AccountSummary, AppError> {
        let recurring = self
            .repo
            .matchable_recurring_by_account(bank_account_id, source)
            .await?;

        let mut summary = AccountSummary::default();
        for item in recurring.into_iter().filter(|r| r.is_matchable()) {
            summary.processed += 1;
            match self.update_recurring(item.clone(), source, now).await {
                Ok(outcome) => {
                    summary.matched += outcome.matched;
                    if outcome.drift.as_ref().is_some_and(DriftOutcome::is_corrected) {
                        summary.drift_corrected += 1;
                    }
                }
                Err(e) => {
                    summary.failed += 1;
                    record_error(e.kind());
                    warn!(
                        recurring_transaction_id = %item.id,
                        error = %e,
                        "Failed to reconcile recurring transaction"
                    );
                }
            }
        }

        info!(
            processed = summary.processed,
            matched = summary.matched,
            failed = summary.failed,
            "Account reconciled"
        );
        Ok(summary)
    }

    /// Reconcile one recurring transaction.
    #[instrument(skip(self, recurring), fields(recurring_transaction_id = %recurring.id))]
    pub async fn update_recurring(
        &self,
        mut recurring: RecurringTransaction,
        source: DataSource,
        now: DateTime<Utc>,
    ) -> Result<RecurringOutcome, AppError> {
        let today = now.date_naive();
        let start = recurring
            .created_date()
            .max(today - Duration::days(self.config.look_back_days));
        let end = today + Duration::days(self.config.look_forward_days);

        let mut expectations = self
            .generator
            .ensure_generated(&recurring, start, end, today, source)
            .await?;

        let mut matched_ids = self
            .resolve_pending(&mut expectations, recurring.bank_account_id, end, source)
            .await?;

        matched_ids.extend(
            self.match_predicted(&mut recurring, &mut expectations, source)
                .await?,
        );

        if matched_ids.is_empty() {
            return Ok(RecurringOutcome {
                matched: 0,
                missed_cleared: false,
                drift: None,
            });
        }

        let matched: Vec<ExpectedTransaction> = expectations
            .iter()
            .filter(|e| matched_ids.contains(&e.id))
            .cloned()
            .collect();

        let mut update = RecurringUpdate::default();
        let missed_cleared = recurring.missed.is_some()
            && self.has_recent_match(&recurring, &matched, today);
        if missed_cleared {
            update = update.clear_missed();
        }

        let drift = if has_drift(&matched) {
            Some(self.drift.correct(&recurring, &update, today).await)
        } else {
            None
        };

        let persisted = drift.as_ref().is_some_and(DriftOutcome::is_corrected);
        if !persisted && !update.is_empty() {
            self.repo.update_recurring(recurring.id, &update).await?;
        }
        if missed_cleared {
            info!("Missed flag cleared after recent match");
        }

        Ok(RecurringOutcome {
            matched: matched.len(),
            missed_cleared,
            drift,
        })
    }

    /// Settle pending rows whose linked transaction has since posted.
    async fn resolve_pending(
        &self,
        expectations: &mut [ExpectedTransaction],
        bank_account_id: Uuid,
        end: NaiveDate,
        source: DataSource,
    ) -> Result<Vec<Uuid>, AppError> {
        let earliest = expectations
            .iter()
            .filter(|e| e.status == ExpectedStatus::Pending)
            .filter_map(|e| e.pending_date)
            .min();
        let Some(earliest) = earliest else {
            return Ok(Vec::new());
        };

        let posted = self
            .ledger
            .query(
                bank_account_id,
                &LedgerFilter::between(earliest, end).posted_only(),
                QueryOptions::from_source(source),
            )
            .await?;

        let mut settled = Vec::new();
        for expected in expectations
            .iter_mut()
            .filter(|e| e.status == ExpectedStatus::Pending)
        {
            let Some(txn) = posted.iter().find(|t| expected.links(t)) else {
                continue;
            };
            match link(self.repo.as_ref(), expected, txn).await {
                Ok(()) => {
                    record_match("settle");
                    settled.push(expected.id);
                }
                Err(AppError::Conflict(e)) => {
                    debug!(expected_transaction_id = %expected.id, error = %e, "Pending row already resolved");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(settled)
    }

    /// Pair predicted rows with unlinked candidates from one combined query.
    async fn match_predicted(
        &self,
        recurring: &mut RecurringTransaction,
        expectations: &mut [ExpectedTransaction],
        source: DataSource,
    ) -> Result<Vec<Uuid>, AppError> {
        let policy = self.policy();
        let predicted: Vec<ExpectedTransaction> = expectations
            .iter()
            .filter(|e| e.status == ExpectedStatus::Predicted && !e.is_linked())
            .cloned()
            .collect();

        let Some(window) = predicted
            .iter()
            .map(|e| recurring.schedule.window(e.expected_date, &policy))
            .reduce(|a, b| a.union(&b))
        else {
            return Ok(Vec::new());
        };

        let candidates = self
            .ledger
            .query(
                recurring.bank_account_id,
                &LedgerFilter::between(window.start, window.end).named(recurring.match_names()),
                QueryOptions::from_source(source),
            )
            .await?;

        let unlinked: Vec<BankTransaction> = candidates
            .into_iter()
            .filter(|t| !expectations.iter().any(|e| e.links(t)))
            .collect();

        let pool = dedupe_candidates(unlinked, recurring, self.config.min_income_amount);
        let schedule = recurring.schedule.clone();
        let pairs = pair_greedy(&predicted, pool, |date| schedule.window(date, &policy));

        let mut matched = Vec::new();
        for (idx, txn) in pairs {
            let id = predicted[idx].id;
            let Some(expected) = expectations.iter_mut().find(|e| e.id == id) else {
                continue;
            };

            match link(self.repo.as_ref(), expected, &txn).await {
                Ok(()) => {}
                Err(AppError::Conflict(e)) => {
                    debug!(expected_transaction_id = %id, error = %e, "Skipping already-linked pairing");
                    continue;
                }
                Err(e) => return Err(e),
            }
            record_match("matcher");
            matched.push(id);
            debug!(
                expected_transaction_id = %id,
                bank_transaction_id = %txn.id,
                expected_date = %expected.expected_date,
                transaction_date = %txn.transaction_date,
                "Expectation matched"
            );

            match propagate_rename(self.repo.as_ref(), recurring, &txn).await {
                Ok(_) => {}
                Err(AppError::Conflict(e)) => {
                    warn!(error = %e, "Rename collides with another recurring transaction");
                }
                Err(e) => return Err(e),
            }
        }

        Ok(matched)
    }

    /// A match within one interval of today, by expected or observed date.
    fn has_recent_match(
        &self,
        recurring: &RecurringTransaction,
        matched: &[ExpectedTransaction],
        today: NaiveDate,
    ) -> bool {
        let horizon = recurring.schedule.lookback_days();
        matched.iter().any(|e| {
            (today - e.expected_date).num_days() <= horizon
                || e
                    .observed_date()
                    .is_some_and(|d| (today - d).num_days() <= horizon)
        })
    }
}
