//! Daily missed-lifecycle sweep.
//!
//! Incomes still unresolved a few days after their expected date get one last
//! match attempt by name, then by amount, and are otherwise marked missed.
//! Expenses are never auto-matched here and are simply marked missed. A
//! user's only main paycheck going missed raises a single alert.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use service_core::error::AppError;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::config::{MatchingConfig, SweepConfig};
use crate::matching::matcher::{link, propagate_rename};
use crate::matching::scorer::{AmountPolicy, best_by_amount, best_by_name, is_eligible};
use crate::models::{
    BankTransaction, ExpectedTransaction, LedgerFilter, RecurringStatus, RecurringTransaction,
    TransactionType,
};
use crate::schedule::IntervalKind;
use crate::services::ledger::{Ledger, QueryOptions};
use crate::services::metrics::{record_error, record_match, record_missed, record_missed_alert};
use crate::services::notifications::{Notification, Notifier, notify};
use crate::services::repository::{DataSource, Repository};

/// How long after being marked missed a series is still swept: twice its
/// interval lookback, and never less than one lookback plus the sweep window.
pub fn missed_lookback_days(kind: IntervalKind, window_start_days: i64) -> i64 {
    let lookback = kind.lookback_days();
    (2 * lookback).max(lookback + window_start_days)
}

pub fn within_missed_lookback(
    missed: Option<DateTime<Utc>>,
    kind: IntervalKind,
    window_start_days: i64,
    today: NaiveDate,
) -> bool {
    match missed {
        None => true,
        Some(missed) => {
            (today - missed.date_naive()).num_days() <= missed_lookback_days(kind, window_start_days)
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepSummary {
    pub scanned: usize,
    pub matched: usize,
    pub marked_missed: usize,
    pub alerts: usize,
    pub failed: usize,
}

/// Recurring transactions seen during one pass, refreshed as the pass
/// mutates them.
type OwnerCache = HashMap<Uuid, Option<RecurringTransaction>>;

enum IncomeResolution {
    Matched,
    Missed,
}

pub struct MissedSweep {
    repo: Arc<dyn Repository>,
    ledger: Arc<dyn Ledger>,
    notifier: Arc<dyn Notifier>,
    matching: MatchingConfig,
    config: SweepConfig,
}

impl MissedSweep {
    pub fn new(
        repo: Arc<dyn Repository>,
        ledger: Arc<dyn Ledger>,
        notifier: Arc<dyn Notifier>,
        matching: MatchingConfig,
        config: SweepConfig,
    ) -> Self {
        Self {
            repo,
            ledger,
            notifier,
            matching,
            config,
        }
    }

    #[instrument(skip(self))]
    pub async fn run(&self, now: DateTime<Utc>) -> Result<SweepSummary, AppError> {
        let today = now.date_naive();
        let start = today - Duration::days(self.config.window_start_days);
        let end = today - Duration::days(self.config.window_end_days);

        let mut summary = SweepSummary::default();
        self.pass(TransactionType::Income, start, end, now, &mut summary)
            .await?;
        self.pass(TransactionType::Expense, start, end, now, &mut summary)
            .await?;

        info!(
            scanned = summary.scanned,
            matched = summary.matched,
            marked_missed = summary.marked_missed,
            alerts = summary.alerts,
            failed = summary.failed,
            "Missed-lifecycle sweep completed"
        );
        Ok(summary)
    }

    async fn pass(
        &self,
        kind: TransactionType,
        start: NaiveDate,
        end: NaiveDate,
        now: DateTime<Utc>,
        summary: &mut SweepSummary,
    ) -> Result<(), AppError> {
        let mut owners = OwnerCache::new();
        let mut cursor = None;

        loop {
            let page = self
                .repo
                .unresolved_expected(kind, start, end, cursor, self.config.page_size)
                .await?;
            let Some(last) = page.last() else {
                break;
            };
            cursor = Some(last.id);
            let exhausted = (page.len() as i64) < self.config.page_size;

            for row in page {
                summary.scanned += 1;
                let result = match kind {
                    TransactionType::Income => self.sweep_income(row.clone(), &mut owners, now, summary).await,
                    TransactionType::Expense => self.sweep_expense(&row, &mut owners, now, summary).await,
                };
                if let Err(e) = result {
                    summary.failed += 1;
                    record_error(e.kind());
                    warn!(
                        expected_transaction_id = %row.id,
                        recurring_transaction_id = %row.recurring_transaction_id,
                        error = %e,
                        "Failed to sweep expected transaction"
                    );
                }
            }

            if exhausted {
                break;
            }
        }
        Ok(())
    }

    async fn owner(
        &self,
        owners: &mut OwnerCache,
        id: Uuid,
    ) -> Result<Option<RecurringTransaction>, AppError> {
        if let Some(cached) = owners.get(&id) {
            return Ok(cached.clone());
        }
        let loaded = self
            .repo
            .get_recurring(id, DataSource::Primary)
            .await?
            .filter(|r| !r.is_deleted());
        owners.insert(id, loaded.clone());
        Ok(loaded)
    }

    async fn sweep_income(
        &self,
        mut row: ExpectedTransaction,
        owners: &mut OwnerCache,
        now: DateTime<Utc>,
        summary: &mut SweepSummary,
    ) -> Result<(), AppError> {
        let today = now.date_naive();
        let Some(mut recurring) = self.owner(owners, row.recurring_transaction_id).await? else {
            return Ok(());
        };
        if recurring.status != RecurringStatus::Valid {
            return Ok(());
        }
        if !within_missed_lookback(
            recurring.missed,
            recurring.schedule.kind(),
            self.config.window_start_days,
            today,
        ) {
            debug!(recurring_transaction_id = %recurring.id, "Missed too long ago, skipping");
            return Ok(());
        }

        let resolution = match self.find_income_match(&recurring, &row, today).await? {
            Some(txn) => self.apply_income_match(&mut recurring, &mut row, &txn).await?,
            None => IncomeResolution::Missed,
        };

        match resolution {
            IncomeResolution::Matched => {
                summary.matched += 1;
                record_match("sweep");
            }
            IncomeResolution::Missed => {
                self.mark_income_missed(&mut recurring, now, summary).await?;
            }
        }

        owners.insert(recurring.id, Some(recurring));
        Ok(())
    }

    /// Name match first, then amount, both inside the expectation's window.
    async fn find_income_match(
        &self,
        recurring: &RecurringTransaction,
        row: &ExpectedTransaction,
        today: NaiveDate,
    ) -> Result<Option<BankTransaction>, AppError> {
        let window = recurring
            .schedule
            .window(row.expected_date, &self.matching.settlement);

        let candidates = self
            .ledger
            .query(
                recurring.bank_account_id,
                &LedgerFilter::between(window.start, window.end),
                QueryOptions::from_source(DataSource::Primary),
            )
            .await?;

        let linked = self
            .repo
            .expected_in_range(
                recurring.id,
                today - Duration::days(self.matching.look_back_days),
                today + Duration::days(self.matching.look_forward_days),
                DataSource::Primary,
            )
            .await?;

        let pool: Vec<BankTransaction> = candidates
            .into_iter()
            .filter(|t| is_eligible(t, recurring, self.matching.min_income_amount))
            .filter(|t| !linked.iter().any(|e| e.links(t)))
            .collect();

        if let Some(txn) = best_by_name(&recurring.transaction_display_name, &pool, row.expected_date) {
            return Ok(Some(txn.clone()));
        }

        let reference = self
            .repo
            .latest_matched_before(recurring.id, row.expected_date)
            .await?
            .and_then(|e| e.observed_amount())
            .unwrap_or(row.expected_amount);
        let policy = AmountPolicy {
            min_reference: self.matching.min_income_amount,
            variance: self.matching.amount_variance,
        };

        Ok(best_by_amount(reference, &pool, row.expected_date, &policy).cloned())
    }

    /// Link the match and propagate any rename. A rename that collides with
    /// another series marks this one missed instead.
    async fn apply_income_match(
        &self,
        recurring: &mut RecurringTransaction,
        row: &mut ExpectedTransaction,
        txn: &BankTransaction,
    ) -> Result<IncomeResolution, AppError> {
        match link(self.repo.as_ref(), row, txn).await {
            Ok(()) => {}
            Err(AppError::Conflict(e)) => {
                debug!(expected_transaction_id = %row.id, error = %e, "Expectation resolved elsewhere");
                return Ok(IncomeResolution::Matched);
            }
            Err(e) => return Err(e),
        }

        match propagate_rename(self.repo.as_ref(), recurring, txn).await {
            Ok(_) => Ok(IncomeResolution::Matched),
            Err(AppError::Conflict(e)) => {
                warn!(
                    recurring_transaction_id = %recurring.id,
                    error = %e,
                    "Rename collides with another recurring transaction, marking missed"
                );
                Ok(IncomeResolution::Missed)
            }
            Err(e) => Err(e),
        }
    }

    async fn mark_income_missed(
        &self,
        recurring: &mut RecurringTransaction,
        now: DateTime<Utc>,
        summary: &mut SweepSummary,
    ) -> Result<(), AppError> {
        if self.repo.mark_missed(recurring.id, now).await? {
            recurring.missed = Some(now);
            summary.marked_missed += 1;
            record_missed("income");
            info!(recurring_transaction_id = %recurring.id, "Income marked missed");
            notify(
                self.notifier.as_ref(),
                Notification::IncomeStatusChanged {
                    user_id: recurring.user_id,
                    recurring_transaction_id: recurring.id,
                    status: recurring.status,
                    missed: recurring.missed,
                },
            )
            .await;
        }

        if let Some(missed) = recurring.missed {
            if self.maybe_alert(recurring, missed, now).await? {
                summary.alerts += 1;
            }
        }
        Ok(())
    }

    /// Alert once per miss when the user's only live main paycheck has been
    /// missed for long enough.
    async fn maybe_alert(
        &self,
        recurring: &RecurringTransaction,
        missed: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        if self.repo.main_paycheck_id(recurring.bank_account_id).await? != Some(recurring.id) {
            return Ok(false);
        }
        if now - missed < Duration::days(self.config.alert_min_age_days) {
            return Ok(false);
        }

        let others = self.repo.main_paychecks_for_user(recurring.user_id).await?;
        if others
            .iter()
            .any(|r| r.id != recurring.id && r.missed.is_none())
        {
            debug!(recurring_transaction_id = %recurring.id, "Another main paycheck is healthy, no alert");
            return Ok(false);
        }

        if !self.repo.record_missed_alert(recurring.id, missed).await? {
            return Ok(false);
        }

        record_missed_alert();
        info!(recurring_transaction_id = %recurring.id, "Missed paycheck alert raised");
        notify(
            self.notifier.as_ref(),
            Notification::MissedPaycheckAlert {
                user_id: recurring.user_id,
                bank_account_id: recurring.bank_account_id,
                recurring_transaction_id: recurring.id,
                missed,
            },
        )
        .await;
        Ok(true)
    }

    async fn sweep_expense(
        &self,
        row: &ExpectedTransaction,
        owners: &mut OwnerCache,
        now: DateTime<Utc>,
        summary: &mut SweepSummary,
    ) -> Result<(), AppError> {
        let Some(mut recurring) = self.owner(owners, row.recurring_transaction_id).await? else {
            return Ok(());
        };
        if recurring.missed.is_some() {
            return Ok(());
        }

        if self.repo.mark_missed(recurring.id, now).await? {
            recurring.missed = Some(now);
            summary.marked_missed += 1;
            record_missed("expense");
            notify(
                self.notifier.as_ref(),
                Notification::TransactionMissed {
                    user_id: recurring.user_id,
                    recurring_transaction_id: recurring.id,
                    expected_date: row.expected_date,
                    expected_amount: row.expected_amount,
                },
            )
            .await;
        }

        owners.insert(recurring.id, Some(recurring));
        Ok(())
    }
}
