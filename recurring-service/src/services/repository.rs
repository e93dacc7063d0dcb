//! Persistence seam for recurring and expected transactions.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use service_core::error::AppError;
use uuid::Uuid;

use crate::models::{
    ExpectedMatch, ExpectedTransaction, NewExpectedTransaction, NewRecurringTransaction,
    RecurringTransaction, RecurringUpdate, TransactionType,
};

/// Which connection serves a read. Writes always go to the primary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DataSource {
    #[default]
    Primary,
    Replica,
}

impl DataSource {
    pub fn from_replica_flag(use_read_replica: bool) -> Self {
        if use_read_replica {
            Self::Replica
        } else {
            Self::Primary
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Replica => "replica",
        }
    }
}

#[async_trait]
pub trait Repository: Send + Sync {
    // -------------------------------------------------------------------------
    // Recurring transactions
    // -------------------------------------------------------------------------

    async fn get_recurring(
        &self,
        id: Uuid,
        source: DataSource,
    ) -> Result<Option<RecurringTransaction>, AppError>;

    /// Not soft-deleted and in a status that permits auto-matching, oldest first.
    async fn matchable_recurring_by_account(
        &self,
        bank_account_id: Uuid,
        source: DataSource,
    ) -> Result<Vec<RecurringTransaction>, AppError>;

    /// VALID, non-deleted income series on an account.
    async fn valid_incomes_by_account(
        &self,
        bank_account_id: Uuid,
    ) -> Result<Vec<RecurringTransaction>, AppError>;

    /// Income series ever created on an account, soft-deleted ones included.
    async fn count_incomes_including_deleted(&self, bank_account_id: Uuid)
        -> Result<i64, AppError>;

    /// Fails with `NotFound` when the row vanished and `Conflict` when a
    /// display name collides with another series.
    async fn update_recurring(&self, id: Uuid, update: &RecurringUpdate) -> Result<(), AppError>;

    /// Set `missed` only if it is currently null. Returns whether it changed.
    async fn mark_missed(&self, id: Uuid, at: DateTime<Utc>) -> Result<bool, AppError>;

    /// Clone `original` as `clone`, move each `(expected id, match)` onto the
    /// clone with the match applied, soft-delete `original` and audit the
    /// move. All or nothing: on any error no row has changed, so the
    /// transition can be retried. `Conflict` when a moved row is no longer an
    /// open prediction of `original` or the original is already gone.
    async fn transition_recurring(
        &self,
        original: &RecurringTransaction,
        clone: &NewRecurringTransaction,
        moves: &[(Uuid, ExpectedMatch)],
    ) -> Result<RecurringTransaction, AppError>;

    // -------------------------------------------------------------------------
    // Accounts
    // -------------------------------------------------------------------------

    async fn main_paycheck_id(&self, bank_account_id: Uuid) -> Result<Option<Uuid>, AppError>;

    /// Non-deleted series designated main paycheck on any of the user's accounts.
    async fn main_paychecks_for_user(
        &self,
        user_id: Uuid,
    ) -> Result<Vec<RecurringTransaction>, AppError>;

    /// Accounts the user migrated away from onto `bank_account_id`.
    async fn transition_sources(&self, bank_account_id: Uuid) -> Result<Vec<Uuid>, AppError>;

    /// Remember that an alert went out for this miss. Returns false when one
    /// already had.
    async fn record_missed_alert(
        &self,
        recurring_transaction_id: Uuid,
        missed: DateTime<Utc>,
    ) -> Result<bool, AppError>;

    // -------------------------------------------------------------------------
    // Expected transactions
    // -------------------------------------------------------------------------

    /// Non-deleted expectations with `expected_date` in `[start, end]`, oldest first.
    async fn expected_in_range(
        &self,
        recurring_transaction_id: Uuid,
        start: NaiveDate,
        end: NaiveDate,
        source: DataSource,
    ) -> Result<Vec<ExpectedTransaction>, AppError>;

    async fn latest_expected(
        &self,
        recurring_transaction_id: Uuid,
        source: DataSource,
    ) -> Result<Option<ExpectedTransaction>, AppError>;

    async fn expected_on(
        &self,
        recurring_transaction_id: Uuid,
        expected_date: NaiveDate,
    ) -> Result<Option<ExpectedTransaction>, AppError>;

    /// Most recent expectation linked to a real transaction dated before `before`.
    async fn latest_matched_before(
        &self,
        recurring_transaction_id: Uuid,
        before: NaiveDate,
    ) -> Result<Option<ExpectedTransaction>, AppError>;

    /// Insert-or-restore keyed by (recurring transaction, date). Safe to repeat.
    async fn upsert_expected(
        &self,
        rows: &[NewExpectedTransaction],
    ) -> Result<Vec<ExpectedTransaction>, AppError>;

    /// Write a match back. Never advances status backwards and never links a
    /// real transaction already linked elsewhere in the series (`Conflict`).
    async fn apply_expected_match(
        &self,
        id: Uuid,
        matched: &ExpectedMatch,
    ) -> Result<(), AppError>;

    /// Soft-delete unsettled expectations dated after `after`, annotating why.
    async fn detach_expected(
        &self,
        recurring_transaction_id: Uuid,
        after: NaiveDate,
        note: &str,
    ) -> Result<u64, AppError>;

    /// Page of non-deleted expectations of `kind` with no pending or settled
    /// date and `expected_date` in `[start, end]`, keyed after `after_id`.
    async fn unresolved_expected(
        &self,
        kind: TransactionType,
        start: NaiveDate,
        end: NaiveDate,
        after_id: Option<Uuid>,
        limit: i64,
    ) -> Result<Vec<ExpectedTransaction>, AppError>;
}
