//! Recurring transaction model.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use sqlx::FromRow;
use uuid::Uuid;

use crate::schedule::Schedule;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum TransactionType {
    Income,
    Expense,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Income => "INCOME",
            Self::Expense => "EXPENSE",
        }
    }

    /// Whether a signed amount has the sign this type requires.
    pub fn accepts(&self, amount: Decimal) -> bool {
        match self {
            Self::Income => amount > Decimal::ZERO,
            Self::Expense => amount < Decimal::ZERO,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecurringStatus {
    Valid,
    NotValidated,
    PendingVerification,
    SingleObservation,
    InvalidName,
}

impl RecurringStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Valid => "VALID",
            Self::NotValidated => "NOT_VALIDATED",
            Self::PendingVerification => "PENDING_VERIFICATION",
            Self::SingleObservation => "SINGLE_OBSERVATION",
            Self::InvalidName => "INVALID_NAME",
        }
    }

    /// Statuses the matcher may reconcile without user input.
    pub fn allows_auto_match(&self) -> bool {
        !matches!(self, Self::InvalidName)
    }
}

/// A detected repeating income or expense on one bank account.
#[derive(Debug, Clone)]
pub struct RecurringTransaction {
    pub id: Uuid,
    pub bank_account_id: Uuid,
    pub user_id: Uuid,
    pub transaction_display_name: String,
    pub pending_display_name: Option<String>,
    pub user_display_name: Option<String>,
    /// Signed: positive is income, negative is expense.
    pub user_amount: Decimal,
    pub transaction_type: TransactionType,
    pub status: RecurringStatus,
    pub schedule: Schedule,
    pub missed: Option<DateTime<Utc>>,
    pub possible_name_change: Option<String>,
    pub created_utc: DateTime<Utc>,
    pub deleted_utc: Option<DateTime<Utc>>,
}

impl RecurringTransaction {
    pub fn is_deleted(&self) -> bool {
        self.deleted_utc.is_some()
    }

    pub fn is_income(&self) -> bool {
        self.transaction_type == TransactionType::Income
    }

    /// Not soft-deleted and in a status that permits auto-matching.
    pub fn is_matchable(&self) -> bool {
        !self.is_deleted() && self.status.allows_auto_match()
    }

    pub fn display_name(&self) -> &str {
        self.user_display_name
            .as_deref()
            .unwrap_or(&self.transaction_display_name)
    }

    /// Names a real transaction may carry for this series: the settled name
    /// and, when different, the pending name.
    pub fn match_names(&self) -> Vec<String> {
        let mut names = vec![self.transaction_display_name.clone()];
        if let Some(pending) = &self.pending_display_name {
            if !names.contains(pending) {
                names.push(pending.clone());
            }
        }
        names
    }

    pub fn created_date(&self) -> NaiveDate {
        self.created_utc.date_naive()
    }

    /// Type sign must agree with the amount sign.
    pub fn validate(&self) -> Result<(), AppError> {
        validate_amount(self.transaction_type, self.user_amount)
    }
}

pub(crate) fn validate_amount(kind: TransactionType, amount: Decimal) -> Result<(), AppError> {
    if kind.accepts(amount) {
        Ok(())
    } else {
        Err(AppError::ValidationError(format!(
            "{} requires a {} amount, got {}",
            kind.as_str(),
            if kind == TransactionType::Income {
                "positive"
            } else {
                "negative"
            },
            amount
        )))
    }
}

/// Database row shape; the schedule columns are validated on conversion.
#[derive(Debug, Clone, FromRow)]
pub struct RecurringTransactionRow {
    pub id: Uuid,
    pub bank_account_id: Uuid,
    pub user_id: Uuid,
    pub transaction_display_name: String,
    pub pending_display_name: Option<String>,
    pub user_display_name: Option<String>,
    pub user_amount: Decimal,
    pub transaction_type: TransactionType,
    pub status: RecurringStatus,
    pub interval_kind: String,
    pub params: Vec<String>,
    pub roll_direction: String,
    pub dtstart: NaiveDate,
    pub missed: Option<DateTime<Utc>>,
    pub possible_name_change: Option<String>,
    pub created_utc: DateTime<Utc>,
    pub deleted_utc: Option<DateTime<Utc>>,
}

impl TryFrom<RecurringTransactionRow> for RecurringTransaction {
    type Error = AppError;

    fn try_from(row: RecurringTransactionRow) -> Result<Self, Self::Error> {
        let schedule =
            Schedule::from_parts(&row.interval_kind, &row.params, &row.roll_direction, row.dtstart)?;
        Ok(Self {
            id: row.id,
            bank_account_id: row.bank_account_id,
            user_id: row.user_id,
            transaction_display_name: row.transaction_display_name,
            pending_display_name: row.pending_display_name,
            user_display_name: row.user_display_name,
            user_amount: row.user_amount,
            transaction_type: row.transaction_type,
            status: row.status,
            schedule,
            missed: row.missed,
            possible_name_change: row.possible_name_change,
            created_utc: row.created_utc,
            deleted_utc: row.deleted_utc,
        })
    }
}

/// Insert shape, used when a series is cloned onto another account.
#[derive(Debug, Clone)]
pub struct NewRecurringTransaction {
    pub bank_account_id: Uuid,
    pub user_id: Uuid,
    pub transaction_display_name: String,
    pub pending_display_name: Option<String>,
    pub user_display_name: Option<String>,
    pub user_amount: Decimal,
    pub transaction_type: TransactionType,
    pub status: RecurringStatus,
    pub schedule: Schedule,
}

impl NewRecurringTransaction {
    /// Same series, same schedule, on another account.
    pub fn clone_onto(source: &RecurringTransaction, bank_account_id: Uuid) -> Self {
        Self {
            bank_account_id,
            user_id: source.user_id,
            transaction_display_name: source.transaction_display_name.clone(),
            pending_display_name: source.pending_display_name.clone(),
            user_display_name: source.user_display_name.clone(),
            user_amount: source.user_amount,
            transaction_type: source.transaction_type,
            status: source.status,
            schedule: source.schedule.clone(),
        }
    }

    pub fn validate(&self) -> Result<(), AppError> {
        validate_amount(self.transaction_type, self.user_amount)
    }
}

/// Partial update; `None` leaves a column untouched.
#[derive(Debug, Clone, Default)]
pub struct RecurringUpdate {
    pub schedule: Option<Schedule>,
    pub missed: Option<Option<DateTime<Utc>>>,
    pub transaction_display_name: Option<String>,
    pub pending_display_name: Option<String>,
    pub possible_name_change: Option<Option<String>>,
}

impl RecurringUpdate {
    pub fn is_empty(&self) -> bool {
        self.schedule.is_none()
            && self.missed.is_none()
            && self.transaction_display_name.is_none()
            && self.pending_display_name.is_none()
            && self.possible_name_change.is_none()
    }

    pub fn clear_missed(mut self) -> Self {
        self.missed = Some(None);
        self
    }

    /// Apply to an in-memory copy, mirroring what the repository persists.
    pub fn apply_to(&self, recurring: &mut RecurringTransaction) {
        if let Some(schedule) = &self.schedule {
            recurring.schedule = schedule.clone();
        }
        if let Some(missed) = self.missed {
            recurring.missed = missed;
        }
        if let Some(name) = &self.transaction_display_name {
            recurring.transaction_display_name = name.clone();
        }
        if let Some(name) = &self.pending_display_name {
            recurring.pending_display_name = Some(name.clone());
        }
        if let Some(change) = &self.possible_name_change {
            recurring.possible_name_change = change.clone();
        }
    }
}
