//! Expected (projected or realized) occurrences of a recurring transaction.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use super::bank_transaction::BankTransaction;
use super::recurring::RecurringTransaction;

/// Status only advances: PREDICTED -> PENDING -> SETTLED (PENDING may be skipped).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum ExpectedStatus {
    Predicted,
    Pending,
    Settled,
}

impl ExpectedStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Predicted => "PREDICTED",
            Self::Pending => "PENDING",
            Self::Settled => "SETTLED",
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Predicted => 0,
            Self::Pending => 1,
            Self::Settled => 2,
        }
    }

    pub fn can_advance_to(&self, next: ExpectedStatus) -> bool {
        next.rank() > self.rank()
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct ExpectedTransaction {
    pub id: Uuid,
    pub recurring_transaction_id: Uuid,
    pub bank_account_id: Uuid,
    pub user_id: Uuid,
    pub expected_date: NaiveDate,
    pub expected_amount: Decimal,
    pub status: ExpectedStatus,
    pub pending_date: Option<NaiveDate>,
    pub pending_amount: Option<Decimal>,
    pub settled_date: Option<NaiveDate>,
    pub settled_amount: Option<Decimal>,
    pub bank_transaction_id: Option<Uuid>,
    pub bank_transaction_external_id: Option<String>,
    pub display_name: String,
    pub pending_display_name: Option<String>,
    pub extra: Option<serde_json::Value>,
    pub deleted_utc: Option<DateTime<Utc>>,
}

impl ExpectedTransaction {
    pub fn is_linked(&self) -> bool {
        self.bank_transaction_id.is_some()
    }

    /// Whether this expectation already points at `txn`, by stable external id
    /// when both sides carry one, else by raw id.
    pub fn links(&self, txn: &BankTransaction) -> bool {
        match (&self.bank_transaction_external_id, &txn.external_id) {
            (Some(ours), Some(theirs)) => ours == theirs,
            _ => self.bank_transaction_id == Some(txn.id),
        }
    }

    /// Date the real transaction landed, settled preferred over pending.
    pub fn observed_date(&self) -> Option<NaiveDate> {
        self.settled_date.or(self.pending_date)
    }

    pub fn observed_amount(&self) -> Option<Decimal> {
        self.settled_amount.or(self.pending_amount)
    }
}

/// Unsaved expectation produced by the generator.
#[derive(Debug, Clone, PartialEq)]
pub struct NewExpectedTransaction {
    pub recurring_transaction_id: Uuid,
    pub bank_account_id: Uuid,
    pub user_id: Uuid,
    pub expected_date: NaiveDate,
    pub expected_amount: Decimal,
    pub display_name: String,
    pub pending_display_name: Option<String>,
}

impl NewExpectedTransaction {
    pub fn for_date(recurring: &RecurringTransaction, expected_date: NaiveDate) -> Self {
        Self {
            recurring_transaction_id: recurring.id,
            bank_account_id: recurring.bank_account_id,
            user_id: recurring.user_id,
            expected_date,
            expected_amount: recurring.user_amount,
            display_name: recurring.display_name().to_string(),
            pending_display_name: recurring.pending_display_name.clone(),
        }
    }
}

/// Fields written back when a real transaction is paired with an expectation.
#[derive(Debug, Clone, PartialEq)]
pub struct ExpectedMatch {
    pub status: ExpectedStatus,
    pub pending_date: Option<NaiveDate>,
    pub pending_amount: Option<Decimal>,
    pub settled_date: Option<NaiveDate>,
    pub settled_amount: Option<Decimal>,
    pub bank_transaction_id: Uuid,
    pub bank_transaction_external_id: Option<String>,
    pub pending_display_name: Option<String>,
}

impl ExpectedMatch {
    /// Pending transactions fill the pending fields; posted ones settle the
    /// expectation while keeping any pending fields already recorded.
    pub fn from_transaction(expected: &ExpectedTransaction, txn: &BankTransaction) -> Self {
        if txn.pending {
            Self {
                status: ExpectedStatus::Pending,
                pending_date: Some(txn.transaction_date),
                pending_amount: Some(txn.amount),
                settled_date: None,
                settled_amount: None,
                bank_transaction_id: txn.id,
                bank_transaction_external_id: txn.external_id.clone(),
                pending_display_name: txn.pending_display_name.clone(),
            }
        } else {
            Self {
                status: ExpectedStatus::Settled,
                pending_date: expected.pending_date,
                pending_amount: expected.pending_amount,
                settled_date: Some(txn.transaction_date),
                settled_amount: Some(txn.amount),
                bank_transaction_id: txn.id,
                bank_transaction_external_id: txn
                    .external_id
                    .clone()
                    .or_else(|| expected.bank_transaction_external_id.clone()),
                pending_display_name: txn
                    .pending_display_name
                    .clone()
                    .or_else(|| expected.pending_display_name.clone()),
            }
        }
    }

    /// Apply to an in-memory copy, mirroring what the repository persists.
    pub fn apply_to(&self, expected: &mut ExpectedTransaction) {
        expected.status = self.status;
        expected.pending_date = self.pending_date;
        expected.pending_amount = self.pending_amount;
        expected.settled_date = self.settled_date;
        expected.settled_amount = self.settled_amount;
        expected.bank_transaction_id = Some(self.bank_transaction_id);
        expected.bank_transaction_external_id = self.bank_transaction_external_id.clone();
        expected.pending_display_name = self.pending_display_name.clone();
    }
}
