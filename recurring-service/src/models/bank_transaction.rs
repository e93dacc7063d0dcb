//! Real bank transactions, read from the ledger.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Statuses the ledger never offers as match candidates.
pub const EXCLUDED_STATUSES: &[&str] = &["CANCELED", "RETURNED"];

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct BankTransaction {
    pub id: Uuid,
    /// Stable across the pending -> posted transition when the bank provides it.
    pub external_id: Option<String>,
    pub bank_account_id: Uuid,
    pub amount: Decimal,
    pub transaction_date: NaiveDate,
    pub display_name: String,
    pub pending_display_name: Option<String>,
    pub pending: bool,
    pub status: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    #[default]
    DateAscending,
    DateDescending,
}

/// Ledger query filter. Empty `display_names` means any name.
#[derive(Debug, Clone)]
pub struct LedgerFilter {
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub display_names: Vec<String>,
    pub min_amount: Option<Decimal>,
    pub max_amount: Option<Decimal>,
    pub exclude_pending: bool,
    pub exclude_statuses: Vec<String>,
}

impl LedgerFilter {
    pub fn between(start: NaiveDate, end: NaiveDate) -> Self {
        Self {
            start,
            end,
            display_names: Vec::new(),
            min_amount: None,
            max_amount: None,
            exclude_pending: false,
            exclude_statuses: EXCLUDED_STATUSES.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn named(mut self, names: Vec<String>) -> Self {
        self.display_names = names;
        self
    }

    pub fn posted_only(mut self) -> Self {
        self.exclude_pending = true;
        self
    }

    pub fn amount_between(mut self, min: Option<Decimal>, max: Option<Decimal>) -> Self {
        self.min_amount = min;
        self.max_amount = max;
        self
    }

    /// In-memory evaluation, kept in step with the SQL the ledger issues.
    pub fn matches(&self, txn: &BankTransaction) -> bool {
        if txn.transaction_date < self.start || txn.transaction_date > self.end {
            return false;
        }
        if self.exclude_pending && txn.pending {
            return false;
        }
        if self.exclude_statuses.iter().any(|s| s == &txn.status) {
            return false;
        }
        if let Some(min) = self.min_amount {
            if txn.amount < min {
                return false;
            }
        }
        if let Some(max) = self.max_amount {
            if txn.amount > max {
                return false;
            }
        }
        if !self.display_names.is_empty() {
            let named = self.display_names.iter().any(|name| {
                name == &txn.display_name || Some(name) == txn.pending_display_name.as_ref()
            });
            if !named {
                return false;
            }
        }
        true
    }
}
