//! Domain models for recurring-service.

pub mod bank_transaction;
pub mod expected;
pub mod recurring;

pub use bank_transaction::{BankTransaction, LedgerFilter, SortOrder, EXCLUDED_STATUSES};
pub use expected::{ExpectedMatch, ExpectedStatus, ExpectedTransaction, NewExpectedTransaction};
pub use recurring::{
    NewRecurringTransaction, RecurringStatus, RecurringTransaction, RecurringTransactionRow,
    RecurringUpdate, TransactionType,
};
