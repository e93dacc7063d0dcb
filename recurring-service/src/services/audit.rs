//! Append-only audit trail of schedule changes and account-transition copies.

use async_trait::async_trait;
use serde::Serialize;
use service_core::error::AppError;
use uuid::Uuid;

use crate::models::RecurringTransaction;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum AuditRecord {
    ScheduleChanged {
        recurring_transaction_id: Uuid,
        old_schedule: String,
        new_schedule: String,
        confidence: f64,
        detached: u64,
    },
    AccountTransition {
        old_recurring_transaction_id: Uuid,
        new_recurring_transaction_id: Uuid,
        old_bank_account_id: Uuid,
        new_bank_account_id: Uuid,
        matched: usize,
    },
}

impl AuditRecord {
    pub fn account_transition(
        original: &RecurringTransaction,
        moved: &RecurringTransaction,
        matched: usize,
    ) -> Self {
        Self::AccountTransition {
            old_recurring_transaction_id: original.id,
            new_recurring_transaction_id: moved.id,
            old_bank_account_id: original.bank_account_id,
            new_bank_account_id: moved.bank_account_id,
            matched,
        }
    }

    pub fn action(&self) -> &'static str {
        match self {
            Self::ScheduleChanged { .. } => "schedule_changed",
            Self::AccountTransition { .. } => "account_transition",
        }
    }

    pub fn subject_id(&self) -> Uuid {
        match self {
            Self::ScheduleChanged {
                recurring_transaction_id,
                ..
            } => *recurring_transaction_id,
            Self::AccountTransition {
                new_recurring_transaction_id,
                ..
            } => *new_recurring_transaction_id,
        }
    }
}

#[async_trait]
pub trait AuditLog: Send + Sync {
    async fn append(&self, user_id: Uuid, record: &AuditRecord) -> Result<(), AppError>;
}
