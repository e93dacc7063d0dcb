//! Read-only view of real bank activity.

use async_trait::async_trait;
use service_core::error::AppError;
use uuid::Uuid;

use crate::models::{BankTransaction, LedgerFilter, SortOrder};
use crate::services::repository::DataSource;

#[derive(Debug, Clone, Copy, Default)]
pub struct QueryOptions {
    pub sort: SortOrder,
    pub source: DataSource,
}

impl QueryOptions {
    pub fn from_source(source: DataSource) -> Self {
        Self {
            sort: SortOrder::default(),
            source,
        }
    }
}

#[async_trait]
pub trait Ledger: Send + Sync {
    async fn query(
        &self,
        bank_account_id: Uuid,
        filter: &LedgerFilter,
        options: QueryOptions,
    ) -> Result<Vec<BankTransaction>, AppError>;
}
