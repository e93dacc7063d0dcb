//! Lazy generation of expected transactions from a schedule.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use service_core::error::AppError;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, instrument};

use crate::models::{ExpectedTransaction, NewExpectedTransaction, RecurringTransaction};
use crate::services::metrics::record_generated;
use crate::services::repository::{DataSource, Repository};

/// Unsaved expectations for every occurrence in `[start, end]`.
pub fn expected_in_range(
    recurring: &RecurringTransaction,
    start: NaiveDate,
    end: NaiveDate,
) -> Vec<NewExpectedTransaction> {
    recurring
        .schedule
        .between(start, end, true)
        .into_iter()
        .map(|date| NewExpectedTransaction::for_date(recurring, date))
        .collect()
}

pub struct Generator {
    repo: Arc<dyn Repository>,
}

impl Generator {
    pub fn new(repo: Arc<dyn Repository>) -> Self {
        Self { repo }
    }

    /// Fill the gap after the newest existing expectation (or from the most
    /// recent occurrence on or before `today` when there are none) up to
    /// `end`, then return every live expectation in `[start, end]`.
    ///
    /// Earlier history is never regenerated and nothing past `end` is created.
    #[instrument(skip(self, recurring), fields(recurring_transaction_id = %recurring.id))]
    pub async fn ensure_generated(
        &self,
        recurring: &RecurringTransaction,
        start: NaiveDate,
        end: NaiveDate,
        today: NaiveDate,
        source: DataSource,
    ) -> Result<Vec<ExpectedTransaction>, AppError> {
        let latest = self.repo.latest_expected(recurring.id, source).await?;

        let gap_start = match &latest {
            Some(latest) => latest.expected_date + Duration::days(1),
            None => recurring.schedule.before(today, true),
        }
        .max(start);

        let mut inserted = Vec::new();
        if gap_start <= end {
            let missing = expected_in_range(recurring, gap_start, end);
            if !missing.is_empty() {
                debug!(count = missing.len(), from = %gap_start, to = %end, "Generating expectations");
                inserted = self.repo.upsert_expected(&missing).await?;
                record_generated(inserted.len());
            }
        }

        let existing = self
            .repo
            .expected_in_range(recurring.id, start, end, source)
            .await?;

        // A replica read may not see rows upserted a moment ago on the primary.
        let mut by_date: BTreeMap<NaiveDate, ExpectedTransaction> = existing
            .into_iter()
            .map(|e| (e.expected_date, e))
            .collect();
        for row in inserted {
            if row.expected_date >= start && row.expected_date <= end {
                by_date.entry(row.expected_date).or_insert(row);
            }
        }

        Ok(by_date.into_values().collect())
    }

    /// The single next expectation strictly after `after`, created if absent.
    #[instrument(skip(self, recurring), fields(recurring_transaction_id = %recurring.id))]
    pub async fn next_expectation(
        &self,
        recurring: &RecurringTransaction,
        after: DateTime<Utc>,
    ) -> Result<ExpectedTransaction, AppError> {
        let date = recurring.schedule.after(after.date_naive());

        if let Some(existing) = self.repo.expected_on(recurring.id, date).await? {
            return Ok(existing);
        }

        let row = NewExpectedTransaction::for_date(recurring, date);
        let saved = self.repo.upsert_expected(std::slice::from_ref(&row)).await?;
        record_generated(saved.len());

        saved.into_iter().next().ok_or_else(|| {
            AppError::InternalError(anyhow::anyhow!(
                "Upsert returned no row for {} on {}",
                recurring.id,
                date
            ))
        })
    }
}
