//! Schedule drift: detect persistent offsets between predicted and observed
//! dates and swap the schedule when inference is confident.

use chrono::{Duration, NaiveDate};
use service_core::error::AppError;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::config::MatchingConfig;
use crate::models::{ExpectedTransaction, RecurringTransaction, RecurringUpdate};
use crate::services::audit::{AuditLog, AuditRecord};
use crate::services::inference::ScheduleInference;
use crate::services::metrics::{record_drift, record_error};
use crate::services::repository::{DataSource, Repository};

pub const DETACH_NOTE: &str = "schedule changed";

#[derive(Debug, Clone, PartialEq)]
pub enum DriftOutcome {
    /// Too few observations to infer from.
    Insufficient,
    NoSchedule,
    Unchanged,
    LowConfidence { confidence: f64 },
    Corrected { detached: u64 },
    /// Inference or a write failed; the schedule was left as it was.
    Failed,
}

impl DriftOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Insufficient => "insufficient",
            Self::NoSchedule => "no_schedule",
            Self::Unchanged => "unchanged",
            Self::LowConfidence { .. } => "low_confidence",
            Self::Corrected { .. } => "corrected",
            Self::Failed => "failed",
        }
    }

    pub fn is_corrected(&self) -> bool {
        matches!(self, Self::Corrected { .. })
    }
}

/// Any match that landed on a date other than the one predicted.
pub fn has_drift(matched: &[ExpectedTransaction]) -> bool {
    matched
        .iter()
        .any(|e| e.observed_date().is_some_and(|d| d != e.expected_date))
}

pub struct DriftCorrector {
    repo: Arc<dyn Repository>,
    inference: Arc<dyn ScheduleInference>,
    audit: Arc<dyn AuditLog>,
    window_days: i64,
    look_forward_days: i64,
    confidence_threshold: f64,
}

impl DriftCorrector {
    pub fn new(
        repo: Arc<dyn Repository>,
        inference: Arc<dyn ScheduleInference>,
        audit: Arc<dyn AuditLog>,
        config: &MatchingConfig,
    ) -> Self {
        Self {
            repo,
            inference,
            audit,
            window_days: config.drift_window_days,
            look_forward_days: config.look_forward_days,
            confidence_threshold: config.drift_confidence_threshold,
        }
    }

    /// Re-infer the schedule from the observed dates of recent matches. When
    /// it differs and inference is confident, unsettled expectations after the
    /// latest match are detached and the new schedule is written together with
    /// `pending` in a single update.
    ///
    /// Never fails: any error before the schedule write yields `Failed`, and
    /// the caller still owes `pending`. Rows detached ahead of a failed write
    /// are restored by the next generation pass.
    ///
    /// The identity comparison is not isolated from concurrent writers; a lost
    /// race corrects itself on the next run.
    #[instrument(skip(self, recurring, pending), fields(recurring_transaction_id = %recurring.id))]
    pub async fn correct(
        &self,
        recurring: &RecurringTransaction,
        pending: &RecurringUpdate,
        today: NaiveDate,
    ) -> DriftOutcome {
        let outcome = match self.evaluate(recurring, pending, today).await {
            Ok(outcome) => outcome,
            Err(e) => {
                record_error(e.kind());
                warn!(error = %e, "Drift correction failed, keeping current schedule");
                DriftOutcome::Failed
            }
        };
        record_drift(outcome.label());
        outcome
    }

    async fn evaluate(
        &self,
        recurring: &RecurringTransaction,
        pending: &RecurringUpdate,
        today: NaiveDate,
    ) -> Result<DriftOutcome, AppError> {
        let start = today - Duration::days(self.window_days);
        let end = today + Duration::days(self.look_forward_days);
        let history = self
            .repo
            .expected_in_range(recurring.id, start, end, DataSource::Primary)
            .await?;

        let matched: Vec<&ExpectedTransaction> = history.iter().filter(|e| e.is_linked()).collect();
        let mut dates: Vec<NaiveDate> = matched.iter().filter_map(|e| e.observed_date()).collect();
        dates.sort();
        dates.dedup();

        if dates.len() < 2 {
            return Ok(DriftOutcome::Insufficient);
        }

        let Some(inferred) = self.inference.infer(&dates).await? else {
            return Ok(DriftOutcome::NoSchedule);
        };

        if inferred.schedule == recurring.schedule {
            debug!(schedule = %recurring.schedule, "Inferred schedule unchanged");
            return Ok(DriftOutcome::Unchanged);
        }

        if inferred.confidence < self.confidence_threshold {
            debug!(
                confidence = inferred.confidence,
                candidate = %inferred.schedule,
                "Inferred schedule below confidence threshold"
            );
            return Ok(DriftOutcome::LowConfidence {
                confidence: inferred.confidence,
            });
        }

        let last_matched = matched
            .iter()
            .map(|e| e.expected_date)
            .max()
            .unwrap_or(today);

        let detached = self
            .repo
            .detach_expected(recurring.id, last_matched, DETACH_NOTE)
            .await?;

        let mut update = pending.clone();
        update.schedule = Some(inferred.schedule.clone());
        self.repo.update_recurring(recurring.id, &update).await?;

        // The schedule is already swapped; a lost audit entry must not undo that.
        if let Err(e) = self
            .audit
            .append(
                recurring.user_id,
                &AuditRecord::ScheduleChanged {
                    recurring_transaction_id: recurring.id,
                    old_schedule: recurring.schedule.to_string(),
                    new_schedule: inferred.schedule.to_string(),
                    confidence: inferred.confidence,
                    detached,
                },
            )
            .await
        {
            record_error(e.kind());
            warn!(error = %e, "Failed to audit schedule change");
        }

        info!(
            old_schedule = %recurring.schedule,
            new_schedule = %inferred.schedule,
            confidence = inferred.confidence,
            detached,
            "Schedule drift corrected"
        );

        Ok(DriftOutcome::Corrected { detached })
    }
}
