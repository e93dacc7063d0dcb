//! Outbound user notifications. Delivery is fire-and-forget: failures are
//! logged and counted, never returned to the matching flow.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Serialize;
use service_core::error::AppError;
use service_core::observability::TracedClientExt;
use std::time::Duration;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::models::RecurringStatus;
use crate::services::metrics::record_error;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Notification {
    ExpensesPredicted {
        user_id: Uuid,
        bank_account_id: Uuid,
    },
    IncomeAdded {
        user_id: Uuid,
        bank_account_id: Uuid,
        recurring_transaction_id: Uuid,
    },
    IncomeStatusChanged {
        user_id: Uuid,
        recurring_transaction_id: Uuid,
        status: RecurringStatus,
        missed: Option<DateTime<Utc>>,
    },
    TransactionMissed {
        user_id: Uuid,
        recurring_transaction_id: Uuid,
        expected_date: NaiveDate,
        expected_amount: Decimal,
    },
    MissedPaycheckAlert {
        user_id: Uuid,
        bank_account_id: Uuid,
        recurring_transaction_id: Uuid,
        missed: DateTime<Utc>,
    },
}

impl Notification {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ExpensesPredicted { .. } => "expenses_predicted",
            Self::IncomeAdded { .. } => "income_added",
            Self::IncomeStatusChanged { .. } => "income_status_changed",
            Self::TransactionMissed { .. } => "transaction_missed",
            Self::MissedPaycheckAlert { .. } => "missed_paycheck_alert",
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, notification: &Notification) -> Result<(), AppError>;
}

/// Send and swallow any failure after logging it.
pub async fn notify(notifier: &dyn Notifier, notification: Notification) {
    if let Err(e) = notifier.send(&notification).await {
        warn!(
            event = notification.name(),
            error = %e,
            "Notification delivery failed"
        );
        record_error("notification");
    }
}

pub struct HttpNotifier {
    client: Client,
    url: String,
}

impl HttpNotifier {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, AppError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::ConfigError(anyhow::anyhow!("Failed to build client: {}", e)))?;
        Ok(Self {
            client,
            url: format!("{}/v1/events", base_url.trim_end_matches('/')),
        })
    }
}

#[async_trait]
impl Notifier for HttpNotifier {
    #[instrument(skip(self, notification), fields(event = notification.name()))]
    async fn send(&self, notification: &Notification) -> Result<(), AppError> {
        let response = self
            .client
            .traced_post(&self.url)
            .json(notification)
            .send()
            .await
            .map_err(|e| AppError::BadGateway(format!("Notification service unreachable: {}", e)))?;

        if !response.status().is_success() {
            return Err(AppError::BadGateway(format!(
                "Notification service returned {}",
                response.status()
            )));
        }

        debug!("Notification delivered");
        Ok(())
    }
}
