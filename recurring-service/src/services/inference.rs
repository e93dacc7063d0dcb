//! Schedule inference collaborator: turns a list of observed dates into a
//! candidate schedule with a confidence.

use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use service_core::observability::TracedClientExt;
use std::time::Duration;
use tracing::{debug, instrument};

use crate::schedule::Schedule;

#[derive(Debug, Clone, PartialEq)]
pub struct InferredSchedule {
    pub schedule: Schedule,
    pub confidence: f64,
}

#[async_trait]
pub trait ScheduleInference: Send + Sync {
    /// `Ok(None)` when no schedule fits the dates.
    async fn infer(&self, dates: &[NaiveDate]) -> Result<Option<InferredSchedule>, AppError>;
}

#[derive(Debug, Serialize)]
struct InferRequest<'a> {
    dates: &'a [NaiveDate],
}

#[derive(Debug, Deserialize)]
struct InferResponse {
    interval: Option<String>,
    #[serde(default)]
    params: Vec<String>,
    roll_direction: Option<String>,
    dtstart: Option<NaiveDate>,
    #[serde(default)]
    confidence: f64,
}

/// HTTP client for the inference service.
pub struct HttpScheduleInference {
    client: Client,
    url: String,
}

impl HttpScheduleInference {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, AppError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::ConfigError(anyhow::anyhow!("Failed to build client: {}", e)))?;
        Ok(Self {
            client,
            url: format!("{}/v1/schedules/infer", base_url.trim_end_matches('/')),
        })
    }
}

#[async_trait]
impl ScheduleInference for HttpScheduleInference {
    #[instrument(skip(self, dates), fields(date_count = dates.len()))]
    async fn infer(&self, dates: &[NaiveDate]) -> Result<Option<InferredSchedule>, AppError> {
        let response = self
            .client
            .traced_post(&self.url)
            .json(&InferRequest { dates })
            .send()
            .await
            .map_err(|e| AppError::BadGateway(format!("Schedule inference unreachable: {}", e)))?;

        if !response.status().is_success() {
            return Err(AppError::BadGateway(format!(
                "Schedule inference returned {}",
                response.status()
            )));
        }

        let body: InferResponse = response
            .json()
            .await
            .map_err(|e| AppError::BadGateway(format!("Invalid inference response: {}", e)))?;

        let (Some(interval), Some(roll), Some(dtstart)) =
            (body.interval, body.roll_direction, body.dtstart)
        else {
            debug!("No schedule inferred");
            return Ok(None);
        };

        let schedule = Schedule::from_parts(&interval, &body.params, &roll, dtstart)?;
        Ok(Some(InferredSchedule {
            schedule,
            confidence: body.confidence,
        }))
    }
}
