//! Usage settlement handler.
//!
//! Privileged: only the job workers report settled usage, after a
//! scrape/import completes with its real lead count.

use axum::{extract::State, http::HeaderMap, http::StatusCode, Json};
use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use uuid::Uuid;
use validator::Validate;

use crate::middleware::verify_worker_key;
use crate::models::{SettleUsage, UsageSource};
use crate::services::metrics::record_usage_settled;
use crate::startup::AppState;

/// Request for `POST /v1/usage`.
#[derive(Debug, Deserialize, Validate)]
pub struct LogUsageRequest {
    pub account_id: Uuid,
    #[validate(length(min = 1, max = 128))]
    pub campaign_id: String,
    pub unit_count: i64,
    pub source_action: String,
    pub related_job_id: Option<Uuid>,
    #[validate(length(max = 2000))]
    pub note: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct LogUsageResponse {
    pub usage_event_id: Uuid,
}

/// Settle actual usage for an account. The atomic ledger increment and
/// the usage-event append happen in one transaction; this endpoint is
/// never blocked by quota because the work already happened.
pub async fn log_usage(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<LogUsageRequest>,
) -> Result<(StatusCode, Json<LogUsageResponse>), AppError> {
    verify_worker_key(&headers, &state.config.worker.api_key)?;
    payload.validate()?;

    let source = UsageSource::from_string(&payload.source_action);
    let input = SettleUsage {
        account_id: payload.account_id,
        campaign_id: payload.campaign_id,
        unit_count: payload.unit_count,
        source,
        related_job_id: payload.related_job_id,
        note: payload.note,
    };

    let event = state.db.settle_usage(&input).await?;
    record_usage_settled(source.as_str(), event.unit_count);

    Ok((
        StatusCode::CREATED,
        Json(LogUsageResponse {
            usage_event_id: event.event_id,
        }),
    ))
}
