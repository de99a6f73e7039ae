//! Account provisioning handler.
//!
//! Called by the account-creation flow. Inserting the free-tier
//! subscription is conflict-safe, so retries and duplicate calls are
//! no-ops rather than errors.

use axum::{extract::State, http::HeaderMap, http::StatusCode, Json};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use uuid::Uuid;

use crate::middleware::verify_worker_key;
use crate::startup::AppState;

#[derive(Debug, Deserialize)]
pub struct ProvisionRequest {
    pub account_id: Uuid,
}

#[derive(Debug, Serialize)]
pub struct ProvisionResponse {
    pub subscription_id: Uuid,
    pub account_id: Uuid,
    pub plan_id: Uuid,
    pub status: String,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub units_used_this_period: i64,
    pub created: bool,
}

/// Ensure the account has a subscription; 201 when newly provisioned,
/// 200 when it already existed.
pub async fn provision_account(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<ProvisionRequest>,
) -> Result<(StatusCode, Json<ProvisionResponse>), AppError> {
    verify_worker_key(&headers, &state.config.worker.api_key)?;

    let (subscription, created) = state.db.provision_account(payload.account_id).await?;

    let status = if created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };

    Ok((
        status,
        Json(ProvisionResponse {
            subscription_id: subscription.subscription_id,
            account_id: subscription.account_id,
            plan_id: subscription.plan_id,
            status: subscription.status,
            period_start: subscription.period_start,
            period_end: subscription.period_end,
            units_used_this_period: subscription.units_used_this_period,
            created,
        }),
    ))
}
