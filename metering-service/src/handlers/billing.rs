//! Billing info and quota check handlers.
//!
//! Both endpoints are account-scoped reads. The quota check is advisory
//! admission control: the counter can move the instant after the
//! response is sent, and settlement is the authoritative write.

use axum::{extract::State, Json};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use service_core::error::AppError;

use crate::middleware::AccountContext;
use crate::models::UNLIMITED_UNITS;
use crate::services::metrics::record_quota_check;
use crate::startup::AppState;

/// Response for `GET /v1/billing`.
#[derive(Debug, Serialize)]
pub struct BillingInfoResponse {
    pub plan_name: String,
    pub tier: String,
    pub monthly_unit_limit: i64,
    pub units_used_this_period: i64,
    /// -1 when the plan is unlimited.
    pub units_remaining: i64,
    pub percent_used: f64,
    pub period_end: DateTime<Utc>,
    pub status: String,
    pub external_ref: Option<String>,
}

/// Current plan, consumption, and period for the calling account.
pub async fn get_billing_info(
    State(state): State<AppState>,
    ctx: AccountContext,
) -> Result<Json<BillingInfoResponse>, AppError> {
    let (subscription, plan) = state
        .db
        .get_subscription_with_plan(ctx.account_id)
        .await?
        .ok_or_else(|| {
            AppError::NoActiveSubscription(anyhow::anyhow!(
                "Account {} has no subscription",
                ctx.account_id
            ))
        })?;

    let (units_remaining, percent_used) = if plan.is_unlimited() {
        (UNLIMITED_UNITS, 0.0)
    } else {
        let used = subscription.units_used_this_period;
        let limit = plan.monthly_unit_limit;
        let percent = if limit > 0 {
            used as f64 / limit as f64 * 100.0
        } else {
            100.0
        };
        ((limit - used).max(0), percent)
    };

    Ok(Json(BillingInfoResponse {
        plan_name: plan.name,
        tier: plan.tier,
        monthly_unit_limit: plan.monthly_unit_limit,
        units_used_this_period: subscription.units_used_this_period,
        units_remaining,
        percent_used,
        period_end: subscription.period_end,
        status: subscription.status,
        external_ref: subscription.external_ref,
    }))
}

/// Request for `POST /v1/billing/check-limits`.
#[derive(Debug, Deserialize)]
pub struct CheckLimitsRequest {
    pub units_to_add: i64,
}

/// Response when the request is admitted. Denials are delivered as a
/// 402 with the same shape and `allowed = false`.
#[derive(Debug, Serialize)]
pub struct CheckLimitsResponse {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub tier: String,
    pub remaining: i64,
    pub percent_used: f64,
}

/// Pre-flight check before starting consumption-producing work.
pub async fn check_limits(
    State(state): State<AppState>,
    ctx: AccountContext,
    Json(payload): Json<CheckLimitsRequest>,
) -> Result<Json<CheckLimitsResponse>, AppError> {
    let decision = state
        .db
        .check_quota(ctx.account_id, payload.units_to_add)
        .await?;

    record_quota_check(&decision.tier, decision.allowed);

    if !decision.allowed {
        tracing::info!(
            account_id = %ctx.account_id,
            requested = payload.units_to_add,
            remaining = decision.remaining,
            "Quota check denied"
        );
        return Err(AppError::QuotaExceeded {
            tier: decision.tier,
            remaining: decision.remaining,
            percent_used: decision.percent_used,
            reason: decision
                .reason
                .unwrap_or_else(|| "Monthly lead limit reached".to_string()),
        });
    }

    Ok(Json(CheckLimitsResponse {
        allowed: true,
        reason: None,
        tier: decision.tier,
        remaining: decision.remaining,
        percent_used: decision.percent_used,
    }))
}
