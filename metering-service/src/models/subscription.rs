//! Subscription ledger model and quota evaluation.

use crate::models::plan::PlanDefinition;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Subscription status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Trial,
    Active,
    PastDue,
    Canceled,
    Unpaid,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Trial => "trial",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Canceled => "canceled",
            SubscriptionStatus::Unpaid => "unpaid",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "trial" => SubscriptionStatus::Trial,
            "past_due" => SubscriptionStatus::PastDue,
            "canceled" => SubscriptionStatus::Canceled,
            "unpaid" => SubscriptionStatus::Unpaid,
            _ => SubscriptionStatus::Active,
        }
    }

    /// Terminal states are never rolled over by the sweeper and never
    /// admit new work.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SubscriptionStatus::Canceled | SubscriptionStatus::Unpaid
        )
    }
}

/// One ledger row per account. The single synchronization point for the
/// admission controller, the event reconciler, and the period sweeper.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Subscription {
    pub subscription_id: Uuid,
    pub account_id: Uuid,
    pub plan_id: Uuid,
    /// Payment-processor subscription reference, once the account is
    /// linked to a paid plan.
    pub external_ref: Option<String>,
    pub status: String,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub units_used_this_period: i64,
    pub auto_renew: bool,
    pub canceled_at: Option<DateTime<Utc>>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl Subscription {
    pub fn status(&self) -> SubscriptionStatus {
        SubscriptionStatus::from_string(&self.status)
    }
}

/// Outcome of a pre-flight quota check. Advisory: the counter may move
/// the instant after this is computed, so callers must treat it as
/// admission control, not a reservation.
#[derive(Debug, Clone, Serialize)]
pub struct QuotaDecision {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub tier: String,
    pub limit: i64,
    /// Units left in the period; -1 for unlimited plans.
    pub remaining: i64,
    /// Unclamped: settlement overshoot can push this past 100.
    pub percent_used: f64,
}

impl QuotaDecision {
    pub fn evaluate(
        subscription: &Subscription,
        plan: &PlanDefinition,
        requested_units: i64,
    ) -> Self {
        let tier = plan.tier.clone();
        let status = subscription.status();

        if status.is_terminal() {
            return Self {
                allowed: false,
                reason: Some(format!("Subscription is {}", status.as_str())),
                tier,
                limit: plan.monthly_unit_limit,
                remaining: 0,
                percent_used: 0.0,
            };
        }

        if plan.is_unlimited() {
            return Self {
                allowed: true,
                reason: None,
                tier,
                limit: plan.monthly_unit_limit,
                remaining: crate::models::UNLIMITED_UNITS,
                percent_used: 0.0,
            };
        }

        let used = subscription.units_used_this_period;
        let limit = plan.monthly_unit_limit;
        let remaining = (limit - used).max(0);
        let percent_used = if limit > 0 {
            used as f64 / limit as f64 * 100.0
        } else {
            100.0
        };

        let allowed = used + requested_units <= limit;
        let reason = (!allowed).then(|| {
            format!(
                "Monthly lead limit reached: {} of {} used, {} remaining",
                used, limit, remaining
            )
        });

        Self {
            allowed,
            reason,
            tier,
            limit,
            remaining,
            percent_used,
        }
    }
}
