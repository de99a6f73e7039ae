//! Plan catalog model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Sentinel for plans without a monthly unit cap.
pub const UNLIMITED_UNITS: i64 = -1;

/// Subscription plan tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanTier {
    Free,
    Pro,
    Enterprise,
}

impl PlanTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanTier::Free => "free",
            PlanTier::Pro => "pro",
            PlanTier::Enterprise => "enterprise",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "pro" => PlanTier::Pro,
            "enterprise" => PlanTier::Enterprise,
            _ => PlanTier::Free,
        }
    }
}

/// Plan definition. Reference data: seeded by migration, read-only to
/// every request path in this service.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PlanDefinition {
    pub plan_id: Uuid,
    pub tier: String,
    pub name: String,
    /// Leads per billing period; `UNLIMITED_UNITS` means no cap.
    pub monthly_unit_limit: i64,
    pub monthly_price_minor: i64,
    pub overage_unit_price_minor: i64,
    pub is_active: bool,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl PlanDefinition {
    pub fn is_unlimited(&self) -> bool {
        self.monthly_unit_limit == UNLIMITED_UNITS
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_round_trips() {
        for tier in [PlanTier::Free, PlanTier::Pro, PlanTier::Enterprise] {
            assert_eq!(PlanTier::from_string(tier.as_str()), tier);
        }
        assert_eq!(PlanTier::from_string("not-a-tier"), PlanTier::Free);
    }
}
