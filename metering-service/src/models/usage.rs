//! Usage log model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// How a batch of leads was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageSource {
    Scrape,
    Import,
    Manual,
}

impl UsageSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            UsageSource::Scrape => "scrape",
            UsageSource::Import => "import",
            UsageSource::Manual => "manual",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "scrape" => UsageSource::Scrape,
            "import" => UsageSource::Import,
            _ => UsageSource::Manual,
        }
    }
}

/// One unit-consuming event. Append-only: the audit trail from which
/// the ledger counter can always be recomputed.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct UsageEvent {
    pub event_id: Uuid,
    pub account_id: Uuid,
    pub campaign_id: String,
    pub source_action: String,
    pub unit_count: i64,
    pub related_job_id: Option<Uuid>,
    pub note: Option<String>,
    pub created_utc: DateTime<Utc>,
}

/// Input for settling actual usage after work completes.
#[derive(Debug, Clone)]
pub struct SettleUsage {
    pub account_id: Uuid,
    pub campaign_id: String,
    pub unit_count: i64,
    pub source: UsageSource,
    pub related_job_id: Option<Uuid>,
    pub note: Option<String>,
}

/// A ledger counter that disagrees with the sum of its usage events.
#[derive(Debug, Clone, FromRow)]
pub struct CounterDrift {
    pub account_id: Uuid,
    pub stored_units: i64,
    pub derived_units: i64,
}
