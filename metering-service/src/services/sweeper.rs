//! Period sweeper.
//!
//! Background pass on a fixed cadence: rolls expired billing periods
//! forward, retries pending processor events, and checks ledger
//! counters against the usage log.

use crate::services::metrics::{record_counter_drift, record_rollovers};
use crate::services::{Database, Reconciler};
use service_core::error::AppError;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, instrument, warn};

/// Totals from one sweep pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct SweepSummary {
    pub rolled_over: u64,
    pub events_applied: u64,
    pub drift_rows: usize,
}

pub struct Sweeper {
    db: Arc<Database>,
    reconciler: Reconciler,
    interval: Duration,
}

impl Sweeper {
    pub fn new(db: Arc<Database>, reconciler: Reconciler, interval: Duration) -> Self {
        Self {
            db,
            reconciler,
            interval,
        }
    }

    /// One sweep pass. Idempotent: a row already rolled over no longer
    /// matches the sweep predicate, so overlapping passes are harmless.
    #[instrument(skip(self))]
    pub async fn run_once(&self) -> Result<SweepSummary, AppError> {
        let rolled_over = self.db.sweep_due_periods().await?;
        if rolled_over > 0 {
            info!(rolled_over = rolled_over, "Billing periods rolled over");
            record_rollovers(rolled_over);
        }

        let drained = self.reconciler.drain().await?;

        let drift = self.db.find_counter_drift().await?;
        for row in &drift {
            warn!(
                account_id = %row.account_id,
                stored = row.stored_units,
                derived = row.derived_units,
                "Usage counter disagrees with usage log"
            );
        }
        record_counter_drift(drift.len() as u64);

        Ok(SweepSummary {
            rolled_over,
            events_applied: drained.applied,
            drift_rows: drift.len(),
        })
    }

    /// Run sweep passes forever on the configured cadence.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                if let Err(e) = self.run_once().await {
                    error!(error = %e, "Sweep pass failed");
                }
            }
        })
    }
}
