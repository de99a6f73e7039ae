//! Processor event reconciler.
//!
//! Ingestion and application are separate steps: the webhook handler
//! durably stores the event and acknowledges, then a drain pass applies
//! whatever is ready. The drain also runs on the sweeper cadence so
//! events that failed transiently are retried.

use crate::models::{EventOutcome, ProcessorEvent};
use crate::services::metrics::record_webhook_event;
use crate::services::Database;
use service_core::error::AppError;
use std::sync::Arc;
use tracing::{debug, error, instrument, warn};

const DRAIN_BATCH_SIZE: i64 = 100;

/// Totals from one drain pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct DrainSummary {
    pub applied: u64,
    pub deferred: u64,
    pub skipped: u64,
    pub errors: u64,
}

#[derive(Clone)]
pub struct Reconciler {
    db: Arc<Database>,
}

impl Reconciler {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Durably store a processor event. Re-delivery of a seen event id
    /// is a no-op; the returned bool reports whether the event is new.
    #[instrument(skip(self, event), fields(event_id = %event.id, event_type = %event.event_type))]
    pub async fn ingest(&self, event: &ProcessorEvent) -> Result<bool, AppError> {
        let inserted = self.db.ingest_processor_event(event).await?;

        if inserted {
            record_webhook_event(&event.event_type, "received");
        } else {
            debug!("Duplicate event delivery ignored");
            record_webhook_event(&event.event_type, "duplicate");
        }

        Ok(inserted)
    }

    /// Apply stored events in ingestion order until none are ready.
    ///
    /// Events for the same external reference apply strictly in order;
    /// an event blocked by an earlier pending one is left for the next
    /// pass. Application failures are logged and retried later rather
    /// than aborting the pass.
    #[instrument(skip(self))]
    pub async fn drain(&self) -> Result<DrainSummary, AppError> {
        let mut summary = DrainSummary::default();

        loop {
            let batch = self.db.list_unapplied_events(DRAIN_BATCH_SIZE).await?;
            if batch.is_empty() {
                break;
            }

            let mut progressed = false;

            for event in &batch {
                match self.db.apply_processor_event(event).await {
                    Ok(EventOutcome::Applied) => {
                        summary.applied += 1;
                        progressed = true;
                        record_webhook_event(&event.event_type, "applied");
                    }
                    Ok(EventOutcome::Deferred) => {
                        summary.deferred += 1;
                    }
                    Ok(EventOutcome::AlreadyApplied) => {}
                    Ok(EventOutcome::NoLocalRecord) => {
                        summary.skipped += 1;
                        progressed = true;
                        warn!(
                            event_id = %event.event_id,
                            reference = ?event.reference,
                            "Event references no local record; skipped"
                        );
                        record_webhook_event(&event.event_type, "unknown_reference");
                    }
                    Ok(EventOutcome::Ignored) => {
                        summary.skipped += 1;
                        progressed = true;
                        record_webhook_event(&event.event_type, "ignored");
                    }
                    Err(e) => {
                        summary.errors += 1;
                        error!(
                            event_id = %event.event_id,
                            error = %e,
                            "Failed to apply processor event; will retry"
                        );
                        record_webhook_event(&event.event_type, "error");
                    }
                }
            }

            if !progressed {
                // Everything left is deferred, locked elsewhere, or
                // erroring; a later pass picks it up.
                break;
            }
        }

        Ok(summary)
    }
}
