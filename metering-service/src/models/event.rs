//! Payment-processor callback events.
//!
//! The processor delivers events asynchronously, possibly duplicated and
//! out of order. Dispatch is a closed match over the known event types
//! with an explicit no-op arm for anything the processor adds later.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use sqlx::FromRow;

/// Known processor event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorEventType {
    SubscriptionUpdated,
    SubscriptionDeleted,
    InvoicePaid,
    InvoicePaymentFailed,
    Unknown,
}

impl ProcessorEventType {
    pub fn from_string(s: &str) -> Self {
        match s {
            "customer.subscription.updated" => ProcessorEventType::SubscriptionUpdated,
            "customer.subscription.deleted" => ProcessorEventType::SubscriptionDeleted,
            "invoice.paid" => ProcessorEventType::InvoicePaid,
            "invoice.payment_failed" => ProcessorEventType::InvoicePaymentFailed,
            _ => ProcessorEventType::Unknown,
        }
    }
}

/// Raw webhook envelope as delivered by the processor.
#[derive(Debug, Clone, Deserialize)]
pub struct ProcessorEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: ProcessorEventData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProcessorEventData {
    pub object: serde_json::Value,
}

impl ProcessorEvent {
    pub fn kind(&self) -> ProcessorEventType {
        ProcessorEventType::from_string(&self.event_type)
    }

    /// External reference the event is keyed on: the processor-side id
    /// of the subscription or invoice it describes. Events for the same
    /// reference must apply in the order received.
    pub fn reference(&self) -> Option<String> {
        self.data
            .object
            .get("id")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
    }
}

/// `customer.subscription.*` payload fields this service consumes.
#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionPayload {
    pub id: String,
    pub status: String,
    pub current_period_start: i64,
    pub current_period_end: i64,
}

impl SubscriptionPayload {
    /// States the processor considers in good standing.
    pub fn is_active_equivalent(&self) -> bool {
        matches!(self.status.as_str(), "active" | "trialing")
    }

    pub fn period_start_utc(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.current_period_start, 0)
    }

    pub fn period_end_utc(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.current_period_end, 0)
    }
}

/// `invoice.*` payload fields this service consumes.
#[derive(Debug, Clone, Deserialize)]
pub struct InvoicePayload {
    pub id: String,
    /// Processor reference of the owning subscription.
    pub subscription: Option<String>,
    #[serde(default)]
    pub amount_due: i64,
    pub period_start: Option<i64>,
    pub period_end: Option<i64>,
}

impl InvoicePayload {
    pub fn period_start_utc(&self) -> Option<DateTime<Utc>> {
        self.period_start.and_then(|s| DateTime::from_timestamp(s, 0))
    }

    pub fn period_end_utc(&self) -> Option<DateTime<Utc>> {
        self.period_end.and_then(|s| DateTime::from_timestamp(s, 0))
    }
}

/// Result of attempting to apply one stored event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
    /// Effects landed and the event was marked applied.
    Applied,
    /// An earlier unapplied event exists for the same reference; retry
    /// after it lands.
    Deferred,
    /// Another worker already applied (or is applying) the event.
    AlreadyApplied,
    /// The event references no local record; logged and marked applied.
    NoLocalRecord,
    /// Unhandled type or unusable payload; marked applied as a no-op.
    Ignored,
}

/// A durably ingested event awaiting (or finished with) application.
#[derive(Debug, Clone, FromRow)]
pub struct PendingEvent {
    pub seq: i64,
    pub event_id: String,
    pub event_type: String,
    pub reference: Option<String>,
    pub payload: serde_json::Value,
    pub received_utc: DateTime<Utc>,
    pub applied_utc: Option<DateTime<Utc>>,
    pub note: Option<String>,
}

impl PendingEvent {
    pub fn kind(&self) -> ProcessorEventType {
        ProcessorEventType::from_string(&self.event_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_types_dispatch() {
        assert_eq!(
            ProcessorEventType::from_string("customer.subscription.updated"),
            ProcessorEventType::SubscriptionUpdated
        );
        assert_eq!(
            ProcessorEventType::from_string("customer.subscription.deleted"),
            ProcessorEventType::SubscriptionDeleted
        );
        assert_eq!(
            ProcessorEventType::from_string("invoice.paid"),
            ProcessorEventType::InvoicePaid
        );
        assert_eq!(
            ProcessorEventType::from_string("invoice.payment_failed"),
            ProcessorEventType::InvoicePaymentFailed
        );
    }

    #[test]
    fn unrecognized_types_are_unknown() {
        assert_eq!(
            ProcessorEventType::from_string("charge.refunded"),
            ProcessorEventType::Unknown
        );
        assert_eq!(ProcessorEventType::from_string(""), ProcessorEventType::Unknown);
    }

    #[test]
    fn envelope_parses_and_extracts_reference() {
        let raw = r#"{
            "id": "evt_001",
            "type": "customer.subscription.updated",
            "data": {
                "object": {
                    "id": "sub_123",
                    "status": "active",
                    "current_period_start": 1700000000,
                    "current_period_end": 1702592000
                }
            }
        }"#;

        let event: ProcessorEvent = serde_json::from_str(raw).unwrap();
        assert_eq!(event.id, "evt_001");
        assert_eq!(event.kind(), ProcessorEventType::SubscriptionUpdated);
        assert_eq!(event.reference().as_deref(), Some("sub_123"));

        let payload: SubscriptionPayload =
            serde_json::from_value(event.data.object.clone()).unwrap();
        assert!(payload.is_active_equivalent());
        assert!(payload.period_start_utc().unwrap() < payload.period_end_utc().unwrap());
    }

    #[test]
    fn invoice_payload_tolerates_missing_fields() {
        let payload: InvoicePayload = serde_json::from_str(
            r#"{"id": "in_9", "subscription": null}"#,
        )
        .unwrap();
        assert_eq!(payload.amount_due, 0);
        assert!(payload.subscription.is_none());
        assert!(payload.period_start_utc().is_none());
    }

    #[test]
    fn past_due_states_map_inactive() {
        let payload: SubscriptionPayload = serde_json::from_str(
            r#"{"id": "sub_1", "status": "past_due",
                "current_period_start": 1, "current_period_end": 2}"#,
        )
        .unwrap();
        assert!(!payload.is_active_equivalent());
    }
}
