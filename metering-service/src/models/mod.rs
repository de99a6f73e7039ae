//! Domain models for metering-service.

mod event;
mod invoice;
mod plan;
mod subscription;
mod usage;

pub use event::{
    EventOutcome, InvoicePayload, PendingEvent, ProcessorEvent, ProcessorEventType,
    SubscriptionPayload,
};
pub use invoice::{Invoice, InvoiceStatus};
pub use plan::{PlanDefinition, PlanTier, UNLIMITED_UNITS};
pub use subscription::{QuotaDecision, Subscription, SubscriptionStatus};
pub use usage::{CounterDrift, SettleUsage, UsageEvent, UsageSource};
