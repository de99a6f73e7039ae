//! Service layer: storage, metrics, reconciliation, sweeping.

pub mod database;
pub mod metrics;
pub mod reconciler;
pub mod sweeper;

pub use database::Database;
pub use metrics::{get_metrics, init_metrics};
pub use reconciler::{DrainSummary, Reconciler};
pub use sweeper::{SweepSummary, Sweeper};
