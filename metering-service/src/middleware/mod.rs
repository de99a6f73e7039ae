pub mod account;
pub mod metrics;

pub use account::{verify_worker_key, AccountContext, WORKER_KEY_HEADER};
pub use metrics::http_metrics_middleware;
