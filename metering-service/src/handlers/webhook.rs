//! Payment-processor webhook handler.
//!
//! Verifies the request signature before trusting anything in the body,
//! durably stores the event, then acknowledges. Application happens via
//! the reconciler drain; a drain failure never fails the acknowledgment,
//! because the processor would otherwise redeliver an event we already
//! hold.

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
};
use chrono::Utc;
use secrecy::ExposeSecret;
use service_core::error::AppError;
use service_core::utils::signature::{verify_webhook_signature, SIGNATURE_HEADER};

use crate::models::ProcessorEvent;
use crate::startup::AppState;

pub async fn processor_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Result<StatusCode, AppError> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            tracing::warn!("Missing processor signature header");
            AppError::SignatureInvalid(anyhow::anyhow!("Missing webhook signature"))
        })?;

    let is_valid = verify_webhook_signature(
        state.config.webhook.signing_secret.expose_secret(),
        &body,
        signature,
        Utc::now().timestamp(),
        state.config.webhook.tolerance_secs,
    )
    .map_err(|e| {
        tracing::warn!(error = %e, "Malformed webhook signature header");
        AppError::SignatureInvalid(anyhow::anyhow!("Malformed webhook signature"))
    })?;

    if !is_valid {
        tracing::warn!("Invalid webhook signature");
        return Err(AppError::SignatureInvalid(anyhow::anyhow!(
            "Invalid webhook signature"
        )));
    }

    let event: ProcessorEvent = serde_json::from_str(&body).map_err(|e| {
        tracing::error!(error = %e, "Failed to parse webhook event");
        AppError::BadRequest(anyhow::anyhow!("Invalid webhook payload"))
    })?;

    tracing::info!(
        event_id = %event.id,
        event_type = %event.event_type,
        reference = ?event.reference(),
        "Processor webhook received"
    );

    // Durable first: once the event is stored, receipt is acknowledged
    // no matter what application does. Unknown types are stored and
    // acknowledged too.
    state.reconciler.ingest(&event).await?;

    if let Err(e) = state.reconciler.drain().await {
        tracing::error!(error = %e, "Event drain failed; sweeper will retry");
    }

    Ok(StatusCode::OK)
}
