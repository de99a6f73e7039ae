//! Caller context for account-scoped endpoints.
//!
//! The `X-Account-ID` header is set by the frontend gateway after it has
//! authenticated the user; authentication itself lives outside this
//! service. Privileged internal callers (the job workers) authenticate
//! with a shared API key instead.

use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::HeaderMap;
use secrecy::ExposeSecret;
use service_core::error::AppError;
use service_core::utils::signature::secrets_match;
use uuid::Uuid;

pub const ACCOUNT_ID_HEADER: &str = "x-account-id";
pub const WORKER_KEY_HEADER: &str = "x-worker-api-key";

/// Account context extracted from request headers.
#[derive(Debug, Clone, Copy)]
pub struct AccountContext {
    pub account_id: Uuid,
}

#[async_trait]
impl<S> FromRequestParts<S> for AccountContext
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let raw = parts
            .headers
            .get(ACCOUNT_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| {
                AppError::Unauthorized(anyhow::anyhow!(
                    "Missing {} header (required from gateway)",
                    ACCOUNT_ID_HEADER
                ))
            })?;

        let account_id = Uuid::parse_str(raw).map_err(|_| {
            AppError::Unauthorized(anyhow::anyhow!("Malformed {} header", ACCOUNT_ID_HEADER))
        })?;

        tracing::Span::current().record("account_id", raw);

        Ok(AccountContext { account_id })
    }
}

/// Check the internal worker API key on a privileged endpoint.
///
/// Comparison is constant-time so the key cannot be probed byte by byte.
pub fn verify_worker_key(
    headers: &HeaderMap,
    expected: &secrecy::Secret<String>,
) -> Result<(), AppError> {
    let provided = headers
        .get(WORKER_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            AppError::Unauthorized(anyhow::anyhow!(
                "Missing {} header on privileged endpoint",
                WORKER_KEY_HEADER
            ))
        })?;

    if !secrets_match(provided, expected.expose_secret()) {
        return Err(AppError::Unauthorized(anyhow::anyhow!(
            "Invalid worker API key"
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::Secret;

    fn headers_with_key(key: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(WORKER_KEY_HEADER, key.parse().unwrap());
        headers
    }

    #[test]
    fn accepts_matching_key() {
        let expected = Secret::new("worker-secret".to_string());
        assert!(verify_worker_key(&headers_with_key("worker-secret"), &expected).is_ok());
    }

    #[test]
    fn rejects_wrong_key() {
        let expected = Secret::new("worker-secret".to_string());
        assert!(verify_worker_key(&headers_with_key("guess"), &expected).is_err());
    }

    #[test]
    fn rejects_missing_key() {
        let expected = Secret::new("worker-secret".to_string());
        assert!(verify_worker_key(&HeaderMap::new(), &expected).is_err());
    }
}
