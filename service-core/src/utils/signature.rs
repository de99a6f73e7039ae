use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the payment processor's webhook signature.
pub const SIGNATURE_HEADER: &str = "processor-signature";

/// Parsed contents of a `t=<unix>,v1=<hex>` signature header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookSignature {
    pub timestamp: i64,
    pub signature: String,
}

/// Parse a signature header of the form `t=1678886400,v1=deadbeef...`.
///
/// Unknown key/value pairs are ignored so the processor can add scheme
/// versions without breaking us.
pub fn parse_signature_header(header: &str) -> Result<WebhookSignature, anyhow::Error> {
    let mut timestamp: Option<i64> = None;
    let mut signature: Option<String> = None;

    for part in header.split(',') {
        let kv: Vec<&str> = part.splitn(2, '=').collect();
        if kv.len() == 2 {
            match kv[0].trim() {
                "t" => timestamp = kv[1].trim().parse().ok(),
                "v1" => signature = Some(kv[1].trim().to_string()),
                _ => {}
            }
        }
    }

    let timestamp =
        timestamp.ok_or_else(|| anyhow::anyhow!("Missing timestamp in signature header"))?;
    let signature =
        signature.ok_or_else(|| anyhow::anyhow!("Missing v1 signature in signature header"))?;

    Ok(WebhookSignature {
        timestamp,
        signature,
    })
}

/// Compute the hex HMAC-SHA256 signature over `{timestamp}.{body}`.
pub fn compute_signature(secret: &str, timestamp: i64, body: &str) -> Result<String, anyhow::Error> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| anyhow::anyhow!("Invalid key length: {}", e))?;

    mac.update(format!("{}.", timestamp).as_bytes());
    mac.update(body.as_bytes());
    let result = mac.finalize();

    Ok(hex::encode(result.into_bytes()))
}

/// Build a signature header for an outgoing payload. Used by tests and
/// local tooling that replays processor events.
pub fn generate_signature_header(
    secret: &str,
    timestamp: i64,
    body: &str,
) -> Result<String, anyhow::Error> {
    let signature = compute_signature(secret, timestamp, body)?;
    Ok(format!("t={},v1={}", timestamp, signature))
}

/// Verify a webhook signature header against the raw request body.
///
/// Returns `Ok(false)` for a stale timestamp or mismatched signature;
/// `Err` only for malformed input. Comparison is constant-time.
pub fn verify_webhook_signature(
    secret: &str,
    body: &str,
    header: &str,
    now: i64,
    tolerance_secs: i64,
) -> Result<bool, anyhow::Error> {
    let parsed = parse_signature_header(header)?;

    if (now - parsed.timestamp).abs() > tolerance_secs {
        return Ok(false);
    }

    let expected = compute_signature(secret, parsed.timestamp, body)?;

    let expected_bytes = expected.as_bytes();
    let signature_bytes = parsed.signature.as_bytes();

    if expected_bytes.len() != signature_bytes.len() {
        return Ok(false);
    }

    Ok(expected_bytes.ct_eq(signature_bytes).into())
}

/// Constant-time equality for shared secrets (internal API keys).
pub fn secrets_match(provided: &str, expected: &str) -> bool {
    let provided = provided.as_bytes();
    let expected = expected.as_bytes();

    if provided.len() != expected.len() {
        return false;
    }

    provided.ct_eq(expected).into()
}
