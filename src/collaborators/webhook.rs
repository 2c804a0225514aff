//! Webhook payload signing.
//!
//! The gateway signs its confirmation callbacks with HMAC-SHA-512 over the
//! canonical (key-sorted) JSON encoding of the payload. Verification is
//! constant-time through the MAC itself.

use std::collections::BTreeMap;

use hmac::{Hmac, Mac};
use sha2::Sha512;

use crate::errors::{CoreError, Result};

type HmacSha512 = Hmac<Sha512>;

/// JSON with object keys sorted at every depth, so both sides sign the
/// same bytes regardless of construction order.
pub fn canonical_json(value: &serde_json::Value) -> String {
    fn sort(value: &serde_json::Value) -> serde_json::Value {
        match value {
            serde_json::Value::Object(map) => {
                let sorted: BTreeMap<&String, serde_json::Value> =
                    map.iter().map(|(k, v)| (k, sort(v))).collect();
                serde_json::Value::Object(
                    sorted
                        .into_iter()
                        .map(|(k, v)| (k.clone(), v))
                        .collect(),
                )
            }
            serde_json::Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(sort).collect())
            }
            other => other.clone(),
        }
    }
    sort(value).to_string()
}

fn mac(secret: &[u8], payload: &serde_json::Value) -> Result<HmacSha512> {
    let mut mac = HmacSha512::new_from_slice(secret)
        .map_err(|e| CoreError::Validation(format!("webhook secret: {e}")))?;
    mac.update(canonical_json(payload).as_bytes());
    Ok(mac)
}

/// Hex HMAC-SHA-512 signature of the payload.
pub fn sign_payload(secret: &[u8], payload: &serde_json::Value) -> Result<String> {
    Ok(hex::encode(mac(secret, payload)?.finalize().into_bytes()))
}

/// Constant-time signature check. A malformed hex signature simply fails.
pub fn verify_webhook_signature(
    secret: &[u8],
    payload: &serde_json::Value,
    signature: &str,
) -> Result<bool> {
    let Ok(raw) = hex::decode(signature) else {
        return Ok(false);
    };
    Ok(mac(secret, payload)?.verify_slice(&raw).is_ok())
}
