//! Certified-mail carrier callbacks: HMAC-SHA256 signatures and status vocabulary.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;

use super::notice::DeliveryStatus;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "x-carrier-signature";

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SignatureError {
    #[error("carrier webhook secret is not configured")]
    SecretNotConfigured,
    #[error("signature header missing")]
    Missing,
    #[error("signature is not valid hex")]
    Malformed,
    #[error("signature does not match payload")]
    Mismatch,
}

fn mac(secret: &[u8]) -> Result<HmacSha256, SignatureError> {
    HmacSha256::new_from_slice(secret).map_err(|_| SignatureError::SecretNotConfigured)
}

/// Hex HMAC-SHA256 of `body`, as a carrier would send it.
pub fn sign(secret: &[u8], body: &[u8]) -> Result<String, SignatureError> {
    let mut mac = mac(secret)?;
    mac.update(body);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Constant-time check of the raw body against `<hex>` or `sha256=<hex>`.
pub fn verify_signature(
    secret: Option<&str>,
    body: &[u8],
    signature: Option<&str>,
) -> Result<(), SignatureError> {
    let secret = secret
        .filter(|secret| !secret.is_empty())
        .ok_or(SignatureError::SecretNotConfigured)?;
    let signature = signature
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or(SignatureError::Missing)?;
    let encoded = signature.strip_prefix("sha256=").unwrap_or(signature);
    let expected = hex::decode(encoded).map_err(|_| SignatureError::Malformed)?;

    let mut mac = mac(secret.as_bytes())?;
    mac.update(body);
    mac.verify_slice(&expected)
        .map_err(|_| SignatureError::Mismatch)
}

/// Tracking event posted by the carrier.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CarrierEvent {
    #[serde(default)]
    pub tracking_number: Option<String>,
    pub status: String,
    /// Our notice id, echoed back when the carrier supports metadata.
    #[serde(default)]
    pub reference: Option<String>,
    #[serde(default)]
    pub occurred_at: Option<DateTime<Utc>>,
}

/// Maps carrier vocabulary onto the notice lifecycle; unknown words return `None`.
pub fn map_carrier_status(status: &str) -> Option<DeliveryStatus> {
    let normalized = status.trim().to_ascii_lowercase().replace(['-', ' '], "_");
    match normalized.as_str() {
        "pre_transit" | "label_created" => Some(DeliveryStatus::Pending),
        "accepted" | "in_transit" | "out_for_delivery" => Some(DeliveryStatus::InTransit),
        "delivered" => Some(DeliveryStatus::Delivered),
        "returned" | "return_to_sender" => Some(DeliveryStatus::Returned),
        "failure" | "failed" | "undeliverable" => Some(DeliveryStatus::Failed),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "whsec_test";

    #[test]
    fn signature_round_trip_accepts_both_header_forms() {
        let body = br#"{"tracking_number":"9400","status":"delivered"}"#;
        let signature = sign(SECRET.as_bytes(), body).expect("sign");

        assert_eq!(verify_signature(Some(SECRET), body, Some(&signature)), Ok(()));
        let prefixed = format!("sha256={signature}");
        assert_eq!(verify_signature(Some(SECRET), body, Some(&prefixed)), Ok(()));
    }

    #[test]
    fn tampered_body_or_wrong_secret_is_rejected() {
        let body = br#"{"status":"delivered"}"#;
        let signature = sign(SECRET.as_bytes(), body).expect("sign");

        assert_eq!(
            verify_signature(Some(SECRET), br#"{"status":"returned"}"#, Some(&signature)),
            Err(SignatureError::Mismatch)
        );
        assert_eq!(
            verify_signature(Some("other"), body, Some(&signature)),
            Err(SignatureError::Mismatch)
        );
        assert_eq!(
            verify_signature(Some(SECRET), body, Some("zz")),
            Err(SignatureError::Malformed)
        );
        assert_eq!(verify_signature(Some(SECRET), body, None), Err(SignatureError::Missing));
        assert_eq!(
            verify_signature(None, body, Some(&signature)),
            Err(SignatureError::SecretNotConfigured)
        );
    }

    #[test]
    fn carrier_vocabulary_maps_to_lifecycle() {
        assert_eq!(map_carrier_status("Out for Delivery"), Some(DeliveryStatus::InTransit));
        assert_eq!(map_carrier_status("return-to-sender"), Some(DeliveryStatus::Returned));
        assert_eq!(map_carrier_status("undeliverable"), Some(DeliveryStatus::Failed));
        assert_eq!(map_carrier_status("delivered"), Some(DeliveryStatus::Delivered));
        assert_eq!(map_carrier_status("held_at_facility"), None);
    }
}
