//! Verification of provider-signed webhook payloads.
//!
//! The provider sends a header of the form `t=<unix seconds>,v1=<hex hmac>`
//! where the HMAC-SHA256 is computed over `"<t>.<raw body>"` with the shared
//! webhook secret. Several `v1` entries may be present during secret rotation.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

pub const DEFAULT_TOLERANCE_SECS: i64 = 300;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignatureError {
    #[error("signature header is malformed")]
    Malformed,
    #[error("signature timestamp outside tolerance")]
    StaleTimestamp,
    #[error("no signature matches the payload")]
    Mismatch,
}

fn mac_for(secret: &str, timestamp: i64, payload: &[u8]) -> Result<HmacSha256, SignatureError> {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| SignatureError::Malformed)?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    Ok(mac)
}

pub fn verify_signature(
    payload: &[u8],
    header: &str,
    secret: &str,
    tolerance_secs: i64,
    now: i64,
) -> Result<(), SignatureError> {
    let mut timestamp = None;
    let mut signatures = Vec::new();

    for part in header.split(',') {
        let Some((key, value)) = part.trim().split_once('=') else {
            return Err(SignatureError::Malformed);
        };
        match key {
            "t" => timestamp = Some(value.parse::<i64>().map_err(|_| SignatureError::Malformed)?),
            "v1" => signatures.push(value),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or(SignatureError::Malformed)?;
    if signatures.is_empty() {
        return Err(SignatureError::Malformed);
    }
    if (now - timestamp).abs() > tolerance_secs {
        return Err(SignatureError::StaleTimestamp);
    }

    let mac = mac_for(secret, timestamp, payload)?;
    let matched = signatures.iter().any(|candidate| {
        hex::decode(candidate)
            .map(|bytes| mac.clone().verify_slice(&bytes).is_ok())
            .unwrap_or(false)
    });

    if matched {
        Ok(())
    } else {
        Err(SignatureError::Mismatch)
    }
}

/// Produce a header value for `payload`, as the provider would.
pub fn sign_payload(payload: &[u8], secret: &str, timestamp: i64) -> String {
    let signature = match mac_for(secret, timestamp, payload) {
        Ok(mac) => hex::encode(mac.finalize().into_bytes()),
        Err(_) => String::new(),
    };
    format!("t={},v1={}", timestamp, signature)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "whsec_test";
    const BODY: &[u8] = br#"{"id":"evt_1","type":"checkout.session.completed"}"#;

    #[test]
    fn test_valid_signature_accepted() {
        let header = sign_payload(BODY, SECRET, 1_700_000_000);
        assert_eq!(
            verify_signature(BODY, &header, SECRET, DEFAULT_TOLERANCE_SECS, 1_700_000_100),
            Ok(())
        );
    }

    #[test]
    fn test_tampered_payload_rejected() {
        let header = sign_payload(BODY, SECRET, 1_700_000_000);
        let tampered = br#"{"id":"evt_2","type":"checkout.session.completed"}"#;
        assert_eq!(
            verify_signature(tampered, &header, SECRET, DEFAULT_TOLERANCE_SECS, 1_700_000_000),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let header = sign_payload(BODY, "whsec_other", 1_700_000_000);
        assert_eq!(
            verify_signature(BODY, &header, SECRET, DEFAULT_TOLERANCE_SECS, 1_700_000_000),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn test_stale_timestamp_rejected() {
        let header = sign_payload(BODY, SECRET, 1_700_000_000);
        assert_eq!(
            verify_signature(BODY, &header, SECRET, DEFAULT_TOLERANCE_SECS, 1_700_001_000),
            Err(SignatureError::StaleTimestamp)
        );
    }

    #[test]
    fn test_rotated_secret_second_signature_matches() {
        let good = sign_payload(BODY, SECRET, 1_700_000_000);
        let good_sig = good.split("v1=").nth(1).unwrap();
        let header = format!("t=1700000000,v1=deadbeef,v1={}", good_sig);
        assert!(verify_signature(BODY, &header, SECRET, DEFAULT_TOLERANCE_SECS, 1_700_000_000).is_ok());
    }

    #[test]
    fn test_malformed_header_rejected() {
        assert_eq!(
            verify_signature(BODY, "garbage", SECRET, DEFAULT_TOLERANCE_SECS, 0),
            Err(SignatureError::Malformed)
        );
        assert_eq!(
            verify_signature(BODY, "t=1700000000", SECRET, DEFAULT_TOLERANCE_SECS, 1_700_000_000),
            Err(SignatureError::Malformed)
        );
    }
}
