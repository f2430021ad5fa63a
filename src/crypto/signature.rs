//! Verification of the signature the dashboard UI attaches to every
//! backend call.
//!
//! The header has the form `t=<unix_seconds>,v1=<hex_hmac>` where `v1` is
//! HMAC-SHA256 over `<t>.<payload>` and the payload is the canonical JSON
//! object `{"user_id":"…","account_id":"…"}`: those two fields, in that
//! order, no whitespace. Several signing secrets may be configured at once so
//! a secret can be rotated without a deploy window.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the request signature.
pub const SIGNATURE_HEADER: &str = "Stripe-Signature";

/// Maximum allowed skew between the signed timestamp and now.
pub const DEFAULT_TOLERANCE_SECS: i64 = 300;

#[derive(Debug, Error)]
pub enum SignatureError {
    #[error("missing or malformed signature header")]
    MissingHeader,
    #[error("missing user or account identifier")]
    MissingIdentifiers,
    #[error("signature verification failed")]
    InvalidSignature,
    #[error("no signing secret configured")]
    Misconfigured,
}

/// Identity proven by a valid request signature. `account_id` is the only
/// tenant identifier the rest of the backend trusts.
#[derive(Debug, Clone)]
pub struct VerifiedCaller {
    pub user_id: String,
    pub account_id: String,
}

/// The exact byte sequence the dashboard signs for a given caller.
fn canonical_payload(user_id: &str, account_id: &str) -> String {
    format!(r#"{{"user_id":"{user_id}","account_id":"{account_id}"}}"#)
}

/// Parse `t=…,v1=…` into (timestamp, signature). Unknown keys are ignored.
fn parse_header(header: &str) -> Option<(i64, String)> {
    let mut timestamp = None;
    let mut signature = None;
    for part in header.split(',') {
        let mut kv = part.trim().splitn(2, '=');
        match (kv.next(), kv.next()) {
            (Some("t"), Some(value)) => timestamp = value.parse::<i64>().ok(),
            (Some("v1"), Some(value)) => signature = Some(value.to_string()),
            _ => {}
        }
    }
    Some((timestamp?, signature?))
}

fn signature_matches(secret: &str, signed_payload: &str, received_hex: &str) -> bool {
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(signed_payload.as_bytes());
    let expected = hex::encode(mac.finalize().into_bytes());
    expected.as_bytes().ct_eq(received_hex.as_bytes()).into()
}

/// Verify a signature header against the caller identifiers extracted from
/// the request. Tries every configured secret; a match under any of them is a
/// pass, and no hint is given of which one matched.
pub fn verify(
    header: Option<&str>,
    user_id: &str,
    account_id: &str,
    secrets: &[String],
    now: DateTime<Utc>,
    tolerance_secs: i64,
) -> Result<VerifiedCaller, SignatureError> {
    if secrets.is_empty() {
        return Err(SignatureError::Misconfigured);
    }
    let header = header.ok_or(SignatureError::MissingHeader)?;
    let (timestamp, received) = parse_header(header).ok_or(SignatureError::MissingHeader)?;

    if (now.timestamp() - timestamp).abs() > tolerance_secs {
        return Err(SignatureError::InvalidSignature);
    }

    let signed_payload = format!(
        "{timestamp}.{}",
        canonical_payload(user_id, account_id)
    );
    for secret in secrets {
        if signature_matches(secret, &signed_payload, &received) {
            return Ok(VerifiedCaller {
                user_id: user_id.to_string(),
                account_id: account_id.to_string(),
            });
        }
    }
    Err(SignatureError::InvalidSignature)
}

/// Sign a canonical payload; shared with the test suite so fixtures and
/// verifier cannot drift apart.
#[cfg(test)]
pub fn sign(secret: &str, user_id: &str, account_id: &str, timestamp: i64) -> String {
    let signed_payload = format!("{timestamp}.{}", canonical_payload(user_id, account_id));
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
    mac.update(signed_payload.as_bytes());
    format!("t={timestamp},v1={}", hex::encode(mac.finalize().into_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secrets(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn canonical_payload_field_order() {
        assert_eq!(
            canonical_payload("usr_1", "acct_1"),
            r#"{"user_id":"usr_1","account_id":"acct_1"}"#
        );
    }

    #[test]
    fn accepts_a_valid_signature() {
        let now = Utc::now();
        let header = sign("whsec_a", "usr_1", "acct_1", now.timestamp());
        let caller = verify(
            Some(&header),
            "usr_1",
            "acct_1",
            &secrets(&["whsec_a"]),
            now,
            DEFAULT_TOLERANCE_SECS,
        )
        .unwrap();
        assert_eq!(caller.user_id, "usr_1");
        assert_eq!(caller.account_id, "acct_1");
    }

    #[test]
    fn any_configured_secret_verifies() {
        let now = Utc::now();
        let header = sign("whsec_new", "usr_1", "acct_1", now.timestamp());

        // Old secret still listed first: rotation in progress.
        let rotating = secrets(&["whsec_old", "whsec_new"]);
        assert!(verify(Some(&header), "usr_1", "acct_1", &rotating, now, 300).is_ok());

        // Secret removed from the list: same payload now fails.
        let rotated_out = secrets(&["whsec_old"]);
        assert!(matches!(
            verify(Some(&header), "usr_1", "acct_1", &rotated_out, now, 300),
            Err(SignatureError::InvalidSignature)
        ));
    }

    #[test]
    fn rejects_stale_timestamps() {
        let now = Utc::now();
        let header = sign("whsec_a", "usr_1", "acct_1", now.timestamp() - 301);
        assert!(matches!(
            verify(Some(&header), "usr_1", "acct_1", &secrets(&["whsec_a"]), now, 300),
            Err(SignatureError::InvalidSignature)
        ));
    }

    #[test]
    fn rejects_tampered_identifiers() {
        let now = Utc::now();
        let header = sign("whsec_a", "usr_1", "acct_1", now.timestamp());
        assert!(matches!(
            verify(Some(&header), "usr_1", "acct_other", &secrets(&["whsec_a"]), now, 300),
            Err(SignatureError::InvalidSignature)
        ));
    }

    #[test]
    fn malformed_headers_are_missing() {
        let now = Utc::now();
        let configured = secrets(&["whsec_a"]);
        for header in [None, Some(""), Some("v1=abc"), Some("t=notanumber,v1=abc")] {
            assert!(matches!(
                verify(header, "usr_1", "acct_1", &configured, now, 300),
                Err(SignatureError::MissingHeader)
            ));
        }
    }

    #[test]
    fn extra_header_keys_are_ignored() {
        let now = Utc::now();
        let header = sign("whsec_a", "usr_1", "acct_1", now.timestamp());
        let with_extras = format!("{header},v0=legacy,foo=bar");
        assert!(verify(
            Some(&with_extras),
            "usr_1",
            "acct_1",
            &secrets(&["whsec_a"]),
            now,
            300
        )
        .is_ok());
    }

    #[test]
    fn no_secrets_is_misconfigured() {
        let now = Utc::now();
        let header = sign("whsec_a", "usr_1", "acct_1", now.timestamp());
        assert!(matches!(
            verify(Some(&header), "usr_1", "acct_1", &[], now, 300),
            Err(SignatureError::Misconfigured)
        ));
    }
}
