use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Validates `HMAC-SHA256(secret, "<unix_ts>." || body) == signature`, with
/// the timestamp constrained to `|now - ts| <= skew_seconds`. Mirrors
/// `app/services/security.py::validate_hmac`, upgraded to a constant-time
/// comparison (the original's `hmac.compare_digest` is also constant-time;
/// the teacher's Coinbase webhook handler compares with `==`, which this
/// does not repeat).
pub fn validate_hmac(
    secret: &str,
    timestamp: &str,
    body: &[u8],
    signature_hex: &str,
    now: i64,
    skew_seconds: i64,
) -> bool {
    if secret.is_empty() {
        return false;
    }
    let Ok(ts) = timestamp.parse::<i64>() else {
        return false;
    };
    if (now - ts).abs() > skew_seconds {
        return false;
    }

    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(ts.to_string().as_bytes());
    mac.update(b".");
    mac.update(body);
    let expected = mac.finalize().into_bytes();
    let expected_hex = hex::encode(expected);

    let provided = signature_hex.as_bytes();
    let expected = expected_hex.as_bytes();
    if provided.len() != expected.len() {
        return false;
    }
    provided.ct_eq(expected).into()
}

/// Optional second gate: a fixed shared token, compared in constant time.
pub fn validate_webhook_token(configured: Option<&str>, provided: Option<&str>) -> bool {
    match configured {
        None => true,
        Some(expected) => {
            let Some(provided) = provided else { return false };
            let expected_bytes = expected.as_bytes();
            let provided_bytes = provided.as_bytes();
            expected_bytes.len() == provided_bytes.len() && expected_bytes.ct_eq(provided_bytes).into()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sign(secret: &str, ts: i64, body: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(ts.to_string().as_bytes());
        mac.update(b".");
        mac.update(body);
        hex::encode(mac.finalize().into_bytes())
    }

    #[test]
    fn accepts_valid_signature_within_skew() {
        let body = br#"{"number":"11999999999"}"#;
        let ts = 1_700_000_000i64;
        let sig = sign("secret", ts, body);
        assert!(validate_hmac("secret", &ts.to_string(), body, &sig, ts + 1, 300));
    }

    #[test]
    fn rejects_signature_outside_skew_window() {
        let body = br#"{"number":"11999999999"}"#;
        let ts = 1_700_000_000i64;
        let sig = sign("secret", ts, body);
        assert!(!validate_hmac("secret", &ts.to_string(), body, &sig, ts + 301, 300));
    }

    #[test]
    fn rejects_tampered_body() {
        let body = br#"{"number":"11999999999"}"#;
        let ts = 1_700_000_000i64;
        let sig = sign("secret", ts, body);
        let tampered = br#"{"number":"11999999998"}"#;
        assert!(!validate_hmac("secret", &ts.to_string(), tampered, &sig, ts, 300));
    }

    #[test]
    fn rejects_non_numeric_timestamp() {
        let body = b"{}";
        assert!(!validate_hmac("secret", "not-a-number", body, "deadbeef", 0, 300));
    }

    #[test]
    fn rejects_missing_secret() {
        let body = b"{}";
        assert!(!validate_hmac("", "1700000000", body, "deadbeef", 1_700_000_000, 300));
    }

    #[test]
    fn token_gate_passes_through_when_unconfigured() {
        assert!(validate_webhook_token(None, None));
    }

    #[test]
    fn token_gate_rejects_mismatch() {
        assert!(!validate_webhook_token(Some("expected"), Some("wrong")));
        assert!(validate_webhook_token(Some("expected"), Some("expected")));
    }
}
