//! Scrubbing of secret material from error text before it is persisted or
//! shown to the dashboard.

use lazy_static::lazy_static;
use regex::Regex;

pub const REDACTED: &str = "[REDACTED]";

lazy_static! {
    // Bearer headers first: they would otherwise leave "Bearer " behind with
    // only the token part replaced by a later pattern.
    static ref BEARER: Regex = Regex::new(r"(?i)bearer\s+[A-Za-z0-9._~+/=-]+").unwrap();
    static ref API_KEY: Regex = Regex::new(r"\b(sk|rk|pk)_(live|test)_[A-Za-z0-9]+").unwrap();
    static ref REFRESH_TOKEN: Regex = Regex::new(r"\brt_[A-Za-z0-9]+").unwrap();
    static ref JWT: Regex = Regex::new(r"eyJ[A-Za-z0-9_-]+(\.[A-Za-z0-9_-]+)+").unwrap();
}

/// Replace platform bearer tokens, secret keys, refresh tokens and JWTs with
/// a fixed marker. Applied to every error string before it reaches the
/// `error_message` column.
pub fn sanitize(message: &str) -> String {
    let message = BEARER.replace_all(message, REDACTED);
    let message = API_KEY.replace_all(&message, REDACTED);
    let message = REFRESH_TOKEN.replace_all(&message, REDACTED);
    let message = JWT.replace_all(&message, REDACTED);
    message.into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_api_keys() {
        assert_eq!(
            sanitize("auth failed for sk_live_abc123DEF"),
            "auth failed for [REDACTED]"
        );
        assert_eq!(sanitize("rk_test_x1 rejected"), "[REDACTED] rejected");
        assert_eq!(sanitize("key pk_test_99 invalid"), "key [REDACTED] invalid");
    }

    #[test]
    fn strips_refresh_tokens() {
        assert_eq!(sanitize("rotating rt_abcDEF123"), "rotating [REDACTED]");
    }

    #[test]
    fn strips_bearer_headers() {
        assert_eq!(
            sanitize("401 with Authorization: Bearer sk_live_secret99"),
            "401 with Authorization: [REDACTED]"
        );
    }

    #[test]
    fn strips_jwts() {
        let message = "token eyJhbGciOiJIUzI1NiJ9.eyJzdWIiOiJ4In0.c2ln expired";
        assert_eq!(sanitize(message), "token [REDACTED] expired");
    }

    #[test]
    fn leaves_ordinary_text_alone() {
        let message = "timed out waiting for database to become ready after 600s";
        assert_eq!(sanitize(message), message);
    }

    #[test]
    fn handles_mixed_messages() {
        let message = "install failed: Bearer eyJa.bc.de rejected, retry with sk_test_k9 or rt_z8";
        let sanitized = sanitize(message);
        assert!(!sanitized.contains("sk_test_k9"));
        assert!(!sanitized.contains("rt_z8"));
        assert!(!sanitized.contains("eyJa.bc.de"));
        assert!(sanitized.contains("install failed"));
    }
}
