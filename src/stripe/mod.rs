//! Stripe OAuth token endpoint client.
//!
//! One entrypoint per direction: [`StripeOAuthClient::exchange_code`] turns
//! an authorization code into a token pair, [`StripeOAuthClient::refresh`]
//! rotates a refresh token. Both speak the same wire contract: POST to the
//! token endpoint, HTTP Basic with the per-mode secret key as username and an
//! empty password, form-encoded body, JSON response.

use reqwest::{Client as HttpClient, StatusCode};
use serde::Deserialize;
use thiserror::Error;

use crate::db::models::StripeMode;

pub const DEFAULT_TOKEN_URL: &str = "https://api.stripe.com/v1/oauth/token";
pub const DEFAULT_AUTHORIZE_URL: &str = "https://marketplace.stripe.com/oauth/v2/authorize";
pub const DEFAULT_API_URL: &str = "https://api.stripe.com";

/// Access tokens default to an hour when the platform omits `expires_in`.
pub const DEFAULT_EXPIRES_IN_SECS: i64 = 3600;

#[derive(Debug, Error)]
pub enum OAuthApiError {
    /// No client credentials configured for the requested mode.
    #[error("no client credentials configured for {mode} mode")]
    Misconfigured { mode: StripeMode },
    /// The platform rejected the grant or our credentials. Not retryable.
    #[error("token endpoint rejected the request: {code}")]
    Auth { code: String },
    /// Transport failures and 5xx responses. The caller may try again later.
    #[error("token endpoint unavailable: {reason}")]
    Transient { reason: String },
    /// A response that does not carry the required grant fields.
    #[error("token endpoint returned a malformed response")]
    Malformed,
}

impl OAuthApiError {
    pub fn kind(&self) -> &'static str {
        match self {
            OAuthApiError::Misconfigured { .. } => "misconfigured",
            OAuthApiError::Auth { .. } => "upstream_auth",
            OAuthApiError::Transient { .. } => "upstream_transient",
            OAuthApiError::Malformed => "upstream_malformed",
        }
    }
}

/// A successful grant from the token endpoint.
#[derive(Debug, Clone)]
pub struct TokenGrant {
    pub access_token: String,
    pub refresh_token: String,
    pub scope: Option<String>,
    pub livemode: bool,
    pub stripe_user_id: String,
    pub stripe_publishable_key: Option<String>,
    pub expires_in: Option<i64>,
}

impl TokenGrant {
    pub fn expires_in_secs(&self) -> i64 {
        self.expires_in.unwrap_or(DEFAULT_EXPIRES_IN_SECS)
    }

    pub fn mode(&self) -> StripeMode {
        StripeMode::from_livemode(self.livemode)
    }
}

/// Whatever the token endpoint sent back; success and error envelopes share
/// one lenient shape so a bare `{}` still parses.
#[derive(Debug, Default, Deserialize)]
struct RawTokenResponse {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    scope: Option<String>,
    #[serde(default)]
    livemode: Option<bool>,
    #[serde(default)]
    stripe_user_id: Option<String>,
    #[serde(default)]
    stripe_publishable_key: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

/// Classify a token-endpoint response. The platform's 500s often come with an
/// empty or `{}` body, so "no error envelope" alone is never treated as
/// success; the required grant fields must actually be present.
fn classify_response(status: StatusCode, body: &[u8]) -> Result<TokenGrant, OAuthApiError> {
    if status.is_server_error() {
        return Err(OAuthApiError::Transient {
            reason: format!("status {}", status.as_u16()),
        });
    }

    let raw: RawTokenResponse = match serde_json::from_slice(body) {
        Ok(raw) => raw,
        Err(_) if body.is_empty() => RawTokenResponse::default(),
        Err(_) => return Err(OAuthApiError::Malformed),
    };

    if let Some(error) = raw.error {
        let code = match raw.error_description {
            Some(description) => format!("{error}: {description}"),
            None => error,
        };
        return Err(OAuthApiError::Auth { code });
    }

    if !status.is_success() {
        return Err(OAuthApiError::Auth {
            code: format!("status {}", status.as_u16()),
        });
    }

    match (raw.access_token, raw.refresh_token, raw.stripe_user_id) {
        (Some(access_token), Some(refresh_token), Some(stripe_user_id)) => Ok(TokenGrant {
            access_token,
            refresh_token,
            scope: raw.scope,
            livemode: raw.livemode.unwrap_or(false),
            stripe_user_id,
            stripe_publishable_key: raw.stripe_publishable_key,
            expires_in: raw.expires_in,
        }),
        _ => Err(OAuthApiError::Malformed),
    }
}

#[derive(Debug, Clone, Default)]
pub struct ModeCredentials {
    pub client_id: Option<String>,
    pub secret_key: Option<String>,
}

pub struct StripeOAuthConfig {
    pub http: HttpClient,
    pub token_url: String,
    pub authorize_url: String,
    pub redirect_uri: String,
    pub test: ModeCredentials,
    pub live: ModeCredentials,
}

pub struct StripeOAuthClient {
    http: HttpClient,
    token_url: String,
    authorize_url: String,
    redirect_uri: String,
    test: ModeCredentials,
    live: ModeCredentials,
}

impl StripeOAuthClient {
    pub fn new(config: StripeOAuthConfig) -> Self {
        Self {
            http: config.http,
            token_url: config.token_url,
            authorize_url: config.authorize_url,
            redirect_uri: config.redirect_uri,
            test: config.test,
            live: config.live,
        }
    }

    fn credentials(&self, mode: StripeMode) -> &ModeCredentials {
        match mode {
            StripeMode::Test => &self.test,
            StripeMode::Live => &self.live,
        }
    }

    fn secret_key(&self, mode: StripeMode) -> Result<&str, OAuthApiError> {
        self.credentials(mode)
            .secret_key
            .as_deref()
            .ok_or(OAuthApiError::Misconfigured { mode })
    }

    /// Build the authorize URL the install flow redirects users to.
    pub fn authorize_url(&self, mode: StripeMode, state: &str) -> Result<String, OAuthApiError> {
        let client_id = self
            .credentials(mode)
            .client_id
            .as_deref()
            .ok_or(OAuthApiError::Misconfigured { mode })?;

        let params = [
            ("client_id", client_id),
            ("redirect_uri", self.redirect_uri.as_str()),
            ("state", state),
        ];
        let query = params
            .iter()
            .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
            .collect::<Vec<_>>()
            .join("&");

        Ok(format!("{}?{}", self.authorize_url, query))
    }

    /// Exchange an authorization code for a token pair.
    pub async fn exchange_code(
        &self,
        code: &str,
        mode: StripeMode,
    ) -> Result<TokenGrant, OAuthApiError> {
        self.token_request(mode, &[("grant_type", "authorization_code"), ("code", code)])
            .await
    }

    /// Rotate a refresh token. The previous refresh token is dead the moment
    /// this succeeds; the caller must persist the returned pair before using
    /// the new access token.
    pub async fn refresh(
        &self,
        refresh_token: &str,
        mode: StripeMode,
    ) -> Result<TokenGrant, OAuthApiError> {
        self.token_request(
            mode,
            &[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
            ],
        )
        .await
    }

    async fn token_request(
        &self,
        mode: StripeMode,
        form: &[(&str, &str)],
    ) -> Result<TokenGrant, OAuthApiError> {
        let secret_key = self.secret_key(mode)?;

        let response = self
            .http
            .post(&self.token_url)
            .basic_auth(secret_key, Some(""))
            .form(form)
            .send()
            .await
            .map_err(|e| OAuthApiError::Transient {
                reason: format!("request failed: {e}"),
            })?;

        let status = response.status();
        let request_id = response
            .headers()
            .get("request-id")
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        let body = response.bytes().await.map_err(|e| OAuthApiError::Transient {
            reason: format!("body read failed: {e}"),
        })?;

        let result = classify_response(status, &body);
        if let Err(error) = &result {
            // Structural flags only; never the body or any token material.
            tracing::warn!(
                mode = %mode,
                status = status.as_u16(),
                request_id = request_id.as_deref(),
                kind = error.kind(),
                "stripe token request failed"
            );
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classify(status: u16, body: &str) -> Result<TokenGrant, OAuthApiError> {
        classify_response(StatusCode::from_u16(status).unwrap(), body.as_bytes())
    }

    #[test]
    fn full_grant_parses() {
        let grant = classify(
            200,
            r#"{
                "access_token": "at_1",
                "refresh_token": "rt_1",
                "token_type": "bearer",
                "scope": "read_only",
                "livemode": false,
                "stripe_user_id": "acct_X",
                "stripe_publishable_key": "pk_test_abc",
                "expires_in": 3600
            }"#,
        )
        .unwrap();
        assert_eq!(grant.access_token, "at_1");
        assert_eq!(grant.refresh_token, "rt_1");
        assert_eq!(grant.stripe_user_id, "acct_X");
        assert_eq!(grant.mode(), StripeMode::Test);
        assert_eq!(grant.expires_in_secs(), 3600);
    }

    #[test]
    fn missing_expires_in_defaults_to_an_hour() {
        let grant = classify(
            200,
            r#"{"access_token":"a","refresh_token":"r","stripe_user_id":"acct_X"}"#,
        )
        .unwrap();
        assert_eq!(grant.expires_in_secs(), DEFAULT_EXPIRES_IN_SECS);
    }

    #[test]
    fn error_envelope_is_an_auth_failure() {
        let err = classify(
            400,
            r#"{"error":"invalid_grant","error_description":"code expired"}"#,
        )
        .unwrap_err();
        match err {
            OAuthApiError::Auth { code } => assert_eq!(code, "invalid_grant: code expired"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn error_envelope_wins_even_on_http_200() {
        assert!(matches!(
            classify(200, r#"{"error":"invalid_client"}"#),
            Err(OAuthApiError::Auth { .. })
        ));
    }

    #[test]
    fn upstream_500_is_transient_regardless_of_body() {
        assert!(matches!(classify(500, ""), Err(OAuthApiError::Transient { .. })));
        assert!(matches!(classify(500, "{}"), Err(OAuthApiError::Transient { .. })));
        assert!(matches!(
            classify(503, r#"{"access_token":"a"}"#),
            Err(OAuthApiError::Transient { .. })
        ));
    }

    #[test]
    fn missing_required_fields_is_malformed() {
        // Empty body on a 200 must never pass for success.
        assert!(matches!(classify(200, ""), Err(OAuthApiError::Malformed)));
        assert!(matches!(classify(200, "{}"), Err(OAuthApiError::Malformed)));
        assert!(matches!(
            classify(200, r#"{"access_token":"a","stripe_user_id":"acct_X"}"#),
            Err(OAuthApiError::Malformed)
        ));
        assert!(matches!(
            classify(200, r#"{"access_token":"a","refresh_token":"r"}"#),
            Err(OAuthApiError::Malformed)
        ));
    }

    #[test]
    fn non_json_body_is_malformed() {
        assert!(matches!(
            classify(200, "<html>gateway</html>"),
            Err(OAuthApiError::Malformed)
        ));
    }

    #[test]
    fn plain_4xx_is_an_auth_failure() {
        assert!(matches!(classify(401, "{}"), Err(OAuthApiError::Auth { .. })));
    }

    fn test_client() -> StripeOAuthClient {
        StripeOAuthClient::new(StripeOAuthConfig {
            http: HttpClient::new(),
            token_url: DEFAULT_TOKEN_URL.to_string(),
            authorize_url: DEFAULT_AUTHORIZE_URL.to_string(),
            redirect_uri: "https://sync.example.com/oauth/callback".to_string(),
            test: ModeCredentials {
                client_id: Some("ca_test_123".to_string()),
                secret_key: Some("sk_test_abc".to_string()),
            },
            live: ModeCredentials::default(),
        })
    }

    #[test]
    fn builds_authorize_url() {
        let url = test_client().authorize_url(StripeMode::Test, "state-123").unwrap();
        assert!(url.starts_with("https://marketplace.stripe.com/oauth/v2/authorize?"));
        assert!(url.contains("client_id=ca_test_123"));
        assert!(url.contains("state=state-123"));
        assert!(url.contains(
            "redirect_uri=https%3A%2F%2Fsync.example.com%2Foauth%2Fcallback"
        ));
    }

    #[test]
    fn missing_mode_credentials_is_misconfigured() {
        let err = test_client().authorize_url(StripeMode::Live, "s").unwrap_err();
        assert!(matches!(
            err,
            OAuthApiError::Misconfigured {
                mode: StripeMode::Live
            }
        ));
    }
}
