//! Install and callback endpoints for the OAuth authorization-code flow.

use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use chrono::{Duration, Utc};
use serde::Deserialize;

use crate::crypto;
use crate::db::models::StripeMode;
use crate::db::{oauth_connections, oauth_states};
use crate::error::{ApiError, ErrorCode};
use crate::state::AppState;
use crate::stripe::OAuthApiError;

const SUCCESS_HTML: &str = "<!doctype html><html><body>\
<h1>Connected</h1><p>The app is now connected. You can close this tab and \
return to your dashboard.</p></body></html>";

#[derive(Debug, Deserialize)]
pub struct InstallQuery {
    pub mode: StripeMode,
}

/// Start an install: mint a state nonce, store its digest, and send the user
/// to the platform's authorize page with the raw nonce as `state`.
pub async fn install(
    State(state): State<AppState>,
    Query(query): Query<InstallQuery>,
) -> Result<Response, ApiError> {
    let nonce = crypto::random_token_hex(32);
    oauth_states::create(&state.db_pool, &crypto::digest_hex(&nonce), query.mode)
        .await
        .error_code("state_store_failed")?;

    let authorize_url = state
        .stripe
        .authorize_url(query.mode, &nonce)
        .map_err(|e| ApiError::internal("oauth_not_configured").caused_by(e.into()))?;

    tracing::info!(mode = %query.mode, "redirecting to authorize page");
    Ok((StatusCode::FOUND, [(header::LOCATION, authorize_url)]).into_response())
}

#[derive(Debug, Deserialize)]
pub struct CallbackQuery {
    pub code: Option<String>,
    pub state: Option<String>,
    /// Account hint the platform passes on direct installs.
    pub account: Option<String>,
}

/// Direct installs carry no state of ours; pick the mode off the platform's
/// account hint. Heuristic by design: a hint mentioning "test" means test
/// mode, anything else (including no hint) means live.
fn direct_install_mode(account_hint: Option<&str>) -> StripeMode {
    match account_hint {
        Some(hint) if hint.contains("test") => StripeMode::Test,
        _ => StripeMode::Live,
    }
}

/// Complete an install: validate the callback, exchange the code, store the
/// encrypted token pair. Neither the code nor any token is echoed back.
pub async fn callback(
    State(state): State<AppState>,
    Query(query): Query<CallbackQuery>,
) -> Result<Html<&'static str>, ApiError> {
    let code = query
        .code
        .ok_or_else(|| ApiError::bad_request("missing_code"))?;

    let mode = match query.state {
        Some(raw_state) => {
            let consumed =
                oauth_states::consume(&state.db_pool, &crypto::digest_hex(&raw_state))
                    .await
                    .error_code("state_consume_failed")?;
            let row = consumed.ok_or_else(|| {
                ApiError::new(StatusCode::FORBIDDEN, "invalid_state")
            })?;
            tracing::info!(mode = %row.mode, "callback matched stored install state");
            row.mode
        }
        None => {
            let mode = direct_install_mode(query.account.as_deref());
            tracing::info!(mode = %mode, "callback without state, using direct-install mode");
            mode
        }
    };

    let grant = state
        .stripe
        .exchange_code(&code, mode)
        .await
        .map_err(exchange_error)?;

    let access_token_ct = state
        .cipher
        .encrypt(&grant.access_token)
        .error_code("token_encrypt_failed")?;
    let refresh_token_ct = state
        .cipher
        .encrypt(&grant.refresh_token)
        .error_code("token_encrypt_failed")?;
    let expires_at = Utc::now() + Duration::seconds(grant.expires_in_secs());

    oauth_connections::upsert(
        &state.db_pool,
        &oauth_connections::UpsertConnection {
            stripe_account_id: grant.stripe_user_id.clone(),
            livemode: grant.livemode,
            scope: grant.scope.clone(),
            stripe_publishable_key: grant.stripe_publishable_key.clone(),
            access_token_ct,
            access_token_expires_at: expires_at,
            refresh_token_ct,
        },
    )
    .await
    .error_code("connection_store_failed")?;

    tracing::info!(livemode = grant.livemode, "stored new OAuth connection");
    Ok(Html(SUCCESS_HTML))
}

fn exchange_error(error: OAuthApiError) -> ApiError {
    let (status, code) = match &error {
        OAuthApiError::Misconfigured { .. } => {
            (StatusCode::INTERNAL_SERVER_ERROR, "oauth_not_configured")
        }
        OAuthApiError::Auth { .. } => (StatusCode::FORBIDDEN, "code_rejected"),
        OAuthApiError::Transient { .. } | OAuthApiError::Malformed => {
            (StatusCode::BAD_GATEWAY, "platform_unavailable")
        }
    };
    ApiError::new(status, code).caused_by(error.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direct_install_mode_heuristic() {
        assert_eq!(direct_install_mode(Some("acct_test_123")), StripeMode::Test);
        assert_eq!(direct_install_mode(Some("testmode-hint")), StripeMode::Test);
        assert_eq!(direct_install_mode(Some("acct_live_123")), StripeMode::Live);
        assert_eq!(direct_install_mode(None), StripeMode::Live);
    }
}
