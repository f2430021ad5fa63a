//! Just-in-time access to a tenant's platform token.
//!
//! Readers call [`TokenService::get_fresh_access`] and receive an access
//! token that is valid for at least the skew window. When the stored token is
//! closer to expiry than that, the stored refresh token is rotated through
//! the platform and the new pair is persisted *before* the access token is
//! handed out. The platform invalidates the old refresh token on rotation,
//! so a pair that was used but never stored orphans the account permanently.

use std::sync::Arc;

use anyhow::anyhow;
use chrono::{Duration, Utc};
use sqlx::PgPool;
use thiserror::Error;

use crate::crypto::TokenCipher;
use crate::db::models::{OAuthConnection, StripeMode};
use crate::db::oauth_connections;
use crate::stripe::{OAuthApiError, StripeOAuthClient};

/// Don't hand out tokens that would expire mid-upstream-call.
pub const REFRESH_SKEW_MINUTES: i64 = 5;

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("account has no stored OAuth connection")]
    NotConnected,
    #[error("stored token ciphertext is unreadable")]
    Corrupt,
    #[error("token refresh failed")]
    RefreshFailed(#[source] OAuthApiError),
    #[error(transparent)]
    Db(#[from] anyhow::Error),
}

impl TokenError {
    /// Short machine-readable kind, used in sweep summaries and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            TokenError::NotConnected => "not_connected",
            TokenError::Corrupt => "corrupt",
            TokenError::RefreshFailed(source) => source.kind(),
            TokenError::Db(_) => "db",
        }
    }
}

pub struct TokenService {
    pool: PgPool,
    cipher: Arc<TokenCipher>,
    stripe: Arc<StripeOAuthClient>,
}

impl TokenService {
    pub fn new(pool: PgPool, cipher: Arc<TokenCipher>, stripe: Arc<StripeOAuthClient>) -> Self {
        Self {
            pool,
            cipher,
            stripe,
        }
    }

    /// Return a currently valid access token for (account, mode), refreshing
    /// with rotation if the stored one is near expiry.
    pub async fn get_fresh_access(
        &self,
        stripe_account_id: &str,
        mode: StripeMode,
    ) -> Result<String, TokenError> {
        let connection = oauth_connections::get(&self.pool, stripe_account_id, mode.livemode())
            .await?
            .ok_or(TokenError::NotConnected)?;
        self.fresh_access_for(&connection).await
    }

    /// Like [`get_fresh_access`](Self::get_fresh_access) but takes whichever
    /// mode the account has connected, preferring live.
    pub async fn get_fresh_access_preferring_live(
        &self,
        stripe_account_id: &str,
    ) -> Result<String, TokenError> {
        let connection = oauth_connections::get_preferring_live(&self.pool, stripe_account_id)
            .await?
            .ok_or(TokenError::NotConnected)?;
        self.fresh_access_for(&connection).await
    }

    async fn fresh_access_for(&self, connection: &OAuthConnection) -> Result<String, TokenError> {
        let now = Utc::now();
        if connection.access_token_expires_at > now + Duration::minutes(REFRESH_SKEW_MINUTES) {
            return self
                .cipher
                .decrypt(&connection.access_token_ct)
                .map_err(|_| TokenError::Corrupt);
        }
        self.refresh_and_store(connection).await
    }

    /// Unconditionally rotate a stored connection's tokens and persist the
    /// result. Used by the expiry path above and by the bulk sweeper, which
    /// refreshes ahead of the skew window. On any failure the stored row is
    /// left untouched.
    pub async fn refresh_and_store(
        &self,
        connection: &OAuthConnection,
    ) -> Result<String, TokenError> {
        let refresh_token = self
            .cipher
            .decrypt(&connection.refresh_token_ct)
            .map_err(|_| TokenError::Corrupt)?;

        let grant = self
            .stripe
            .refresh(&refresh_token, connection.mode())
            .await
            .map_err(TokenError::RefreshFailed)?;

        let access_token_ct = self
            .cipher
            .encrypt(&grant.access_token)
            .map_err(|_| TokenError::Corrupt)?;
        let refresh_token_ct = self
            .cipher
            .encrypt(&grant.refresh_token)
            .map_err(|_| TokenError::Corrupt)?;
        let expires_at = Utc::now() + Duration::seconds(grant.expires_in_secs());

        let updated = oauth_connections::update_rotated_tokens(
            &self.pool,
            &connection.stripe_account_id,
            connection.livemode,
            &access_token_ct,
            expires_at,
            &refresh_token_ct,
        )
        .await?;
        if !updated {
            return Err(TokenError::Db(anyhow!(
                "connection row disappeared during refresh"
            )));
        }

        Ok(grant.access_token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kinds_map_through() {
        assert_eq!(TokenError::NotConnected.kind(), "not_connected");
        assert_eq!(TokenError::Corrupt.kind(), "corrupt");
        assert_eq!(
            TokenError::RefreshFailed(OAuthApiError::Malformed).kind(),
            "upstream_malformed"
        );
        assert_eq!(
            TokenError::RefreshFailed(OAuthApiError::Transient {
                reason: "status 500".into()
            })
            .kind(),
            "upstream_transient"
        );
        assert_eq!(
            TokenError::RefreshFailed(OAuthApiError::Misconfigured {
                mode: StripeMode::Live
            })
            .kind(),
            "misconfigured"
        );
        assert_eq!(TokenError::Db(anyhow!("boom")).kind(), "db");
    }
}
