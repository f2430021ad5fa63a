use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use sqlx::PgPool;

use crate::db::models::{OAuthState, StripeMode};

/// How long an issued install state stays redeemable.
pub const STATE_TTL_MINUTES: i64 = 10;

const STATE_COLUMNS: &str = "state_hash, mode, expires_at, created_at";

/// Store the digest of a freshly issued install state.
pub async fn create(pool: &PgPool, state_hash: &str, mode: StripeMode) -> Result<()> {
    sqlx::query("INSERT INTO oauth_states (state_hash, mode, expires_at) VALUES ($1, $2, $3)")
        .bind(state_hash)
        .bind(mode)
        .bind(Utc::now() + Duration::minutes(STATE_TTL_MINUTES))
        .execute(pool)
        .await
        .context("Failed to store OAuth state")?;
    Ok(())
}

/// Atomically consume a state row. Returns `None` when the hash is unknown or
/// the row has expired. Lookup and deletion are one statement, so of two
/// concurrent redemptions at most one can succeed.
pub async fn consume(pool: &PgPool, state_hash: &str) -> Result<Option<OAuthState>> {
    let query = format!(
        "DELETE FROM oauth_states
         WHERE state_hash = $1 AND expires_at > NOW()
         RETURNING {STATE_COLUMNS}"
    );
    let row = sqlx::query_as::<_, OAuthState>(&query)
        .bind(state_hash)
        .fetch_optional(pool)
        .await
        .context("Failed to consume OAuth state")?;
    Ok(row)
}

/// Drop states that expired unredeemed. Returns how many rows went away.
pub async fn purge_expired(pool: &PgPool) -> Result<u64> {
    let result = sqlx::query("DELETE FROM oauth_states WHERE expires_at < NOW()")
        .execute(pool)
        .await
        .context("Failed to purge expired OAuth states")?;
    Ok(result.rows_affected())
}
