use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::db::models::OAuthConnection;

const CONNECTION_COLUMNS: &str = "stripe_account_id, livemode, scope, stripe_publishable_key, \
    access_token_ct, access_token_expires_at, refresh_token_ct, refresh_token_rotated_at, \
    created_at, updated_at";

/// Payload for [`upsert`]; everything the callback learns from a successful
/// code exchange, already encrypted.
#[derive(Debug)]
pub struct UpsertConnection {
    pub stripe_account_id: String,
    pub livemode: bool,
    pub scope: Option<String>,
    pub stripe_publishable_key: Option<String>,
    pub access_token_ct: String,
    pub access_token_expires_at: DateTime<Utc>,
    pub refresh_token_ct: String,
}

/// Insert or replace the connection for `(account, mode)`. A replacement also
/// stamps `refresh_token_rotated_at`, since the platform hands out a fresh
/// refresh token on every exchange.
pub async fn upsert(pool: &PgPool, input: &UpsertConnection) -> Result<OAuthConnection> {
    let query = format!(
        "INSERT INTO oauth_connections
            (stripe_account_id, livemode, scope, stripe_publishable_key,
             access_token_ct, access_token_expires_at, refresh_token_ct)
         VALUES ($1, $2, $3, $4, $5, $6, $7)
         ON CONFLICT (stripe_account_id, livemode)
         DO UPDATE SET
            scope = EXCLUDED.scope,
            stripe_publishable_key = EXCLUDED.stripe_publishable_key,
            access_token_ct = EXCLUDED.access_token_ct,
            access_token_expires_at = EXCLUDED.access_token_expires_at,
            refresh_token_ct = EXCLUDED.refresh_token_ct,
            refresh_token_rotated_at = NOW(),
            updated_at = NOW()
         RETURNING {CONNECTION_COLUMNS}"
    );
    let connection = sqlx::query_as::<_, OAuthConnection>(&query)
        .bind(&input.stripe_account_id)
        .bind(input.livemode)
        .bind(&input.scope)
        .bind(&input.stripe_publishable_key)
        .bind(&input.access_token_ct)
        .bind(input.access_token_expires_at)
        .bind(&input.refresh_token_ct)
        .fetch_one(pool)
        .await
        .context("Failed to upsert OAuth connection")?;
    Ok(connection)
}

/// Load the connection for one (account, mode).
pub async fn get(
    pool: &PgPool,
    stripe_account_id: &str,
    livemode: bool,
) -> Result<Option<OAuthConnection>> {
    let query = format!(
        "SELECT {CONNECTION_COLUMNS} FROM oauth_connections
         WHERE stripe_account_id = $1 AND livemode = $2"
    );
    let connection = sqlx::query_as::<_, OAuthConnection>(&query)
        .bind(stripe_account_id)
        .bind(livemode)
        .fetch_optional(pool)
        .await
        .context("Failed to get OAuth connection")?;
    Ok(connection)
}

/// Load whichever connection the account has, preferring live over test.
pub async fn get_preferring_live(
    pool: &PgPool,
    stripe_account_id: &str,
) -> Result<Option<OAuthConnection>> {
    let query = format!(
        "SELECT {CONNECTION_COLUMNS} FROM oauth_connections
         WHERE stripe_account_id = $1
         ORDER BY livemode DESC
         LIMIT 1"
    );
    let connection = sqlx::query_as::<_, OAuthConnection>(&query)
        .bind(stripe_account_id)
        .fetch_optional(pool)
        .await
        .context("Failed to get OAuth connection")?;
    Ok(connection)
}

/// All connections stored for an account, at most one per mode.
pub async fn list_for_account(
    pool: &PgPool,
    stripe_account_id: &str,
) -> Result<Vec<OAuthConnection>> {
    let query = format!(
        "SELECT {CONNECTION_COLUMNS} FROM oauth_connections
         WHERE stripe_account_id = $1
         ORDER BY livemode DESC"
    );
    let connections = sqlx::query_as::<_, OAuthConnection>(&query)
        .bind(stripe_account_id)
        .fetch_all(pool)
        .await
        .context("Failed to list OAuth connections")?;
    Ok(connections)
}

/// Persist a rotated token pair. One statement: the new refresh ciphertext,
/// the new access ciphertext and its expiry land together or not at all;
/// losing the rotated refresh token would orphan the account for good.
pub async fn update_rotated_tokens(
    pool: &PgPool,
    stripe_account_id: &str,
    livemode: bool,
    access_token_ct: &str,
    access_token_expires_at: DateTime<Utc>,
    refresh_token_ct: &str,
) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE oauth_connections
         SET access_token_ct = $3,
             access_token_expires_at = $4,
             refresh_token_ct = $5,
             refresh_token_rotated_at = NOW(),
             updated_at = NOW()
         WHERE stripe_account_id = $1 AND livemode = $2",
    )
    .bind(stripe_account_id)
    .bind(livemode)
    .bind(access_token_ct)
    .bind(access_token_expires_at)
    .bind(refresh_token_ct)
    .execute(pool)
    .await
    .context("Failed to persist rotated tokens")?;
    Ok(result.rows_affected() > 0)
}

/// Delete a stored connection (explicit disconnect). Returns whether a row
/// existed.
pub async fn delete(pool: &PgPool, stripe_account_id: &str, livemode: bool) -> Result<bool> {
    let result = sqlx::query(
        "DELETE FROM oauth_connections WHERE stripe_account_id = $1 AND livemode = $2",
    )
    .bind(stripe_account_id)
    .bind(livemode)
    .execute(pool)
    .await
    .context("Failed to delete OAuth connection")?;
    Ok(result.rows_affected() > 0)
}

/// Delete every connection an account has. Returns how many went away.
pub async fn delete_all_for_account(pool: &PgPool, stripe_account_id: &str) -> Result<u64> {
    let result = sqlx::query("DELETE FROM oauth_connections WHERE stripe_account_id = $1")
        .bind(stripe_account_id)
        .execute(pool)
        .await
        .context("Failed to delete OAuth connections")?;
    Ok(result.rows_affected())
}

/// Connections whose access token expires before the given instant, oldest
/// expiry first. Feeds the bulk sweeper.
pub async fn find_expiring(
    pool: &PgPool,
    expires_before: DateTime<Utc>,
    limit: i64,
) -> Result<Vec<OAuthConnection>> {
    let query = format!(
        "SELECT {CONNECTION_COLUMNS} FROM oauth_connections
         WHERE access_token_expires_at <= $1
         ORDER BY access_token_expires_at ASC
         LIMIT $2"
    );
    let connections = sqlx::query_as::<_, OAuthConnection>(&query)
        .bind(expires_before)
        .bind(limit)
        .fetch_all(pool)
        .await
        .context("Failed to find expiring connections")?;
    Ok(connections)
}

/// Every stored connection up to `limit`, for a forced sweep.
pub async fn list_all(pool: &PgPool, limit: i64) -> Result<Vec<OAuthConnection>> {
    let query = format!(
        "SELECT {CONNECTION_COLUMNS} FROM oauth_connections
         ORDER BY access_token_expires_at ASC
         LIMIT $1"
    );
    let connections = sqlx::query_as::<_, OAuthConnection>(&query)
        .bind(limit)
        .fetch_all(pool)
        .await
        .context("Failed to list connections")?;
    Ok(connections)
}
