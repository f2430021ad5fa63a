pub mod models;
pub mod oauth_connections;
pub mod oauth_states;
pub mod provisioned_databases;

pub use models::*;

use std::future::Future;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgSslMode};
use sqlx::PgPool;

/// Connect to PostgreSQL with the pool shape the handlers are sized for:
/// ten connections, a ten-second acquire deadline, a thirty-second idle
/// timeout, TLS required.
pub async fn connect(database_url: &str) -> Result<PgPool> {
    let options = PgConnectOptions::from_str(database_url)
        .context("Invalid DATABASE_URL")?
        .ssl_mode(PgSslMode::Require);

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(10))
        .idle_timeout(Duration::from_secs(30))
        .connect_with(options)
        .await
        .context("Failed to connect to PostgreSQL")?;

    Ok(pool)
}

/// Outcome of a [`with_tenant_lock`] attempt.
#[derive(Debug)]
pub enum LockOutcome<T> {
    Acquired(T),
    Busy,
}

/// Stable 64-bit advisory-lock key for an account.
pub fn tenant_lock_key(stripe_account_id: &str) -> i64 {
    let digest = Sha256::digest(stripe_account_id.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    i64::from_be_bytes(prefix)
}

/// Run `work` while holding the session-scoped advisory lock for an account.
///
/// The lock is taken non-blocking on a dedicated pooled connection; if some
/// other handler already holds it, `work` is never called and `Busy` is
/// returned immediately. `work` itself talks to the database through the
/// pool as usual; the dedicated connection exists only to pin the lock for
/// the duration.
///
/// Release happens on every exit path: the unlock statement runs after
/// `work` regardless of its result, and if that statement cannot be issued
/// the connection is detached from the pool so the session (and with it the
/// lock) dies instead of leaking back into circulation still locked.
pub async fn with_tenant_lock<T, F, Fut>(
    pool: &PgPool,
    stripe_account_id: &str,
    work: F,
) -> Result<LockOutcome<T>>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut conn = pool
        .acquire()
        .await
        .context("Failed to acquire connection for advisory lock")?;
    let key = tenant_lock_key(stripe_account_id);

    let (acquired,): (bool,) = sqlx::query_as("SELECT pg_try_advisory_lock($1)")
        .bind(key)
        .fetch_one(&mut *conn)
        .await
        .context("Failed to take advisory lock")?;
    if !acquired {
        return Ok(LockOutcome::Busy);
    }

    let result = work().await;

    match sqlx::query_as::<_, (bool,)>("SELECT pg_advisory_unlock($1)")
        .bind(key)
        .fetch_one(&mut *conn)
        .await
    {
        Ok((released,)) => {
            if !released {
                tracing::warn!(key, "advisory unlock reported no lock held");
            }
        }
        Err(e) => {
            tracing::warn!(
                error = %e,
                key,
                "failed to release advisory lock, discarding connection"
            );
            drop(conn.detach());
        }
    }

    result.map(LockOutcome::Acquired)
}
