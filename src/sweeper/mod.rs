//! Bulk token sweep: find connections whose access token is about to expire
//! and rotate them ahead of time, so dashboard polls rarely pay for a refresh
//! inline. Runs from the in-process controller every half hour and from the
//! standalone `sweeper` binary for external schedulers.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use sqlx::PgPool;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::interval;

use crate::db::oauth_connections;
use crate::oauth::tokens::TokenService;

/// How often the in-process controller sweeps.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(30 * 60);

/// Rows expiring within this window get refreshed. Wider than the sweep
/// interval so a token can never fall between two sweeps.
pub const EXPIRY_WINDOW_MINUTES: i64 = 35;

/// Upper bound on rows per sweep.
pub const BATCH_LIMIT: i64 = 200;

/// Concurrent refreshes in flight.
pub const CONCURRENCY: usize = 5;

#[derive(Debug, Clone, Copy, Default)]
pub struct SweepOptions {
    /// Refresh every stored connection, not just the near-expiry ones.
    pub force_all: bool,
    /// Log what would happen without calling upstream or writing back.
    pub dry_run: bool,
}

#[derive(Debug, Default, Serialize)]
pub struct SweepSummary {
    pub total: usize,
    pub refreshed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub failures: Vec<SweepFailure>,
}

/// A failed refresh, identified only by the tail of the account id.
#[derive(Debug, Serialize)]
pub struct SweepFailure {
    pub account_suffix: String,
    pub livemode: bool,
    pub kind: String,
}

/// Last six characters of an account id, for summaries and logs that leave
/// the service.
fn account_suffix(stripe_account_id: &str) -> String {
    let chars: Vec<char> = stripe_account_id.chars().collect();
    let start = chars.len().saturating_sub(6);
    chars[start..].iter().collect()
}

pub async fn run_sweep(
    pool: &PgPool,
    tokens: Arc<TokenService>,
    options: SweepOptions,
) -> Result<SweepSummary> {
    let rows = if options.force_all {
        oauth_connections::list_all(pool, BATCH_LIMIT).await?
    } else {
        let threshold = Utc::now() + chrono::Duration::minutes(EXPIRY_WINDOW_MINUTES);
        oauth_connections::find_expiring(pool, threshold, BATCH_LIMIT).await?
    };

    let mut summary = SweepSummary {
        total: rows.len(),
        ..Default::default()
    };

    if options.dry_run {
        for row in &rows {
            tracing::info!(
                account_suffix = %account_suffix(&row.stripe_account_id),
                livemode = row.livemode,
                expires_at = %row.access_token_expires_at,
                "dry run: would refresh"
            );
        }
        summary.skipped = summary.total;
        return Ok(summary);
    }

    let semaphore = Arc::new(Semaphore::new(CONCURRENCY));
    let mut join_set = JoinSet::new();

    for row in rows {
        let permit = semaphore
            .clone()
            .acquire_owned()
            .await
            .context("Sweep semaphore closed")?;
        let tokens = tokens.clone();
        join_set.spawn(async move {
            let _permit = permit;
            let outcome = tokens.refresh_and_store(&row).await.map(|_| ());
            (row.stripe_account_id, row.livemode, outcome)
        });
    }

    while let Some(joined) = join_set.join_next().await {
        match joined {
            Ok((account_id, livemode, Ok(()))) => {
                summary.refreshed += 1;
                tracing::info!(
                    account_suffix = %account_suffix(&account_id),
                    livemode,
                    "refreshed"
                );
            }
            Ok((account_id, livemode, Err(error))) => {
                summary.failed += 1;
                let kind = error.kind().to_string();
                tracing::warn!(
                    account_suffix = %account_suffix(&account_id),
                    livemode,
                    kind = %kind,
                    "refresh failed"
                );
                summary.failures.push(SweepFailure {
                    account_suffix: account_suffix(&account_id),
                    livemode,
                    kind,
                });
            }
            Err(join_error) => {
                summary.failed += 1;
                tracing::error!(error = ?join_error, "sweep task panicked");
            }
        }
    }

    tracing::info!(
        total = summary.total,
        refreshed = summary.refreshed,
        failed = summary.failed,
        skipped = summary.skipped,
        "sweep complete"
    );
    Ok(summary)
}

/// Background controller that sweeps on a fixed cadence, following the same
/// shape as the provisioning tick loops: spawn once at startup, log, never
/// crash the process.
pub struct SweeperController {
    pool: PgPool,
    tokens: Arc<TokenService>,
    sweep_interval: Duration,
}

impl SweeperController {
    pub fn new(pool: PgPool, tokens: Arc<TokenService>) -> Self {
        Self {
            pool,
            tokens,
            sweep_interval: SWEEP_INTERVAL,
        }
    }

    pub fn start(self: Arc<Self>) {
        tokio::spawn(async move {
            tracing::info!("token sweeper started");
            let mut ticker = interval(self.sweep_interval);
            loop {
                ticker.tick().await;
                if let Err(e) =
                    run_sweep(&self.pool, self.tokens.clone(), SweepOptions::default()).await
                {
                    tracing::error!(error = ?e, "token sweep failed");
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suffix_redacts_to_six_chars() {
        assert_eq!(account_suffix("acct_1GqyDT2eZvKYlo2C"), "KYlo2C");
        assert_eq!(account_suffix("short"), "short");
        assert_eq!(account_suffix(""), "");
    }
}
