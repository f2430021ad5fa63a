//! The tick engine: advances an account's install by at most one bounded
//! step per invocation, always under that account's advisory lock. Ticks run
//! during status polls from the dashboard, so every poll contributes
//! progress; a busy lock makes the tick a silent no-op and the next poll
//! retries.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use sqlx::PgPool;

use crate::crypto::{self, TokenCipher};
use crate::db::models::{InstallStatus, InstallStep, ProvisionedDatabase};
use crate::db::{self, provisioned_databases, LockOutcome};
use crate::oauth::tokens::TokenService;
use crate::provision::redact;
use crate::provision::state_machine::{self, plan_tick, status_for_step, TickAction};
use crate::supabase::{self, SupabaseClient};
use crate::sync::SyncInstaller;

/// Length of the generated database password.
pub const DB_PASSWORD_LEN: usize = 24;

/// The single readiness probe: liveness, namespace creation, schema
/// visibility, one control-plane call. The rows of the final statement come
/// back; seeing the schema name means the database is ready for install.
const READINESS_PROBE_SQL: &str = "SELECT 1;
CREATE SCHEMA IF NOT EXISTS stripe;
SELECT schema_name FROM information_schema.schemata WHERE schema_name = 'stripe';";

#[derive(Debug)]
pub enum DeprovisionOutcome {
    Deleted,
    NotProvisioned,
}

pub struct ProvisionEngine {
    pool: PgPool,
    supabase: Arc<SupabaseClient>,
    installer: Arc<dyn SyncInstaller>,
    tokens: Arc<TokenService>,
    cipher: Arc<TokenCipher>,
    wait_ready_timeout: Duration,
}

impl ProvisionEngine {
    pub fn new(
        pool: PgPool,
        supabase: Arc<SupabaseClient>,
        installer: Arc<dyn SyncInstaller>,
        tokens: Arc<TokenService>,
        cipher: Arc<TokenCipher>,
        wait_ready_timeout: Duration,
    ) -> Self {
        Self {
            pool,
            supabase,
            installer,
            tokens,
            cipher,
            wait_ready_timeout,
        }
    }

    /// Create the managed project and the local FSM row. The generated
    /// database password is transmitted to the control plane exactly once and
    /// stored only encrypted.
    pub async fn start_provisioning(
        &self,
        stripe_account_id: &str,
    ) -> Result<ProvisionedDatabase> {
        let password = crypto::random_password(DB_PASSWORD_LEN);
        let db_password_ct = self
            .cipher
            .encrypt(&password)
            .context("Failed to encrypt database password")?;

        let project = self
            .supabase
            .create_project(&project_name(stripe_account_id), &password)
            .await
            .context("Failed to create managed project")?;
        let region = project
            .region
            .unwrap_or_else(|| self.supabase.region().to_string());

        let row = provisioned_databases::insert(
            &self.pool,
            &provisioned_databases::NewProvisionedDatabase {
                stripe_account_id: stripe_account_id.to_string(),
                project_ref: project.id,
                db_password_ct,
                connection_host: supabase::pooler_host(&region),
                region,
            },
        )
        .await?;

        tracing::info!(
            account = %stripe_account_id,
            project_ref = %row.project_ref,
            "created managed project, install pending"
        );
        Ok(row)
    }

    /// Run one tick for the account. `Busy` means another invocation holds
    /// the lock; nothing was read or written.
    pub async fn tick(&self, stripe_account_id: &str) -> Result<LockOutcome<()>> {
        db::with_tenant_lock(&self.pool, stripe_account_id, || {
            self.advance(stripe_account_id)
        })
        .await
    }

    async fn advance(&self, stripe_account_id: &str) -> Result<()> {
        let Some(row) = provisioned_databases::get(&self.pool, stripe_account_id).await? else {
            return Ok(());
        };

        match plan_tick(&row.install_status, row.install_step) {
            TickAction::Noop => Ok(()),
            TickAction::Advance(step) => self.write_step(stripe_account_id, step).await,
            TickAction::ProbeDatabase => self.probe_database(&row).await,
            TickAction::RunSyncInstall => self.run_sync_install(&row).await,
            TickAction::SettleSync => {
                if state_machine::sync_settled(row.updated_at, Utc::now()) {
                    self.write_step(stripe_account_id, InstallStep::Done).await
                } else {
                    Ok(())
                }
            }
        }
    }

    async fn write_step(&self, stripe_account_id: &str, step: InstallStep) -> Result<()> {
        provisioned_databases::set_state(
            &self.pool,
            stripe_account_id,
            status_for_step(step),
            Some(step),
            None,
        )
        .await?;
        tracing::info!(account = %stripe_account_id, step = %step, "install advanced");
        Ok(())
    }

    async fn probe_database(&self, row: &ProvisionedDatabase) -> Result<()> {
        match self
            .supabase
            .run_query(&row.project_ref, READINESS_PROBE_SQL)
            .await
        {
            Ok(rows) if schema_visible(&rows) => {
                self.write_step(&row.stripe_account_id, InstallStep::ApplySchema)
                    .await
            }
            Ok(_) => self.probe_missed(row, "schema not yet visible").await,
            Err(e) if e.is_auth() => {
                self.fail(row, &format!("control plane rejected credentials: {e}"))
                    .await
            }
            Err(e) => self.probe_missed(row, &e.to_string()).await,
        }
    }

    /// The database is not ready yet. Stay put unless the wall-clock budget
    /// for this state has run out.
    async fn probe_missed(&self, row: &ProvisionedDatabase, detail: &str) -> Result<()> {
        if state_machine::wait_deadline_exceeded(row.updated_at, Utc::now(), self.wait_ready_timeout)
        {
            let waited = self.wait_ready_timeout.num_seconds();
            self.fail(
                row,
                &format!("timed out waiting for database to become ready after {waited}s"),
            )
            .await
        } else {
            tracing::debug!(
                project_ref = %row.project_ref,
                detail = %redact::sanitize(detail),
                "database not ready yet"
            );
            Ok(())
        }
    }

    /// The one tick that needs a tenant access token: refresh it, invoke the
    /// installer once, and either move on to the settle window or park the
    /// row in `error` for an explicit user retry.
    async fn run_sync_install(&self, row: &ProvisionedDatabase) -> Result<()> {
        let access_token = match self
            .tokens
            .get_fresh_access_preferring_live(&row.stripe_account_id)
            .await
        {
            Ok(token) => token,
            Err(e) => {
                return self
                    .fail(row, &format!("could not obtain a platform access token: {e}"))
                    .await;
            }
        };

        match self.installer.install(&access_token).await {
            Ok(()) => {
                self.write_step(&row.stripe_account_id, InstallStep::VerifySync)
                    .await
            }
            Err(e) => self.fail(row, &format!("sync install failed: {e:#}")).await,
        }
    }

    /// Park the row in the terminal error state with a sanitized message.
    async fn fail(&self, row: &ProvisionedDatabase, message: &str) -> Result<()> {
        let sanitized = redact::sanitize(message);
        tracing::warn!(
            account = %row.stripe_account_id,
            message = %sanitized,
            "install failed"
        );
        provisioned_databases::set_state(
            &self.pool,
            &row.stripe_account_id,
            InstallStatus::Error,
            row.install_step,
            Some(&sanitized),
        )
        .await?;
        Ok(())
    }

    /// Tear down: delete the managed project first, then the local row, under
    /// the tenant lock. A control-plane failure (404 included) keeps the
    /// row, because a dangling row is recoverable and an orphaned project is
    /// not.
    pub async fn deprovision(
        &self,
        stripe_account_id: &str,
    ) -> Result<LockOutcome<DeprovisionOutcome>> {
        db::with_tenant_lock(&self.pool, stripe_account_id, || async move {
            let Some(row) = provisioned_databases::get(&self.pool, stripe_account_id).await?
            else {
                return Ok(DeprovisionOutcome::NotProvisioned);
            };

            self.supabase
                .delete_project(&row.project_ref)
                .await
                .with_context(|| {
                    format!("Failed to delete managed project {}", row.project_ref)
                })?;
            provisioned_databases::delete(&self.pool, stripe_account_id).await?;

            tracing::info!(
                account = %stripe_account_id,
                project_ref = %row.project_ref,
                "deprovisioned"
            );
            Ok(DeprovisionOutcome::Deleted)
        })
        .await
    }
}

fn project_name(stripe_account_id: &str) -> String {
    format!("stripe-sync-{stripe_account_id}")
}

fn schema_visible(rows: &serde_json::Value) -> bool {
    rows.as_array()
        .map(|rows| {
            rows.iter()
                .any(|row| row.get("schema_name").and_then(|v| v.as_str()) == Some("stripe"))
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn schema_visibility_requires_the_stripe_row() {
        assert!(schema_visible(&json!([{"schema_name": "stripe"}])));
        assert!(schema_visible(&json!([
            {"schema_name": "public"},
            {"schema_name": "stripe"}
        ])));
        assert!(!schema_visible(&json!([])));
        assert!(!schema_visible(&json!([{"schema_name": "public"}])));
        assert!(!schema_visible(&json!({"rows": []})));
        assert!(!schema_visible(&json!(null)));
    }

    #[test]
    fn project_names_embed_the_account() {
        assert_eq!(project_name("acct_X"), "stripe-sync-acct_X");
    }
}
