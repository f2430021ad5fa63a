use anyhow::{Context, Result};
use sqlx::PgPool;

use crate::db::models::{InstallStatus, InstallStep, ProvisionedDatabase};

const PROVISION_COLUMNS: &str = "stripe_account_id, project_ref, db_password_ct, \
    connection_host, region, install_status, install_step, error_message, \
    created_at, updated_at";

/// Payload for [`insert`]; the row starts at `pending` / `create_project`.
#[derive(Debug)]
pub struct NewProvisionedDatabase {
    pub stripe_account_id: String,
    pub project_ref: String,
    pub db_password_ct: String,
    pub connection_host: String,
    pub region: String,
}

pub async fn insert(pool: &PgPool, input: &NewProvisionedDatabase) -> Result<ProvisionedDatabase> {
    let query = format!(
        "INSERT INTO provisioned_databases
            (stripe_account_id, project_ref, db_password_ct, connection_host, region,
             install_status, install_step)
         VALUES ($1, $2, $3, $4, $5, $6, $7)
         RETURNING {PROVISION_COLUMNS}"
    );
    let row = sqlx::query_as::<_, ProvisionedDatabase>(&query)
        .bind(&input.stripe_account_id)
        .bind(&input.project_ref)
        .bind(&input.db_password_ct)
        .bind(&input.connection_host)
        .bind(&input.region)
        .bind(InstallStatus::Pending)
        .bind(InstallStep::CreateProject)
        .fetch_one(pool)
        .await
        .context("Failed to insert provisioned database row")?;
    Ok(row)
}

pub async fn get(pool: &PgPool, stripe_account_id: &str) -> Result<Option<ProvisionedDatabase>> {
    let query = format!(
        "SELECT {PROVISION_COLUMNS} FROM provisioned_databases WHERE stripe_account_id = $1"
    );
    let row = sqlx::query_as::<_, ProvisionedDatabase>(&query)
        .bind(stripe_account_id)
        .fetch_optional(pool)
        .await
        .context("Failed to get provisioned database row")?;
    Ok(row)
}

/// Write a state transition. Every call stamps `updated_at`, which the engine
/// reads back as "when this state was entered" for its wall-clock timeouts.
pub async fn set_state(
    pool: &PgPool,
    stripe_account_id: &str,
    status: InstallStatus,
    step: Option<InstallStep>,
    error_message: Option<&str>,
) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE provisioned_databases
         SET install_status = $2,
             install_step = $3,
             error_message = $4,
             updated_at = NOW()
         WHERE stripe_account_id = $1",
    )
    .bind(stripe_account_id)
    .bind(status)
    .bind(step)
    .bind(error_message)
    .execute(pool)
    .await
    .context("Failed to update provisioning state")?;
    Ok(result.rows_affected() > 0)
}

pub async fn delete(pool: &PgPool, stripe_account_id: &str) -> Result<bool> {
    let result = sqlx::query("DELETE FROM provisioned_databases WHERE stripe_account_id = $1")
        .bind(stripe_account_id)
        .execute(pool)
        .await
        .context("Failed to delete provisioned database row")?;
    Ok(result.rows_affected() > 0)
}
