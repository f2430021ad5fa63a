//! Dashboard-facing endpoints. Every handler here authenticates the caller
//! through the request signature and indexes vault and FSM state by the
//! cryptographically verified account id only, never by a bare
//! client-supplied value.
//!
//! Error bodies carry short machine-readable codes; the dashboard turns them
//! into copy.

use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::crypto::signature::{self, SignatureError, VerifiedCaller};
use crate::db::models::{InstallStatus, ProvisionedDatabase};
use crate::db::{oauth_connections, provisioned_databases, LockOutcome};
use crate::error::{ApiError, ErrorCode};
use crate::provision::engine::DeprovisionOutcome;
use crate::provision::state_machine;
use crate::state::AppState;
use crate::supabase;

#[derive(Debug, Deserialize)]
pub struct DashboardQuery {
    pub user_id: Option<String>,
    pub account_id: Option<String>,
    pub livemode: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct DashboardBody {
    pub user_id: Option<String>,
    pub account_id: Option<String>,
}

fn verified_caller(
    state: &AppState,
    headers: &HeaderMap,
    user_id: Option<&str>,
    account_id: Option<&str>,
) -> Result<VerifiedCaller, ApiError> {
    let (Some(user_id), Some(account_id)) = (user_id, account_id) else {
        return Err(ApiError::bad_request("missing_identifiers"));
    };
    let header = headers
        .get(signature::SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok());

    signature::verify(
        header,
        user_id,
        account_id,
        &state.settings.signing_secrets(),
        Utc::now(),
        signature::DEFAULT_TOLERANCE_SECS,
    )
    .map_err(|e| match e {
        SignatureError::Misconfigured => ApiError::internal("signing_not_configured"),
        SignatureError::MissingIdentifiers => ApiError::bad_request("missing_identifiers"),
        SignatureError::MissingHeader => ApiError::unauthorized("missing_signature"),
        SignatureError::InvalidSignature => ApiError::unauthorized("invalid_signature"),
    })
}

/// 401 unless the account holds a stored connection. Distinguishes "never
/// connected" from "connected, but not in the requested mode" for UI copy.
async fn ensure_connected(
    state: &AppState,
    account_id: &str,
    livemode: Option<bool>,
) -> Result<(), ApiError> {
    let connections = oauth_connections::list_for_account(&state.db_pool, account_id).await?;
    if connections.is_empty() {
        return Err(ApiError::unauthorized("never_connected"));
    }
    if let Some(livemode) = livemode {
        if !connections.iter().any(|c| c.livemode == livemode) {
            return Err(ApiError::unauthorized("mode_mismatch"));
        }
    }
    Ok(())
}

/// The uniform progress record every dashboard endpoint returns. The
/// connection string exists only once the install is ready, and is
/// materialized on demand; the password never sits decrypted anywhere.
fn progress_view(state: &AppState, row: &ProvisionedDatabase) -> Result<Value, ApiError> {
    let mut view = json!({
        "status": row.install_status,
        "step": row.install_step,
        "error_message": row.error_message,
        "project_ref": row.project_ref,
        "created_at": row.created_at,
    });
    if row.install_status == InstallStatus::Ready {
        let password = state
            .cipher
            .decrypt(&row.db_password_ct)
            .error_code("password_unreadable")?;
        view["connection_string"] = Value::String(supabase::connection_string(
            &row.project_ref,
            &password,
            &row.connection_host,
        ));
    }
    Ok(view)
}

/// `GET /status`: report install progress, contributing one tick of work
/// when the install is still moving. A tick failure is logged and the last
/// durable state returned; the poll itself never fails because of it.
pub async fn status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<DashboardQuery>,
) -> Result<Json<Value>, ApiError> {
    let caller = verified_caller(
        &state,
        &headers,
        query.user_id.as_deref(),
        query.account_id.as_deref(),
    )?;
    ensure_connected(&state, &caller.account_id, query.livemode).await?;

    let Some(row) = provisioned_databases::get(&state.db_pool, &caller.account_id).await? else {
        return Ok(Json(json!({ "status": "not_provisioned" })));
    };

    if !state_machine::is_terminal(&row.install_status) {
        match state.engine.tick(&caller.account_id).await {
            Ok(LockOutcome::Acquired(())) => {}
            Ok(LockOutcome::Busy) => {
                tracing::debug!(account = %caller.account_id, "tick skipped, lock busy");
            }
            Err(e) => {
                tracing::error!(account = %caller.account_id, error = ?e, "provisioning tick failed");
            }
        }
    }

    let row = provisioned_databases::get(&state.db_pool, &caller.account_id)
        .await?
        .unwrap_or(row);
    Ok(Json(progress_view(&state, &row)?))
}

/// `POST /provision`: idempotent start. An existing live install is
/// returned as-is; an errored one is discarded so the retry starts clean; no
/// row at all kicks off a fresh install and answers 202.
pub async fn provision(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<DashboardBody>,
) -> Result<Response, ApiError> {
    let caller = verified_caller(
        &state,
        &headers,
        body.user_id.as_deref(),
        body.account_id.as_deref(),
    )?;
    ensure_connected(&state, &caller.account_id, None).await?;

    if let Some(row) = provisioned_databases::get(&state.db_pool, &caller.account_id).await? {
        if row.install_status == InstallStatus::Error {
            tracing::info!(account = %caller.account_id, "discarding errored install for retry");
            provisioned_databases::delete(&state.db_pool, &caller.account_id).await?;
        } else {
            return Ok((StatusCode::OK, Json(progress_view(&state, &row)?)).into_response());
        }
    }

    let row = state
        .engine
        .start_provisioning(&caller.account_id)
        .await
        .error_code("provisioning_start_failed")?;
    Ok((StatusCode::ACCEPTED, Json(progress_view(&state, &row)?)).into_response())
}

/// `DELETE /provision`: tear down under the tenant lock. 409 while a tick
/// holds the lock; a control-plane failure aborts with the local row intact.
pub async fn deprovision(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<DashboardQuery>,
) -> Result<Json<Value>, ApiError> {
    let caller = verified_caller(
        &state,
        &headers,
        query.user_id.as_deref(),
        query.account_id.as_deref(),
    )?;

    match state
        .engine
        .deprovision(&caller.account_id)
        .await
        .error_code("deprovision_failed")?
    {
        LockOutcome::Busy => Err(ApiError::conflict("provisioning_in_progress")),
        LockOutcome::Acquired(DeprovisionOutcome::Deleted) => {
            Ok(Json(json!({ "status": "deleted" })))
        }
        LockOutcome::Acquired(DeprovisionOutcome::NotProvisioned) => {
            Ok(Json(json!({ "status": "not_provisioned" })))
        }
    }
}

/// `DELETE /connection`: explicit disconnect. Removes the stored token row
/// for the given mode, or for both modes when none is named.
pub async fn disconnect(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<DashboardQuery>,
) -> Result<Json<Value>, ApiError> {
    let caller = verified_caller(
        &state,
        &headers,
        query.user_id.as_deref(),
        query.account_id.as_deref(),
    )?;

    let deleted = match query.livemode {
        Some(livemode) => u64::from(
            oauth_connections::delete(&state.db_pool, &caller.account_id, livemode).await?,
        ),
        None => oauth_connections::delete_all_for_account(&state.db_pool, &caller.account_id)
            .await?,
    };
    tracing::info!(account = %caller.account_id, deleted, "disconnected");
    Ok(Json(json!({ "deleted": deleted })))
}
