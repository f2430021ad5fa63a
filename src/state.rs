use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::PgPool;

use crate::crypto::TokenCipher;
use crate::db;
use crate::oauth::tokens::TokenService;
use crate::provision::engine::ProvisionEngine;
use crate::settings::Settings;
use crate::stripe::{self, ModeCredentials, StripeOAuthClient, StripeOAuthConfig};
use crate::supabase::{self, SupabaseClient};
use crate::sync::{self, SyncInstaller, WebhookSyncInstaller, WebhookSyncInstallerConfig};

/// Everything a handler needs, built once at startup and cloned per request.
/// The pool and cipher are effectively process globals: initialized here,
/// immutable afterwards.
#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub db_pool: PgPool,
    pub cipher: Arc<TokenCipher>,
    pub stripe: Arc<StripeOAuthClient>,
    pub tokens: Arc<TokenService>,
    pub engine: Arc<ProvisionEngine>,
}

impl AppState {
    pub async fn new(settings: &Settings) -> Result<Self> {
        let db_pool = db::connect(&settings.database_url).await?;
        Self::run_migrations(&db_pool).await?;

        let cipher = Arc::new(
            TokenCipher::from_hex_key(&settings.encryption_key)
                .context("Invalid ENCRYPTION_KEY")?,
        );

        let http = reqwest::Client::new();

        let stripe_client = Arc::new(StripeOAuthClient::new(StripeOAuthConfig {
            http: http.clone(),
            token_url: settings
                .stripe_token_url
                .clone()
                .unwrap_or_else(|| stripe::DEFAULT_TOKEN_URL.to_string()),
            authorize_url: settings
                .stripe_authorize_url
                .clone()
                .unwrap_or_else(|| stripe::DEFAULT_AUTHORIZE_URL.to_string()),
            redirect_uri: settings.redirect_uri(),
            test: ModeCredentials {
                client_id: settings.stripe_app_client_id_test.clone(),
                secret_key: settings.stripe_secret_key_test.clone(),
            },
            live: ModeCredentials {
                client_id: settings.stripe_app_client_id_live.clone(),
                secret_key: settings.stripe_secret_key_live.clone(),
            },
        }));

        let supabase_client = Arc::new(SupabaseClient::new(
            http.clone(),
            settings
                .supabase_api_url
                .clone()
                .unwrap_or_else(|| supabase::DEFAULT_API_URL.to_string()),
            settings.supabase_access_token.clone(),
            settings.supabase_organization_id.clone(),
            settings.supabase_region.clone(),
        ));

        let installer: Arc<dyn SyncInstaller> =
            Arc::new(WebhookSyncInstaller::new(WebhookSyncInstallerConfig {
                http,
                api_url: settings
                    .stripe_api_url
                    .clone()
                    .unwrap_or_else(|| stripe::DEFAULT_API_URL.to_string()),
                webhook_url: settings.sync_webhook_url(),
                api_version: settings
                    .sync_stripe_api_version
                    .clone()
                    .unwrap_or_else(|| sync::DEFAULT_API_VERSION.to_string()),
                // One attempt per tick: the state machine owns retry policy.
                max_attempts: 1,
                initial_backoff: Duration::from_secs(5),
            }));

        let tokens = Arc::new(TokenService::new(
            db_pool.clone(),
            cipher.clone(),
            stripe_client.clone(),
        ));

        let engine = Arc::new(ProvisionEngine::new(
            db_pool.clone(),
            supabase_client,
            installer,
            tokens.clone(),
            cipher.clone(),
            settings.wait_ready_timeout(),
        ));

        Ok(Self {
            settings: Arc::new(settings.clone()),
            db_pool,
            cipher,
            stripe: stripe_client,
            tokens,
            engine,
        })
    }

    async fn run_migrations(pool: &PgPool) -> Result<()> {
        tracing::info!("running database migrations");
        sqlx::migrate!("./migrations")
            .run(pool)
            .await
            .context("Failed to run migrations")?;
        Ok(())
    }
}
