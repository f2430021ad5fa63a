//! One-shot token sweep for external schedulers: select near-expiry
//! connections, refresh them with rotation, print a redacted summary as JSON
//! and exit. `SWEEP_FORCE_ALL=1` widens the selection to every stored
//! connection; `SWEEP_DRY_RUN=1` reports what would happen without touching
//! upstream or the vault.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use stripe_sync_backend::crypto::TokenCipher;
use stripe_sync_backend::db;
use stripe_sync_backend::oauth::tokens::TokenService;
use stripe_sync_backend::settings::Settings;
use stripe_sync_backend::stripe::{
    self, ModeCredentials, StripeOAuthClient, StripeOAuthConfig,
};
use stripe_sync_backend::sweeper::{run_sweep, SweepOptions};

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let settings = Settings::new().context("Failed to load configuration")?;
    let pool = db::connect(&settings.database_url).await?;

    let cipher = Arc::new(
        TokenCipher::from_hex_key(&settings.encryption_key).context("Invalid ENCRYPTION_KEY")?,
    );
    let stripe_client = Arc::new(StripeOAuthClient::new(StripeOAuthConfig {
        http: reqwest::Client::new(),
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
    let tokens = Arc::new(TokenService::new(pool.clone(), cipher, stripe_client));

    let options = SweepOptions {
        force_all: env_flag("SWEEP_FORCE_ALL"),
        dry_run: env_flag("SWEEP_DRY_RUN"),
    };
    let summary = run_sweep(&pool, tokens, options).await?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
