//! Process configuration. Values come from an optional `config/default`
//! file merged with environment variables (unprefixed, so the deployment
//! names map one-to-one: `DATABASE_URL`, `ENCRYPTION_KEY`, …).
//!
//! The database URL, the encryption key, the public base URL and the
//! control-plane credentials are hard requirements and fail startup loudly. Per-mode
//! platform credentials and signing secrets stay optional: a request needing
//! a missing one is a 500 at use time, so a test-mode-only deployment works.

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::db::models::StripeMode;

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_supabase_region() -> String {
    crate::supabase::DEFAULT_REGION.to_string()
}

fn default_wait_ready_timeout_ms() -> u64 {
    600_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub database_url: String,
    /// 32 bytes, hex encoded. Shared with the sweeper binary so both sides
    /// read the same ciphertexts.
    #[serde(default)]
    pub encryption_key: String,
    /// Public URL of this backend; redirect URIs are derived from it.
    #[serde(default)]
    pub base_url: String,

    #[serde(default)]
    pub stripe_secret_key_test: Option<String>,
    #[serde(default)]
    pub stripe_secret_key_live: Option<String>,
    #[serde(default)]
    pub stripe_app_client_id_test: Option<String>,
    #[serde(default)]
    pub stripe_app_client_id_live: Option<String>,
    /// Comma-separated list; more than one entry while a secret rotates.
    #[serde(default)]
    pub stripe_app_signing_secret: Option<String>,

    #[serde(default)]
    pub stripe_token_url: Option<String>,
    #[serde(default)]
    pub stripe_authorize_url: Option<String>,
    #[serde(default)]
    pub stripe_api_url: Option<String>,

    #[serde(default)]
    pub supabase_access_token: String,
    #[serde(default)]
    pub supabase_organization_id: String,
    #[serde(default = "default_supabase_region")]
    pub supabase_region: String,
    #[serde(default)]
    pub supabase_api_url: Option<String>,

    #[serde(default = "default_wait_ready_timeout_ms")]
    pub provisioning_wait_database_ready_timeout_ms: u64,

    /// Where webhook endpoints created by the sync installer deliver events.
    /// Defaults to the sync pipeline's ingestion route under `base_url`.
    #[serde(default)]
    pub sync_webhook_url: Option<String>,
    /// Platform API version pinned on created webhook endpoints.
    #[serde(default)]
    pub sync_stripe_api_version: Option<String>,
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let settings: Settings = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(Environment::default())
            .build()?
            .try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.database_url.is_empty() {
            return Err(ConfigError::Message(
                "DATABASE_URL is required".to_string(),
            ));
        }
        let key_len = hex::decode(self.encryption_key.trim())
            .map(|key| key.len())
            .unwrap_or(0);
        if key_len != 32 {
            return Err(ConfigError::Message(
                "ENCRYPTION_KEY must be 64 hex characters (32 bytes). Generate with: openssl rand -hex 32"
                    .to_string(),
            ));
        }
        if self.base_url.is_empty() {
            return Err(ConfigError::Message("BASE_URL is required".to_string()));
        }
        if self.supabase_access_token.is_empty() || self.supabase_organization_id.is_empty() {
            return Err(ConfigError::Message(
                "SUPABASE_ACCESS_TOKEN and SUPABASE_ORGANIZATION_ID are required".to_string(),
            ));
        }
        Ok(())
    }

    /// All currently accepted signing secrets, oldest first.
    pub fn signing_secrets(&self) -> Vec<String> {
        self.stripe_app_signing_secret
            .as_deref()
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }

    pub fn stripe_secret_key(&self, mode: StripeMode) -> Option<&str> {
        match mode {
            StripeMode::Test => self.stripe_secret_key_test.as_deref(),
            StripeMode::Live => self.stripe_secret_key_live.as_deref(),
        }
    }

    pub fn stripe_client_id(&self, mode: StripeMode) -> Option<&str> {
        match mode {
            StripeMode::Test => self.stripe_app_client_id_test.as_deref(),
            StripeMode::Live => self.stripe_app_client_id_live.as_deref(),
        }
    }

    pub fn redirect_uri(&self) -> String {
        format!("{}/oauth/callback", self.base_url.trim_end_matches('/'))
    }

    pub fn sync_webhook_url(&self) -> String {
        self.sync_webhook_url.clone().unwrap_or_else(|| {
            format!("{}/api/webhooks", self.base_url.trim_end_matches('/'))
        })
    }

    pub fn wait_ready_timeout(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.provisioning_wait_database_ready_timeout_ms as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_settings() -> Settings {
        Settings {
            host: default_host(),
            port: default_port(),
            database_url: "postgres://app@db/app".to_string(),
            encryption_key: hex::encode([1u8; 32]),
            base_url: "https://sync.example.com/".to_string(),
            stripe_secret_key_test: Some("sk_test_1".to_string()),
            stripe_secret_key_live: None,
            stripe_app_client_id_test: Some("ca_test_1".to_string()),
            stripe_app_client_id_live: None,
            stripe_app_signing_secret: None,
            stripe_token_url: None,
            stripe_authorize_url: None,
            stripe_api_url: None,
            supabase_access_token: "sbp_token".to_string(),
            supabase_organization_id: "org_1".to_string(),
            supabase_region: default_supabase_region(),
            supabase_api_url: None,
            provisioning_wait_database_ready_timeout_ms: default_wait_ready_timeout_ms(),
            sync_webhook_url: None,
            sync_stripe_api_version: None,
        }
    }

    #[test]
    fn valid_settings_pass() {
        assert!(valid_settings().validate().is_ok());
    }

    #[test]
    fn missing_requirements_fail_validation() {
        let mut settings = valid_settings();
        settings.database_url.clear();
        assert!(settings.validate().is_err());

        let mut settings = valid_settings();
        settings.encryption_key = "deadbeef".to_string();
        assert!(settings.validate().is_err());

        let mut settings = valid_settings();
        settings.encryption_key = "zz".repeat(32);
        assert!(settings.validate().is_err());

        let mut settings = valid_settings();
        settings.base_url.clear();
        assert!(settings.validate().is_err());

        let mut settings = valid_settings();
        settings.supabase_access_token.clear();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn signing_secrets_split_and_trim() {
        let mut settings = valid_settings();
        assert!(settings.signing_secrets().is_empty());

        settings.stripe_app_signing_secret = Some("whsec_a".to_string());
        assert_eq!(settings.signing_secrets(), vec!["whsec_a"]);

        settings.stripe_app_signing_secret = Some(" whsec_a, whsec_b ,,".to_string());
        assert_eq!(settings.signing_secrets(), vec!["whsec_a", "whsec_b"]);
    }

    #[test]
    fn derived_urls_normalize_trailing_slash() {
        let settings = valid_settings();
        assert_eq!(
            settings.redirect_uri(),
            "https://sync.example.com/oauth/callback"
        );
        assert_eq!(
            settings.sync_webhook_url(),
            "https://sync.example.com/api/webhooks"
        );
    }

    #[test]
    fn per_mode_credentials_resolve() {
        let settings = valid_settings();
        assert_eq!(settings.stripe_secret_key(StripeMode::Test), Some("sk_test_1"));
        assert_eq!(settings.stripe_secret_key(StripeMode::Live), None);
        assert_eq!(settings.stripe_client_id(StripeMode::Test), Some("ca_test_1"));
    }

    #[test]
    fn wait_timeout_converts_from_millis() {
        let settings = valid_settings();
        assert_eq!(settings.wait_ready_timeout().num_seconds(), 600);
    }
}
