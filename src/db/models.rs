use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Stripe operating mode. Stored as text on `oauth_states`; connections carry
/// it as the `livemode` boolean the platform reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum StripeMode {
    Test,
    Live,
}

impl StripeMode {
    pub fn livemode(self) -> bool {
        matches!(self, StripeMode::Live)
    }

    pub fn from_livemode(livemode: bool) -> Self {
        if livemode {
            StripeMode::Live
        } else {
            StripeMode::Test
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StripeMode::Test => "test",
            StripeMode::Live => "live",
        }
    }
}

impl std::fmt::Display for StripeMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Pending install state. Lives for ten minutes or one redemption, whichever
/// comes first.
#[derive(Debug, Clone, FromRow)]
pub struct OAuthState {
    pub state_hash: String,
    pub mode: StripeMode,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Encrypted token pair for one (account, mode). The `_ct` columns hold AEAD
/// envelopes; plaintext tokens exist only transiently in memory.
#[derive(Debug, Clone, FromRow)]
pub struct OAuthConnection {
    pub stripe_account_id: String,
    pub livemode: bool,
    pub scope: Option<String>,
    pub stripe_publishable_key: Option<String>,
    pub access_token_ct: String,
    pub access_token_expires_at: DateTime<Utc>,
    pub refresh_token_ct: String,
    pub refresh_token_rotated_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OAuthConnection {
    pub fn mode(&self) -> StripeMode {
        StripeMode::from_livemode(self.livemode)
    }
}

/// Coarse install phase, surfaced to the dashboard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum InstallStatus {
    Pending,
    Provisioning,
    Installing,
    Syncing,
    Ready,
    Error,
}

impl std::fmt::Display for InstallStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            InstallStatus::Pending => "pending",
            InstallStatus::Provisioning => "provisioning",
            InstallStatus::Installing => "installing",
            InstallStatus::Syncing => "syncing",
            InstallStatus::Ready => "ready",
            InstallStatus::Error => "error",
        };
        write!(f, "{s}")
    }
}

/// Fine-grained install step the next tick will work on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum InstallStep {
    CreateProject,
    CreateDatabase,
    WaitDatabaseReady,
    ApplySchema,
    VerifyConnection,
    StartSync,
    VerifySync,
    Done,
}

impl std::fmt::Display for InstallStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            InstallStep::CreateProject => "create_project",
            InstallStep::CreateDatabase => "create_database",
            InstallStep::WaitDatabaseReady => "wait_database_ready",
            InstallStep::ApplySchema => "apply_schema",
            InstallStep::VerifyConnection => "verify_connection",
            InstallStep::StartSync => "start_sync",
            InstallStep::VerifySync => "verify_sync",
            InstallStep::Done => "done",
        };
        write!(f, "{s}")
    }
}

/// Provisioning state machine row, one per account. Mutated only by the tick
/// holding that account's advisory lock.
#[derive(Debug, Clone, FromRow)]
pub struct ProvisionedDatabase {
    pub stripe_account_id: String,
    pub project_ref: String,
    pub db_password_ct: String,
    pub connection_host: String,
    pub region: String,
    pub install_status: InstallStatus,
    pub install_step: Option<InstallStep>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_round_trips_through_livemode() {
        assert_eq!(StripeMode::from_livemode(true), StripeMode::Live);
        assert_eq!(StripeMode::from_livemode(false), StripeMode::Test);
        assert!(StripeMode::Live.livemode());
        assert!(!StripeMode::Test.livemode());
    }

    #[test]
    fn enums_serialize_to_wire_names() {
        assert_eq!(
            serde_json::to_string(&InstallStatus::Provisioning).unwrap(),
            "\"provisioning\""
        );
        assert_eq!(
            serde_json::to_string(&InstallStep::WaitDatabaseReady).unwrap(),
            "\"wait_database_ready\""
        );
        assert_eq!(serde_json::to_string(&StripeMode::Test).unwrap(), "\"test\"");
    }
}
