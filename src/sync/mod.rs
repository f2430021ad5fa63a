//! Seam for the sync installer: the collaborator that wires a connected
//! account up to the event-sync pipeline.
//!
//! The provisioning engine only ever sees the [`SyncInstaller`] trait with a
//! single `install(access_token)` entrypoint. The shipped implementation
//! registers a webhook endpoint on the connected account directly against the
//! platform API, with the API version pinned as first-class configuration:
//! events must arrive in a schema the sync pipeline was built for, regardless
//! of the account's default version.

use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use reqwest::{Client as HttpClient, StatusCode};

/// API version pinned on created webhook endpoints.
pub const DEFAULT_API_VERSION: &str = "2024-06-20";

/// Events the sync pipeline consumes.
pub const ENABLED_EVENTS: &[&str] = &[
    "charge.captured",
    "charge.failed",
    "charge.refunded",
    "charge.succeeded",
    "customer.created",
    "customer.deleted",
    "customer.updated",
    "customer.subscription.created",
    "customer.subscription.deleted",
    "customer.subscription.updated",
    "invoice.created",
    "invoice.finalized",
    "invoice.paid",
    "invoice.payment_failed",
    "invoice.updated",
    "payment_intent.succeeded",
    "price.created",
    "price.updated",
    "product.created",
    "product.updated",
];

#[async_trait]
pub trait SyncInstaller: Send + Sync {
    /// Install the sync artifacts on the connected account. The access token
    /// is used for this call only and never stored.
    async fn install(&self, access_token: &str) -> Result<()>;
}

/// What one installation attempt produced.
#[derive(Debug, PartialEq, Eq)]
enum AttemptOutcome {
    Installed,
    /// Worth another attempt if the budget allows: the platform was
    /// unreachable, overloaded, or rate limiting.
    Retry(String),
    /// Another attempt would fail the same way; give up now.
    Abort(String),
}

/// Classify the platform's answer to a webhook-endpoint creation.
fn classify_attempt(status: StatusCode) -> AttemptOutcome {
    if status.is_success() {
        return AttemptOutcome::Installed;
    }
    let message = format!(
        "webhook endpoint creation returned status {}",
        status.as_u16()
    );
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        AttemptOutcome::Retry(message)
    } else {
        AttemptOutcome::Abort(message)
    }
}

/// Delay before the attempt after `failed_attempts` failures: the initial
/// backoff, doubled each round (5 s, 10 s, 20 s, …).
fn backoff_delay(initial: Duration, failed_attempts: u32) -> Duration {
    initial.saturating_mul(2u32.saturating_pow(failed_attempts.saturating_sub(1)))
}

pub struct WebhookSyncInstallerConfig {
    pub http: HttpClient,
    /// Platform API base.
    pub api_url: String,
    /// Where the created webhook endpoint delivers events.
    pub webhook_url: String,
    pub api_version: String,
    /// Attempt budget per `install` call. The provisioning engine passes 1 so
    /// control returns to the state machine quickly; a standalone caller may
    /// allow more.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
}

pub struct WebhookSyncInstaller {
    http: HttpClient,
    api_url: String,
    webhook_url: String,
    api_version: String,
    max_attempts: u32,
    initial_backoff: Duration,
}

impl WebhookSyncInstaller {
    pub fn new(config: WebhookSyncInstallerConfig) -> Self {
        Self {
            http: config.http,
            api_url: config.api_url,
            webhook_url: config.webhook_url,
            api_version: config.api_version,
            max_attempts: config.max_attempts.max(1),
            initial_backoff: config.initial_backoff,
        }
    }

    async fn create_webhook_endpoint(&self, access_token: &str) -> AttemptOutcome {
        let mut form: Vec<(String, String)> = vec![
            ("url".to_string(), self.webhook_url.clone()),
            ("api_version".to_string(), self.api_version.clone()),
        ];
        for (i, event) in ENABLED_EVENTS.iter().enumerate() {
            form.push((format!("enabled_events[{i}]"), (*event).to_string()));
        }

        let response = match self
            .http
            .post(format!("{}/v1/webhook_endpoints", self.api_url))
            .bearer_auth(access_token)
            .form(&form)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => return AttemptOutcome::Retry(format!("request failed: {e}")),
        };

        classify_attempt(response.status())
    }
}

#[async_trait]
impl SyncInstaller for WebhookSyncInstaller {
    async fn install(&self, access_token: &str) -> Result<()> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.create_webhook_endpoint(access_token).await {
                AttemptOutcome::Installed => {
                    tracing::info!(attempt, "sync installer registered webhook endpoint");
                    return Ok(());
                }
                AttemptOutcome::Retry(message) if attempt < self.max_attempts => {
                    let delay = backoff_delay(self.initial_backoff, attempt);
                    tracing::warn!(
                        attempt,
                        %message,
                        delay_secs = delay.as_secs(),
                        "sync install attempt failed, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                AttemptOutcome::Retry(message) | AttemptOutcome::Abort(message) => {
                    bail!("sync install failed: {message}");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classify(status: u16) -> AttemptOutcome {
        classify_attempt(StatusCode::from_u16(status).unwrap())
    }

    #[test]
    fn success_statuses_install() {
        assert_eq!(classify(200), AttemptOutcome::Installed);
        assert_eq!(classify(201), AttemptOutcome::Installed);
    }

    #[test]
    fn server_errors_are_retriable() {
        for status in [500, 502, 503, 504] {
            match classify(status) {
                AttemptOutcome::Retry(message) => {
                    assert!(message.contains(&status.to_string()));
                }
                other => panic!("{status} classified as {other:?}"),
            }
        }
    }

    #[test]
    fn rate_limiting_is_retriable() {
        assert!(matches!(classify(429), AttemptOutcome::Retry(_)));
    }

    #[test]
    fn client_errors_abort() {
        // A bad token or a rejected parameter will not get better by waiting.
        for status in [400, 401, 403, 404, 422] {
            match classify(status) {
                AttemptOutcome::Abort(message) => {
                    assert!(message.contains(&status.to_string()));
                }
                other => panic!("{status} classified as {other:?}"),
            }
        }
    }

    #[test]
    fn backoff_doubles_per_failed_attempt() {
        let initial = Duration::from_secs(5);
        assert_eq!(backoff_delay(initial, 1), Duration::from_secs(5));
        assert_eq!(backoff_delay(initial, 2), Duration::from_secs(10));
        assert_eq!(backoff_delay(initial, 3), Duration::from_secs(20));
        assert_eq!(backoff_delay(initial, 4), Duration::from_secs(40));
    }

    #[test]
    fn backoff_does_not_overflow() {
        let initial = Duration::from_secs(5);
        // Far beyond any sane attempt budget; must clamp, not panic.
        let delay = backoff_delay(initial, 200);
        assert!(delay >= backoff_delay(initial, 199));
    }

    #[test]
    fn attempt_budget_floor_is_one() {
        let installer = WebhookSyncInstaller::new(WebhookSyncInstallerConfig {
            http: HttpClient::new(),
            api_url: "https://api.example.com".to_string(),
            webhook_url: "https://sync.example.com/api/webhooks".to_string(),
            api_version: DEFAULT_API_VERSION.to_string(),
            max_attempts: 0,
            initial_backoff: Duration::from_secs(5),
        });
        assert_eq!(installer.max_attempts, 1);
    }
}
