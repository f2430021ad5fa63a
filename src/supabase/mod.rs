//! Thin client for the Supabase management API: create a project, run SQL
//! against it, delete it. Anything outside 2xx is surfaced as
//! [`SupabaseError::Upstream`] with the status attached, including 404 on
//! delete, because silently dropping a local row while the managed project
//! lives on is worse than a loud error.

use reqwest::Client as HttpClient;
use serde::Deserialize;
use thiserror::Error;

pub const DEFAULT_API_URL: &str = "https://api.supabase.com";
pub const DEFAULT_REGION: &str = "us-east-1";

#[derive(Debug, Error)]
pub enum SupabaseError {
    #[error("control plane returned {status}: {body}")]
    Upstream { status: u16, body: String },
    #[error("control plane request failed: {0}")]
    Transport(String),
}

impl SupabaseError {
    /// True for 401/403: our control-plane credentials are bad, retrying is
    /// pointless.
    pub fn is_auth(&self) -> bool {
        matches!(
            self,
            SupabaseError::Upstream {
                status: 401 | 403,
                ..
            }
        )
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreatedProject {
    pub id: String,
    #[serde(default)]
    pub region: Option<String>,
}

pub struct SupabaseClient {
    http: HttpClient,
    api_url: String,
    access_token: String,
    organization_id: String,
    region: String,
}

impl SupabaseClient {
    pub fn new(
        http: HttpClient,
        api_url: String,
        access_token: String,
        organization_id: String,
        region: String,
    ) -> Self {
        Self {
            http,
            api_url,
            access_token,
            organization_id,
            region,
        }
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    /// Create a managed project. The plaintext database password crosses the
    /// wire exactly once, here.
    pub async fn create_project(
        &self,
        name: &str,
        db_password: &str,
    ) -> Result<CreatedProject, SupabaseError> {
        let response = self
            .http
            .post(format!("{}/v1/projects", self.api_url))
            .bearer_auth(&self.access_token)
            .json(&serde_json::json!({
                "name": name,
                "organization_id": self.organization_id,
                "region": self.region,
                "db_pass": db_password,
            }))
            .send()
            .await
            .map_err(transport)?;

        let response = check_status(response).await?;
        response
            .json::<CreatedProject>()
            .await
            .map_err(|e| SupabaseError::Transport(format!("invalid project response: {e}")))
    }

    /// Run SQL against a project's database and return the result rows of the
    /// final statement as JSON.
    pub async fn run_query(
        &self,
        project_ref: &str,
        sql: &str,
    ) -> Result<serde_json::Value, SupabaseError> {
        let response = self
            .http
            .post(format!(
                "{}/v1/projects/{}/database/query",
                self.api_url, project_ref
            ))
            .bearer_auth(&self.access_token)
            .json(&serde_json::json!({ "query": sql }))
            .send()
            .await
            .map_err(transport)?;

        let response = check_status(response).await?;
        response
            .json::<serde_json::Value>()
            .await
            .map_err(|e| SupabaseError::Transport(format!("invalid query response: {e}")))
    }

    pub async fn delete_project(&self, project_ref: &str) -> Result<(), SupabaseError> {
        let response = self
            .http
            .delete(format!("{}/v1/projects/{}", self.api_url, project_ref))
            .bearer_auth(&self.access_token)
            .send()
            .await
            .map_err(transport)?;

        check_status(response).await?;
        Ok(())
    }
}

fn transport(e: reqwest::Error) -> SupabaseError {
    SupabaseError::Transport(e.to_string())
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, SupabaseError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(SupabaseError::Upstream {
        status: status.as_u16(),
        body,
    })
}

/// Pooler hostname for a region. The exact pattern is part of the persisted
/// contract: connection strings handed to users are built from it.
pub fn pooler_host(region: &str) -> String {
    format!("aws-1-{region}.pooler.supabase.com")
}

/// Materialize the user-facing connection string for a ready database.
pub fn connection_string(project_ref: &str, db_password: &str, host: &str) -> String {
    format!("postgresql://postgres.{project_ref}:{db_password}@{host}:5432/postgres")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pooler_host_follows_region() {
        assert_eq!(pooler_host("us-east-1"), "aws-1-us-east-1.pooler.supabase.com");
        assert_eq!(pooler_host("eu-west-2"), "aws-1-eu-west-2.pooler.supabase.com");
    }

    #[test]
    fn connection_string_shape() {
        assert_eq!(
            connection_string("ref_123", "pw", "aws-1-us-east-1.pooler.supabase.com"),
            "postgresql://postgres.ref_123:pw@aws-1-us-east-1.pooler.supabase.com:5432/postgres"
        );
    }

    #[test]
    fn auth_statuses_are_fatal() {
        for status in [401, 403] {
            assert!(SupabaseError::Upstream {
                status,
                body: String::new()
            }
            .is_auth());
        }
        for status in [404, 429, 500] {
            assert!(!SupabaseError::Upstream {
                status,
                body: String::new()
            }
            .is_auth());
        }
        assert!(!SupabaseError::Transport("timeout".into()).is_auth());
    }
}
