//! HTTP error type for the API surface.
//!
//! An [`ApiError`] is a status plus a short machine-readable code; the code
//! is the whole response body (`{"error":"<code>"}`) and the dashboard maps
//! codes to copy. Failure chains never reach the client: a 5xx stashes its
//! detail in the response extensions as [`FailureDetail`], and the
//! request-id middleware logs it together with the `x-request-id` it minted,
//! so a user reporting an id from a failed call leads straight to the
//! matching log line.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: String,
    source: Option<anyhow::Error>,
}

/// What went wrong with a 5xx response, attached to its extensions for the
/// middleware that owns the request id to log.
#[derive(Debug, Clone)]
pub struct FailureDetail {
    pub code: String,
    pub chain: Option<String>,
}

impl ApiError {
    pub fn new(status: StatusCode, code: impl Into<String>) -> Self {
        Self {
            status,
            code: code.into(),
            source: None,
        }
    }

    /// Attach the underlying failure. It travels to the correlated log line,
    /// never to the client.
    pub fn caused_by(mut self, source: anyhow::Error) -> Self {
        self.source = Some(source);
        self
    }

    pub fn bad_request(code: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, code)
    }

    pub fn unauthorized(code: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, code)
    }

    pub fn conflict(code: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, code)
    }

    pub fn internal(code: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, code)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            let detail = FailureDetail {
                code: self.code.clone(),
                chain: self.source.as_ref().map(|source| format!("{source:#}")),
            };
            let mut response =
                (self.status, Json(json!({ "error": self.code }))).into_response();
            response.extensions_mut().insert(detail);
            response
        } else {
            // Client errors are already logged by the trace layer; the chain,
            // if any, is only interesting when debugging.
            if let Some(source) = &self.source {
                tracing::debug!(code = %self.code, error = ?source, "request error detail");
            }
            (self.status, Json(json!({ "error": self.code }))).into_response()
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::internal("internal_error").caused_by(err)
    }
}

/// Turn any failure into a 500 carrying `code`, keeping the chain for the
/// correlated log line.
pub trait ErrorCode<T> {
    fn error_code(self, code: &'static str) -> Result<T, ApiError>;
}

impl<T, E> ErrorCode<T> for Result<T, E>
where
    E: Into<anyhow::Error>,
{
    fn error_code(self, code: &'static str) -> Result<T, ApiError> {
        self.map_err(|e| ApiError::internal(code).caused_by(e.into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn server_errors_defer_detail_to_the_middleware() {
        let response = ApiError::internal("vault_unreachable")
            .caused_by(anyhow!("pool timed out"))
            .into_response();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let detail = response.extensions().get::<FailureDetail>().unwrap();
        assert_eq!(detail.code, "vault_unreachable");
        assert!(detail.chain.as_deref().unwrap().contains("pool timed out"));
    }

    #[test]
    fn client_errors_carry_no_detail() {
        let response = ApiError::unauthorized("invalid_signature").into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(response.extensions().get::<FailureDetail>().is_none());
    }

    #[test]
    fn error_code_maps_any_failure_to_a_500() {
        let result: Result<(), std::io::Error> = Err(std::io::Error::other("disk gone"));
        let error = result.error_code("snapshot_failed").unwrap_err();
        let response = error.into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let detail = response.extensions().get::<FailureDetail>().unwrap();
        assert_eq!(detail.code, "snapshot_failed");
        assert!(detail.chain.as_deref().unwrap().contains("disk gone"));
    }
}
