use axum::{extract::Request, http::header, middleware::Next, response::Response};

use crate::crypto;
use crate::error::FailureDetail;

/// Request ID stored in request extensions for log correlation.
#[derive(Clone, Debug)]
pub struct RequestId(pub String);

/// Generate a request ID, stash it in the request extensions, and echo it
/// back on the response as `x-request-id`.
///
/// Server errors surface here too: `ApiError` leaves a [`FailureDetail`] on
/// the response, and this is the one place that knows both the detail and
/// the id the client saw, so the two land on the same log line.
pub async fn request_id_middleware(mut request: Request, next: Next) -> Response {
    let request_id = RequestId(crypto::random_token_hex(8));
    request.extensions_mut().insert(request_id.clone());

    let mut response = next.run(request).await;

    if let Some(detail) = response.extensions().get::<FailureDetail>() {
        tracing::error!(
            request_id = %request_id.0,
            status = response.status().as_u16(),
            code = %detail.code,
            error = detail.chain.as_deref(),
            "request failed"
        );
    }

    response.headers_mut().insert(
        header::HeaderName::from_static("x-request-id"),
        header::HeaderValue::from_str(&request_id.0)
            .unwrap_or_else(|_| header::HeaderValue::from_static("invalid")),
    );
    response
}
