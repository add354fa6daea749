//! Request-scoped middleware and extractors.

use crate::diagnostics::with_correlation_id;
use crate::error::PortalError;
use axum::extract::{FromRequestParts, Request};
use axum::http::HeaderValue;
use axum::http::request::Parts;
use axum::middleware::Next;
use axum::response::Response;
use tracing::Instrument;

pub const REQUEST_ID_HEADER: &str = "x-request-id";
pub const COMPANY_HEADER: &str = "x-company-id";

/// Caller-supplied ids are kept only when they are short and printable.
fn usable_request_id(value: &HeaderValue) -> Option<String> {
    let id = value.to_str().ok()?.trim();
    let ok = !id.is_empty()
        && id.len() <= 128
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    ok.then(|| id.to_string())
}

/// Tag the request with a correlation id, echo it in `x-request-id`, and make
/// it visible to the procedure debug log for the duration of the request.
pub async fn request_id(request: Request, next: Next) -> Response {
    let id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(usable_request_id)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let span = tracing::info_span!(
        "request",
        request_id = %id,
        method = %request.method(),
        path = %request.uri().path()
    );

    let mut response = with_correlation_id(id.clone(), next.run(request))
        .instrument(span)
        .await;

    if let Ok(value) = HeaderValue::from_str(&id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

/// Company id from the `x-company-id` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Company(pub String);

impl<S: Send + Sync> FromRequestParts<S> for Company {
    type Rejection = PortalError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let value = parts
            .headers
            .get(COMPANY_HEADER)
            .ok_or_else(|| PortalError::invalid_input("Missing x-company-id header"))?;
        let company = value
            .to_str()
            .map_err(|_| PortalError::invalid_input("x-company-id must be visible ASCII"))?
            .trim();
        if company.is_empty() {
            return Err(PortalError::invalid_input("x-company-id cannot be empty"));
        }
        Ok(Company(company.to_string()))
    }
}
