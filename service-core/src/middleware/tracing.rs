use axum::http::{HeaderMap, HeaderValue};
use axum::{extract::Request, middleware::Next, response::Response};
use tracing::info_span;
use tracing::Instrument;
use uuid::Uuid;

pub const REQUEST_ID_HEADER: &str = "x-request-id";
pub const CORRELATION_ID_HEADER: &str = "x-correlation-id";

/// Resolve the correlation id for a request: `x-correlation-id`, then
/// `x-request-id`, else `None`.
pub fn correlation_id_from_headers(headers: &HeaderMap) -> Option<String> {
    [CORRELATION_ID_HEADER, REQUEST_ID_HEADER]
        .iter()
        .filter_map(|name| headers.get(*name))
        .filter_map(|h| h.to_str().ok())
        .map(str::trim)
        .find(|s| !s.is_empty() && s.len() <= 128)
        .map(str::to_string)
}

/// Guarantees every request carries a correlation id under both header names
/// and runs the handler inside a span tagged with it.
pub async fn request_id_middleware(mut req: Request, next: Next) -> Response {
    let correlation_id =
        correlation_id_from_headers(req.headers()).unwrap_or_else(|| Uuid::new_v4().to_string());

    if let Ok(header_value) = HeaderValue::from_str(&correlation_id) {
        req.headers_mut()
            .insert(REQUEST_ID_HEADER, header_value.clone());
        req.headers_mut()
            .insert(CORRELATION_ID_HEADER, header_value);
    }

    let span = info_span!(
        "http_request",
        correlation_id = %correlation_id,
        method = %req.method(),
        uri = %req.uri().path(),
    );

    let mut response = next.run(req).instrument(span).await;

    if let Ok(header_value) = HeaderValue::from_str(&correlation_id) {
        response
            .headers_mut()
            .insert(CORRELATION_ID_HEADER, header_value);
    }

    response
}
