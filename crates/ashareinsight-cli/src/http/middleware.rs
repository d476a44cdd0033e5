//! Request-scoped logging, grounded on the teacher-pack's own
//! `request_logging` middleware: one span per request, method/path/status/
//! latency, WARN on 5xx — plus a `request_id` the error envelope threads
//! back to the caller (spec §6.1).

use std::time::Instant;

use axum::body::Body;
use axum::extract::Request;
use axum::http::HeaderValue;
use axum::middleware::Next;
use axum::response::Response;
use uuid::Uuid;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

pub async fn request_logging(mut request: Request<Body>, next: Next) -> Response {
    let request_id = Uuid::new_v4().to_string();
    request.extensions_mut().insert(RequestId(request_id.clone()));

    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let start = Instant::now();

    let mut response = next.run(request).await;

    let latency = start.elapsed();
    let status = response.status().as_u16();
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }

    if status >= 500 {
        tracing::warn!(%method, %path, status, latency_ms = latency.as_millis() as u64, request_id, "request failed");
    } else {
        tracing::info!(%method, %path, status, latency_ms = latency.as_millis() as u64, request_id, "request completed");
    }

    response
}

/// Stashed in request extensions by [`request_logging`] so handlers and the
/// error-mapping layer can read back the id generated for this request.
#[derive(Debug, Clone)]
pub struct RequestId(pub String);
