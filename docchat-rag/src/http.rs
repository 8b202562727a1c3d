//! Shared HTTP plumbing for the service adapters.
//!
//! Every adapter sends JSON over `reqwest` and needs the same answer to one
//! question: did the call fail in a way worth retrying? [`send_json`] performs
//! the request and classifies any failure into a [`ServiceErrorKind`].

use std::time::Duration;

use eventsource_stream::EventStreamError;
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::ServiceErrorKind;

/// Longest upstream error detail kept in an error message.
const MAX_DETAIL_LEN: usize = 512;

/// A classified HTTP failure, converted by each adapter into its own error variant.
#[derive(Debug)]
pub(crate) struct HttpFailure {
    pub kind: ServiceErrorKind,
    pub message: String,
}

/// Build a client whose requests give up after `timeout`.
pub(crate) fn build_client(timeout: Duration) -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder().timeout(timeout).connect_timeout(timeout.min(Duration::from_secs(10))).build()
}

/// Classify a non-success HTTP status.
pub fn classify_status(status: StatusCode) -> ServiceErrorKind {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ServiceErrorKind::Auth,
        StatusCode::TOO_MANY_REQUESTS => ServiceErrorKind::RateLimited,
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => ServiceErrorKind::Timeout,
        s if s.is_server_error() => ServiceErrorKind::Unavailable,
        _ => ServiceErrorKind::Malformed,
    }
}

/// Classify a transport-level `reqwest` failure.
pub fn classify_transport(error: &reqwest::Error) -> ServiceErrorKind {
    if error.is_timeout() {
        ServiceErrorKind::Timeout
    } else if error.is_connect() || error.is_request() {
        ServiceErrorKind::Unavailable
    } else if let Some(status) = error.status() {
        classify_status(status)
    } else {
        ServiceErrorKind::Malformed
    }
}

/// Pull a readable message out of an error body.
///
/// Understands the OpenAI/Azure shape `{"error": {"message": ...}}` and the
/// Qdrant shape `{"status": {"error": ...}}`; anything else is returned
/// truncated.
fn error_detail(body: &str) -> String {
    let parsed = serde_json::from_str::<Value>(body).ok();
    let detail = parsed.as_ref().and_then(|v| {
        v.pointer("/error/message")
            .or_else(|| v.pointer("/status/error"))
            .or_else(|| v.get("error").filter(|e| e.is_string()))
            .and_then(Value::as_str)
            .map(str::to_string)
    });
    let mut detail = detail.unwrap_or_else(|| body.trim().to_string());
    if detail.len() > MAX_DETAIL_LEN {
        let mut cut = MAX_DETAIL_LEN;
        while !detail.is_char_boundary(cut) {
            cut -= 1;
        }
        detail.truncate(cut);
        detail.push('…');
    }
    detail
}

fn transport_failure(error: reqwest::Error, what: &str) -> HttpFailure {
    HttpFailure { kind: classify_transport(&error), message: format!("{what}: {error}") }
}

async fn status_failure(response: Response) -> HttpFailure {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    HttpFailure {
        kind: classify_status(status),
        message: format!("service returned {status}: {}", error_detail(&body)),
    }
}

/// Send a request, failing on any non-success status.
pub(crate) async fn send_checked(request: RequestBuilder) -> Result<Response, HttpFailure> {
    let response = request.send().await.map_err(|e| transport_failure(e, "request failed"))?;
    if !response.status().is_success() {
        return Err(status_failure(response).await);
    }
    Ok(response)
}

/// Send a request and decode a JSON response body.
pub(crate) async fn send_json<T: DeserializeOwned>(request: RequestBuilder) -> Result<T, HttpFailure> {
    let response = send_checked(request).await?;
    let body = response.text().await.map_err(|e| transport_failure(e, "failed to read response body"))?;
    serde_json::from_str::<T>(&body).map_err(|e| HttpFailure {
        kind: ServiceErrorKind::Malformed,
        message: format!("failed to decode response: {e}"),
    })
}

/// Classify a failure part-way through a server-sent event stream.
pub(crate) fn event_stream_failure(error: EventStreamError<reqwest::Error>) -> HttpFailure {
    match error {
        EventStreamError::Transport(e) => transport_failure(e, "stream interrupted"),
        other => HttpFailure { kind: ServiceErrorKind::Malformed, message: format!("invalid event stream: {other}") },
    }
}

/// Like [`send_json`], but a `404 Not Found` yields `Ok(None)`.
pub(crate) async fn send_json_optional<T: DeserializeOwned>(
    request: RequestBuilder,
) -> Result<Option<T>, HttpFailure> {
    let response = request.send().await.map_err(|e| transport_failure(e, "request failed"))?;

    let status = response.status();
    if status == StatusCode::NOT_FOUND {
        return Ok(None);
    }
    if !status.is_success() {
        return Err(status_failure(response).await);
    }

    response.json::<T>().await.map(Some).map_err(|e| HttpFailure {
        kind: if e.is_decode() { ServiceErrorKind::Malformed } else { classify_transport(&e) },
        message: format!("failed to decode response: {e}"),
    })
}
