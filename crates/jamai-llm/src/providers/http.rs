//! Shared HTTP plumbing for provider adapters: canonical error mapping and
//! SSE body decoding.

use crate::error::{Error, Result};
use futures::stream::{Stream, StreamExt};
use std::collections::VecDeque;

/// Substrings that mark a vendor 4xx as a context-window rejection.
const CONTEXT_MARKERS: &[&str] = &[
    "context_length",
    "context length",
    "prompt is too long",
    "too many tokens",
    "maximum context",
];

/// Map a non-success provider response to a canonical error kind.
///
/// 4xx context rejections become [`Error::ContextOverflow`]; 401/403 become
/// [`Error::ProviderAuth`]; 429 becomes [`Error::ProviderRateLimit`]; 5xx and
/// everything else become [`Error::ProviderUnavailable`].
#[must_use]
pub fn map_status_error(status: reqwest::StatusCode, body: &str) -> Error {
    let message = truncate(body, 300);
    match status.as_u16() {
        400 | 413 => {
            let lower = body.to_lowercase();
            if CONTEXT_MARKERS.iter().any(|m| lower.contains(m)) {
                Error::ContextOverflow(message)
            } else {
                Error::BadInput(message)
            }
        }
        401 | 403 => Error::ProviderAuth(message),
        429 => Error::ProviderRateLimit(message),
        _ => Error::ProviderUnavailable(format!("HTTP {status}: {message}")),
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}

/// Decode a `text/event-stream` response body into its `data:` payloads,
/// one item per event. Blank lines and comment/field lines are skipped;
/// the caller decides what `[DONE]` means.
pub fn sse_data_lines(
    response: reqwest::Response,
) -> impl Stream<Item = Result<String>> + Send {
    let bytes = Box::pin(response.bytes_stream());
    futures::stream::try_unfold(
        (bytes, String::new(), VecDeque::new()),
        |(mut bytes, mut buf, mut pending)| async move {
            loop {
                if let Some(line) = pending.pop_front() {
                    return Ok(Some((line, (bytes, buf, pending))));
                }
                match bytes.next().await {
                    Some(Ok(chunk)) => {
                        buf.push_str(&String::from_utf8_lossy(&chunk));
                        while let Some(pos) = buf.find('\n') {
                            let line: String = buf.drain(..=pos).collect();
                            let line = line.trim_end_matches(['\n', '\r']);
                            if let Some(data) = line.strip_prefix("data:") {
                                pending.push_back(data.trim_start().to_string());
                            }
                        }
                    }
                    Some(Err(e)) => return Err(Error::Network(e.to_string())),
                    None => {
                        // Flush a final unterminated data line, if any.
                        if let Some(data) = buf.strip_prefix("data:") {
                            let data = data.trim().to_string();
                            buf.clear();
                            if !data.is_empty() {
                                return Ok(Some((data, (bytes, buf, pending))));
                            }
                        }
                        return Ok(None);
                    }
                }
            }
        },
    )
}

/// Decode a newline-delimited JSON response body into its non-empty lines
/// (Ollama's streaming format).
pub fn ndjson_lines(response: reqwest::Response) -> impl Stream<Item = Result<String>> + Send {
    let bytes = Box::pin(response.bytes_stream());
    futures::stream::try_unfold(
        (bytes, String::new(), VecDeque::new()),
        |(mut bytes, mut buf, mut pending)| async move {
            loop {
                if let Some(line) = pending.pop_front() {
                    return Ok(Some((line, (bytes, buf, pending))));
                }
                match bytes.next().await {
                    Some(Ok(chunk)) => {
                        buf.push_str(&String::from_utf8_lossy(&chunk));
                        while let Some(pos) = buf.find('\n') {
                            let line: String = buf.drain(..=pos).collect();
                            let line = line.trim();
                            if !line.is_empty() {
                                pending.push_back(line.to_string());
                            }
                        }
                    }
                    Some(Err(e)) => return Err(Error::Network(e.to_string())),
                    None => {
                        let line = buf.trim().to_string();
                        buf.clear();
                        if !line.is_empty() {
                            return Ok(Some((line, (bytes, buf, pending))));
                        }
                        return Ok(None);
                    }
                }
            }
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_overflow_detection() {
        let err = map_status_error(
            reqwest::StatusCode::BAD_REQUEST,
            r#"{"error":{"code":"context_length_exceeded"}}"#,
        );
        assert!(matches!(err, Error::ContextOverflow(_)));

        let err = map_status_error(
            reqwest::StatusCode::BAD_REQUEST,
            "prompt is too long: 210000 tokens > 200000 maximum",
        );
        assert!(matches!(err, Error::ContextOverflow(_)));
    }

    #[test]
    fn test_plain_bad_request_is_bad_input() {
        let err = map_status_error(reqwest::StatusCode::BAD_REQUEST, "missing field");
        assert!(matches!(err, Error::BadInput(_)));
    }

    #[test]
    fn test_auth_and_rate_limit() {
        assert!(matches!(
            map_status_error(reqwest::StatusCode::UNAUTHORIZED, "no key"),
            Error::ProviderAuth(_)
        ));
        assert!(matches!(
            map_status_error(reqwest::StatusCode::FORBIDDEN, "denied"),
            Error::ProviderAuth(_)
        ));
        assert!(matches!(
            map_status_error(reqwest::StatusCode::TOO_MANY_REQUESTS, "slow down"),
            Error::ProviderRateLimit(_)
        ));
    }

    #[test]
    fn test_server_errors_are_unavailable() {
        assert!(matches!(
            map_status_error(reqwest::StatusCode::INTERNAL_SERVER_ERROR, "boom"),
            Error::ProviderUnavailable(_)
        ));
        assert!(matches!(
            map_status_error(reqwest::StatusCode::BAD_GATEWAY, "bad"),
            Error::ProviderUnavailable(_)
        ));
    }
}
