//! Forwarder (C6): one upstream attempt against one (channel, key) pair.
//!
//! Buffers the request body up to `max_body_bytes` so retries can replay
//! it, dials the upstream through a shared connection pool, enforces a
//! first-byte deadline, and streams SSE responses through as they arrive.

use crate::models::{Channel, ModelEntry};
use axum::body::Bytes;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use futures::StreamExt;
use std::time::{Duration, Instant};

pub const MAX_BODY_BYTES: usize = 2 * 1024 * 1024;

const TEXT_EVENT_STREAM: &str = "text/event-stream";

/// Bytes of the tail of a response body kept around for usage parsing.
/// `usage` blocks sit at the end of both a plain JSON body and an SSE
/// stream (the final `message_delta`/`message_stop` event), so this only
/// needs to hold a window, not the whole body.
const USAGE_SCAN_CAP: usize = 64 * 1024;

/// Token counts parsed out of an upstream response, in the union of the
/// Anthropic and OpenAI usage-object shapes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsageCounts {
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cache_read_tokens: i64,
    pub cache_creation_tokens: i64,
}

impl UsageCounts {
    pub fn total(&self) -> i64 {
        self.input_tokens + self.output_tokens + self.cache_read_tokens + self.cache_creation_tokens
    }
}

fn usage_from_json(value: &serde_json::Value) -> Option<UsageCounts> {
    let usage = value.get("usage")?;
    let field = |keys: &[&str]| -> i64 {
        keys.iter()
            .find_map(|k| usage.get(k))
            .and_then(|v| v.as_i64())
            .unwrap_or(0)
    };
    Some(UsageCounts {
        input_tokens: field(&["input_tokens", "prompt_tokens"]),
        output_tokens: field(&["output_tokens", "completion_tokens"]),
        cache_read_tokens: field(&["cache_read_input_tokens", "cache_read_tokens"]),
        cache_creation_tokens: field(&["cache_creation_input_tokens", "cache_creation_tokens"]),
    })
}

/// Scan the tail window for a `usage` object. SSE bodies carry one or more
/// `data: {...}` lines; the last one with a `usage` field wins. Plain
/// bodies are parsed whole.
fn extract_usage(is_sse: bool, tail: &[u8]) -> Option<UsageCounts> {
    let text = std::str::from_utf8(tail).ok()?;
    if is_sse {
        text.lines()
            .rev()
            .filter_map(|line| line.strip_prefix("data:").map(str::trim_start))
            .filter_map(|data| serde_json::from_str::<serde_json::Value>(data).ok())
            .find_map(|value| usage_from_json(&value))
    } else {
        let value: serde_json::Value = serde_json::from_str(text.trim()).ok()?;
        usage_from_json(&value)
    }
}

/// Hop-by-hop headers that must never be forwarded verbatim (RFC 7230 §6.1),
/// plus the inbound authorization header which the Forwarder always
/// replaces with the selected credential.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "host",
    "authorization",
    "x-api-key",
    "x-goog-api-key",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Success,
    KeyFault,
    ChannelFault,
    SseStreamError,
    ClientFault,
    ClientCancel,
}

/// Classify a final HTTP status per the failure-classification table (§4.6).
pub fn classify(status: u16) -> Classification {
    match status {
        200..=299 => Classification::Success,
        401 | 402 | 403 | 429 => Classification::KeyFault,
        597 => Classification::SseStreamError,
        500 | 502 | 503 | 504 | 520 | 521 | 524 | 598 | 599 => Classification::ChannelFault,
        499 => Classification::ClientCancel,
        _ => Classification::ClientFault,
    }
}

/// Translate the internal synthetic codes (597/598/599) to 502 at the
/// egress boundary facing external clients, per §7/§9's resolved open
/// question. The fine-grained code is preserved in the log entry.
pub fn externalize_status(status: u16) -> u16 {
    match status {
        597 | 598 | 599 => 502,
        other => other,
    }
}

pub fn strip_hop_by_hop(headers: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in headers.iter() {
        if HOP_BY_HOP.contains(&name.as_str()) {
            continue;
        }
        out.insert(name.clone(), value.clone());
    }
    out
}

/// Apply `redirect_model` substitution to a JSON request body, if the model
/// entry declares one for the requested model.
pub fn apply_redirect(body: &Bytes, model_entry: Option<&ModelEntry>) -> Bytes {
    let Some(entry) = model_entry else { return body.clone() };
    let Some(redirect) = &entry.redirect_model else { return body.clone() };
    let Ok(mut value) = serde_json::from_slice::<serde_json::Value>(body) else {
        return body.clone();
    };
    if let Some(obj) = value.as_object_mut() {
        obj.insert("model".to_string(), serde_json::Value::String(redirect.clone()));
    }
    match serde_json::to_vec(&value) {
        Ok(bytes) => Bytes::from(bytes),
        Err(_) => body.clone(),
    }
}

pub struct ForwardRequest {
    pub method: reqwest::Method,
    pub path_and_query: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Resolved once a streamed body finishes (or fails), carrying the true
/// terminal status (e.g. 599 on a truncated SSE stream) and any usage
/// counters recovered from the tail of the body.
pub struct StreamCompletion {
    pub status: u16,
    pub usage: Option<UsageCounts>,
}

/// A response already being streamed to the client. `completion` resolves
/// once the body finishes (or fails) streaming, carrying the true
/// terminal status (e.g. 599 on a truncated SSE stream) even though the
/// HTTP status line (200) was already sent on the wire — the caller
/// should defer its log entry until this resolves, per the "log entries
/// emitted exactly once, after the response is fully written" ordering
/// guarantee. If the receiver resolves to `Err` the body generator was
/// dropped before finishing — the client disconnected mid-stream.
pub struct StreamingOutcome {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: axum::body::Body,
    pub first_byte_secs: f64,
    pub completion: tokio::sync::oneshot::Receiver<StreamCompletion>,
}

pub enum ForwardOutcome {
    Streaming(StreamingOutcome),
    Fault {
        status: u16,
        classification: Classification,
        message: String,
    },
}

pub struct Forwarder {
    client: reqwest::Client,
    first_byte_timeout: Duration,
}

impl Forwarder {
    pub fn new(client: reqwest::Client, first_byte_timeout_secs: u64) -> Self {
        Self {
            client,
            first_byte_timeout: Duration::from_secs(first_byte_timeout_secs),
        }
    }

    /// One attempt against `channel` using `key`. `req.headers` must
    /// already have the credential stripped; this call writes it in.
    pub async fn attempt(
        &self,
        channel: &Channel,
        key: &str,
        mut req: ForwardRequest,
    ) -> ForwardOutcome {
        let url = format!("{}{}", channel.url.trim_end_matches('/'), req.path_and_query);

        let header_name = channel.channel_type.auth_header_name();
        let header_value = channel.channel_type.auth_header_value(key);
        if let (Ok(name), Ok(value)) = (
            HeaderName::try_from(header_name),
            HeaderValue::from_str(&header_value),
        ) {
            req.headers.insert(name, value);
        }

        let mut builder = self
            .client
            .request(req.method, &url)
            .body(req.body.to_vec());
        for (name, value) in req.headers.iter() {
            builder = builder.header(name.clone(), value.clone());
        }

        let started = Instant::now();
        let send_future = builder.send();

        let result = if self.first_byte_timeout.is_zero() {
            send_future.await
        } else {
            match tokio::time::timeout(self.first_byte_timeout, send_future).await {
                Ok(result) => result,
                Err(_) => {
                    return ForwardOutcome::Fault {
                        status: 598,
                        classification: Classification::ChannelFault,
                        message: "upstream first byte timeout".to_string(),
                    };
                }
            }
        };

        let response = match result {
            Ok(resp) => resp,
            Err(e) => {
                return ForwardOutcome::Fault {
                    status: 502,
                    classification: Classification::ChannelFault,
                    message: format!("dial error: {e}"),
                };
            }
        };

        let first_byte_secs = started.elapsed().as_secs_f64();
        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        if !(200..300).contains(&status) {
            let message = response
                .text()
                .await
                .unwrap_or_default()
                .chars()
                .take(2000)
                .collect::<String>();
            return ForwardOutcome::Fault {
                status,
                classification: classify(status),
                message,
            };
        }

        let mut response_headers = HeaderMap::new();
        for (name, value) in response.headers().iter() {
            if HOP_BY_HOP.contains(&name.as_str()) {
                continue;
            }
            response_headers.insert(name.clone(), value.clone());
        }

        let (completion_tx, completion_rx) = tokio::sync::oneshot::channel();
        let is_sse = content_type.starts_with(TEXT_EVENT_STREAM);
        let body = if is_sse {
            sse_passthrough_body(response, status, completion_tx)
        } else {
            plain_passthrough_body(response, status, completion_tx)
        };

        ForwardOutcome::Streaming(StreamingOutcome {
            status: StatusCode::from_u16(status).unwrap_or(StatusCode::OK),
            headers: response_headers,
            body,
            first_byte_secs,
            completion: completion_rx,
        })
    }
}

/// Copy a response body through to the client chunk by chunk, resolving
/// `completion` with the true terminal status once the body finishes (200
/// on a clean end, 599 on a mid-stream read error) and any usage counters
/// found in the tail of the body, even though the HTTP status line was
/// already sent on the wire. SSE and plain bodies are copied identically;
/// the distinct entry points exist for clarity at the call site and
/// mirror the SSE-vs-plain split in the failure classification table.
fn sse_passthrough_body(
    response: reqwest::Response,
    status: u16,
    completion: tokio::sync::oneshot::Sender<StreamCompletion>,
) -> axum::body::Body {
    passthrough_body(response, status, true, completion)
}

fn plain_passthrough_body(
    response: reqwest::Response,
    status: u16,
    completion: tokio::sync::oneshot::Sender<StreamCompletion>,
) -> axum::body::Body {
    passthrough_body(response, status, false, completion)
}

fn passthrough_body(
    response: reqwest::Response,
    status: u16,
    is_sse: bool,
    completion: tokio::sync::oneshot::Sender<StreamCompletion>,
) -> axum::body::Body {
    let stream = async_stream::stream! {
        let mut upstream = response.bytes_stream();
        let mut final_status = status;
        let mut tail: Vec<u8> = Vec::new();
        while let Some(chunk) = upstream.next().await {
            match chunk {
                Ok(bytes) => {
                    tail.extend_from_slice(&bytes);
                    if tail.len() > USAGE_SCAN_CAP {
                        let excess = tail.len() - USAGE_SCAN_CAP;
                        tail.drain(0..excess);
                    }
                    yield Ok(bytes);
                }
                Err(e) => {
                    final_status = 599;
                    yield Err(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, e));
                    break;
                }
            }
        }
        let usage = extract_usage(is_sse, &tail);
        let _ = completion.send(StreamCompletion { status: final_status, usage });
    };
    axum::body::Body::from_stream(stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_matches_failure_table() {
        assert_eq!(classify(200), Classification::Success);
        assert_eq!(classify(401), Classification::KeyFault);
        assert_eq!(classify(403), Classification::KeyFault);
        assert_eq!(classify(429), Classification::KeyFault);
        assert_eq!(classify(500), Classification::ChannelFault);
        assert_eq!(classify(503), Classification::ChannelFault);
        assert_eq!(classify(598), Classification::ChannelFault);
        assert_eq!(classify(599), Classification::ChannelFault);
        assert_eq!(classify(597), Classification::SseStreamError);
        assert_eq!(classify(499), Classification::ClientCancel);
        assert_eq!(classify(404), Classification::ClientFault);
    }

    #[test]
    fn egress_translates_internal_codes_to_502() {
        assert_eq!(externalize_status(597), 502);
        assert_eq!(externalize_status(598), 502);
        assert_eq!(externalize_status(599), 502);
        assert_eq!(externalize_status(500), 500);
        assert_eq!(externalize_status(200), 200);
    }

    #[test]
    fn redirect_substitutes_model_field() {
        let body = Bytes::from_static(br#"{"model":"gpt-4","stream":false}"#);
        let entry = ModelEntry {
            channel_id: 1,
            model: "gpt-4".to_string(),
            redirect_model: Some("gpt-4-turbo".to_string()),
        };
        let rewritten = apply_redirect(&body, Some(&entry));
        let value: serde_json::Value = serde_json::from_slice(&rewritten).unwrap();
        assert_eq!(value["model"], "gpt-4-turbo");
    }

    #[test]
    fn no_redirect_entry_leaves_body_untouched() {
        let body = Bytes::from_static(br#"{"model":"gpt-4"}"#);
        assert_eq!(apply_redirect(&body, None), body);
    }

    #[test]
    fn extracts_anthropic_style_usage_from_plain_body() {
        let body = br#"{"id":"msg_1","usage":{"input_tokens":12,"output_tokens":34}}"#;
        let usage = extract_usage(false, body).unwrap();
        assert_eq!(usage.input_tokens, 12);
        assert_eq!(usage.output_tokens, 34);
        assert_eq!(usage.total(), 46);
    }

    #[test]
    fn extracts_usage_from_last_sse_data_line() {
        let body = b"data: {\"type\":\"ping\"}\n\ndata: {\"usage\":{\"prompt_tokens\":5,\"completion_tokens\":7}}\n\n";
        let usage = extract_usage(true, body).unwrap();
        assert_eq!(usage.input_tokens, 5);
        assert_eq!(usage.output_tokens, 7);
    }

    #[test]
    fn missing_usage_object_yields_none() {
        assert!(extract_usage(false, br#"{"id":"msg_1"}"#).is_none());
    }

    #[test]
    fn hop_by_hop_headers_are_stripped() {
        let mut headers = HeaderMap::new();
        headers.insert("connection", HeaderValue::from_static("keep-alive"));
        headers.insert("authorization", HeaderValue::from_static("Bearer old"));
        headers.insert("content-type", HeaderValue::from_static("application/json"));
        let stripped = strip_hop_by_hop(&headers);
        assert!(!stripped.contains_key("connection"));
        assert!(!stripped.contains_key("authorization"));
        assert!(stripped.contains_key("content-type"));
    }
}
