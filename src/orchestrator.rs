//! Proxy Orchestrator (C7): the per-request state machine binding
//! admission, auth, selection, key rotation, forwarding, classification,
//! and cooldown updates together.

use crate::auth::{AuthGate, AuthResult};
use crate::cooldown::CooldownManager;
use crate::error::ApiError;
use crate::forwarder::{apply_redirect, externalize_status, strip_hop_by_hop, Classification, ForwardOutcome, ForwardRequest, Forwarder, UsageCounts};
use crate::key_selector::{select_key, NoAvailableKey, RoundRobinCounters};
use crate::log_pipeline::LogPipeline;
use crate::models::LogEntry;
use crate::selector::Selector;
use crate::store::Store;
use axum::body::Bytes;
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::Semaphore;

/// Placeholder per-token rate used to keep the cost cap in §4.10
/// exercisable without a real per-model price table, which is out of
/// scope here (see DESIGN.md). One microUSD is 1e-6 USD, so this values
/// a token at $0.00001.
const ASSUMED_MICROUSD_PER_TOKEN: i64 = 10;

/// A synthetic status bumped against a channel's cooldown when every key
/// is excluded or cooling, or the per-channel retry budget is exhausted —
/// there is no upstream response to classify, but the channel still
/// needs to back off before the next request tries it again.
const RETRY_EXHAUSTED_STATUS: u16 = 503;

pub struct Orchestrator {
    store: Arc<dyn Store>,
    selector: Selector,
    cooldowns: CooldownManager,
    counters: RoundRobinCounters,
    forwarder: Forwarder,
    auth: Arc<AuthGate>,
    logs: Arc<LogPipeline>,
    admission: Arc<Semaphore>,
    max_key_retries: u32,
    shutting_down: Arc<AtomicBool>,
}

pub struct ProxyRequest {
    pub method: Method,
    pub path_and_query: String,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub client_ip: Option<IpAddr>,
}

#[derive(serde::Deserialize, Default)]
struct PartialBody {
    model: Option<String>,
    #[serde(default)]
    stream: bool,
}

struct GuardState {
    model: String,
    channel_id: i64,
    is_streaming: bool,
    auth_token_id: Option<i64>,
}

/// Detects a client disconnecting mid-request. `run_inner`'s future (and
/// everything it awaits, including the outstanding upstream call) is
/// dropped by the axum/hyper service machinery the moment the client
/// goes away, with no further polling — there is no "disconnect event"
/// to await. A guard held across `run_inner` and disarmed only on a
/// normal return turns that drop into a signal: if `armed` is still
/// true when the guard itself is dropped, the request was cancelled
/// rather than completed, and a 499 log entry is emitted in its place.
struct CancelGuard {
    logs: Arc<LogPipeline>,
    armed: AtomicBool,
    client_ip: Option<String>,
    started: Instant,
    state: Mutex<GuardState>,
}

impl CancelGuard {
    fn new(logs: Arc<LogPipeline>, client_ip: Option<String>) -> Self {
        Self {
            logs,
            armed: AtomicBool::new(true),
            client_ip,
            started: Instant::now(),
            state: Mutex::new(GuardState {
                model: String::new(),
                channel_id: 0,
                is_streaming: false,
                auth_token_id: None,
            }),
        }
    }

    fn set_model(&self, model: &str) {
        self.state.lock().unwrap().model = model.to_string();
    }

    fn set_auth_token_id(&self, id: Option<i64>) {
        self.state.lock().unwrap().auth_token_id = id;
    }

    fn set_attempt(&self, channel_id: i64, is_streaming: bool) {
        let mut state = self.state.lock().unwrap();
        state.channel_id = channel_id;
        state.is_streaming = is_streaming;
    }

    /// Disarm after a normal return (success or any upstream-classified
    /// failure); no log entry is emitted for those through this path.
    fn disarm(&self) {
        self.armed.store(false, Ordering::Relaxed);
    }
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        if !self.armed.load(Ordering::Relaxed) {
            return;
        }
        let state = self.state.lock().unwrap();
        self.logs.enqueue(LogEntry {
            id: None,
            time_ms: now_ms(),
            model: state.model.clone(),
            channel_id: state.channel_id,
            status_code: 499,
            message: "client disconnected".into(),
            duration_secs: self.started.elapsed().as_secs_f64(),
            is_streaming: state.is_streaming,
            first_byte_secs: None,
            api_key_used: None,
            input_tokens: 0,
            output_tokens: 0,
            cache_read_tokens: 0,
            cache_creation_tokens: 0,
            cost_microusd: 0,
            auth_token_id: state.auth_token_id,
            client_ip: self.client_ip.clone(),
        });
    }
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn Store>,
        selector: Selector,
        cooldowns: CooldownManager,
        forwarder: Forwarder,
        auth: Arc<AuthGate>,
        logs: Arc<LogPipeline>,
        admission: Arc<Semaphore>,
        max_key_retries: u32,
        shutting_down: Arc<AtomicBool>,
    ) -> Self {
        Self {
            store,
            selector,
            cooldowns,
            counters: RoundRobinCounters::new(),
            forwarder,
            auth,
            logs,
            admission,
            max_key_retries,
            shutting_down,
        }
    }

    pub async fn handle(&self, req: ProxyRequest) -> Response {
        if self.shutting_down.load(Ordering::Relaxed) {
            return ApiError::ShuttingDown.into_response();
        }

        let Ok(_permit) = self.admission.clone().try_acquire_owned() else {
            return ApiError::ShuttingDown.into_response();
        };

        match self.run(req).await {
            Ok(response) => response,
            Err(e) => e.into_response(),
        }
    }

    /// Runs the request, then disarms the cancellation guard. The guard
    /// only fires if this future itself is dropped before reaching the
    /// disarm call below — i.e. the client disconnected mid-request.
    async fn run(&self, req: ProxyRequest) -> Result<Response, ApiError> {
        let guard = CancelGuard::new(Arc::clone(&self.logs), req.client_ip.map(|ip| ip.to_string()));
        let result = self.run_inner(req, &guard).await;
        guard.disarm();
        result
    }

    async fn run_inner(&self, req: ProxyRequest, guard: &CancelGuard) -> Result<Response, ApiError> {
        if req.body.len() > crate::forwarder::MAX_BODY_BYTES {
            return Err(ApiError::PayloadTooLarge);
        }

        let token = bearer_token(&req.headers).ok_or(ApiError::Unauthorized)?;
        let auth_result = self.auth.check_request_token(&token).await?;

        let partial: PartialBody = serde_json::from_slice(&req.body).unwrap_or_default();
        let model = partial.model.unwrap_or_default();
        guard.set_model(&model);

        if let AuthResult::Token(ref t) = auth_result {
            self.auth.enforce_limits(t, &model)?;
        }

        let candidates = self
            .selector
            .candidates(&model, None)
            .await
            .map_err(ApiError::from)?;
        if candidates.is_empty() {
            return Err(ApiError::NoChannelAvailable);
        }

        let auth_token_id = match &auth_result {
            AuthResult::Token(t) => Some(t.id),
            AuthResult::StaticBearer => None,
        };
        guard.set_auth_token_id(auth_token_id);

        let mut last_status = 502u16;
        let stripped_headers = strip_hop_by_hop(&req.headers);

        for channel in candidates {
            let keys = self.store.list_keys(channel.id).await.map_err(ApiError::from)?;
            let models = self.store.list_models(channel.id).await.map_err(ApiError::from)?;
            let model_entry = models
                .iter()
                .find(|m| m.model == model)
                .or_else(|| models.iter().find(|m| m.model == "*"));
            let mut tried: HashSet<i64> = HashSet::new();
            let mut attempts_left = self.max_key_retries.max(1);

            'channel: loop {
                if attempts_left == 0 {
                    // Retry budget exhausted without a terminal outcome:
                    // still back this channel off before moving to the
                    // next one, per §4.7 step 5.
                    self.cooldowns
                        .bump_channel(channel.id, channel.cooldown_duration_ms, RETRY_EXHAUSTED_STATUS, now_epoch())
                        .await
                        .ok();
                    break;
                }
                attempts_left -= 1;

                let key = match select_key(&self.counters, channel.id, &keys, &tried, now_epoch()).await {
                    Ok(k) => k,
                    Err(NoAvailableKey) => {
                        self.cooldowns
                            .bump_channel(channel.id, channel.cooldown_duration_ms, RETRY_EXHAUSTED_STATUS, now_epoch())
                            .await
                            .ok();
                        break;
                    }
                };

                guard.set_attempt(channel.id, partial.stream);
                let body = apply_redirect(&req.body, model_entry);
                let fwd_req = ForwardRequest {
                    method: reqwest_method(&req.method),
                    path_and_query: req.path_and_query.clone(),
                    headers: stripped_headers.clone(),
                    body,
                };

                let started = Instant::now();
                let outcome = self.forwarder.attempt(&channel, &key.api_key, fwd_req).await;

                match outcome {
                    ForwardOutcome::Streaming(streaming) => {
                        self.cooldowns.reset_channel(channel.id).await.ok();
                        self.cooldowns.reset_key(channel.id, key.key_index).await.ok();

                        let initial_status = streaming.status.as_u16();
                        let first_byte_secs = streaming.first_byte_secs;
                        let is_streaming = partial.stream;
                        let model_for_log = model.clone();
                        let key_masked = key.masked();
                        let client_ip = req.client_ip.map(|ip| ip.to_string());
                        let channel_id = channel.id;
                        let logs = Arc::clone(&self.logs);
                        let store = Arc::clone(&self.store);
                        let completion = streaming.completion;

                        // Deferred until the body finishes: the log entry
                        // must reflect the true terminal status (599 on a
                        // truncated stream) and any usage recovered from the
                        // body, emitted exactly once, after the response is
                        // fully written. A dropped-without-send receiver
                        // means the body generator was cancelled before it
                        // could report — the client disconnected mid-stream.
                        tokio::spawn(async move {
                            let (status_code, usage) = match completion.await {
                                Ok(result) => (result.status, result.usage.unwrap_or_default()),
                                Err(_) => (499, UsageCounts::default()),
                            };
                            let cost_microusd = usage.total() * ASSUMED_MICROUSD_PER_TOKEN;
                            logs.enqueue(LogEntry {
                                id: None,
                                time_ms: now_ms(),
                                model: model_for_log,
                                channel_id,
                                status_code,
                                message: "ok".into(),
                                duration_secs: started.elapsed().as_secs_f64(),
                                is_streaming,
                                first_byte_secs: Some(first_byte_secs),
                                api_key_used: Some(key_masked),
                                input_tokens: usage.input_tokens,
                                output_tokens: usage.output_tokens,
                                cache_read_tokens: usage.cache_read_tokens,
                                cache_creation_tokens: usage.cache_creation_tokens,
                                cost_microusd,
                                auth_token_id,
                                client_ip,
                            });
                            if let Some(token_id) = auth_token_id {
                                let success = (200..300).contains(&status_code);
                                let duration_ms = started.elapsed().as_secs_f64() * 1000.0;
                                let _ = store
                                    .record_auth_token_usage(
                                        token_id,
                                        success,
                                        duration_ms,
                                        is_streaming,
                                        usage.total(),
                                        cost_microusd,
                                    )
                                    .await;
                            }
                        });

                        let mut builder = Response::builder().status(streaming.status);
                        for (name, value) in streaming.headers.iter() {
                            builder = builder.header(name, value);
                        }
                        return Ok(builder.body(streaming.body).unwrap());
                    }
                    ForwardOutcome::Fault { status, classification, message } => {
                        last_status = status;
                        self.log_async(LogEntry {
                            id: None,
                            time_ms: now_ms(),
                            model: model.clone(),
                            channel_id: channel.id,
                            status_code: status,
                            message,
                            duration_secs: started.elapsed().as_secs_f64(),
                            is_streaming: partial.stream,
                            first_byte_secs: None,
                            api_key_used: Some(key.masked()),
                            input_tokens: 0,
                            output_tokens: 0,
                            cache_read_tokens: 0,
                            cache_creation_tokens: 0,
                            cost_microusd: 0,
                            auth_token_id,
                            client_ip: req.client_ip.map(|ip| ip.to_string()),
                        });
                        if let Some(token_id) = auth_token_id {
                            let duration_ms = started.elapsed().as_secs_f64() * 1000.0;
                            self.store
                                .record_auth_token_usage(token_id, false, duration_ms, partial.stream, 0, 0)
                                .await
                                .ok();
                        }

                        match classification {
                            Classification::KeyFault | Classification::SseStreamError => {
                                let prev = key.cooldown_duration_ms;
                                self.cooldowns
                                    .bump_key(channel.id, key.key_index, prev, status, now_epoch())
                                    .await
                                    .ok();
                                tried.insert(key.key_index);
                                continue 'channel;
                            }
                            Classification::ChannelFault => {
                                let prev = channel.cooldown_duration_ms;
                                self.cooldowns
                                    .bump_channel(channel.id, prev, status, now_epoch())
                                    .await
                                    .ok();
                                break 'channel;
                            }
                            Classification::ClientFault | Classification::ClientCancel => {
                                return Ok(fault_response(status, &message));
                            }
                            Classification::Success => unreachable!("success is a Streaming outcome"),
                        }
                    }
                }
            }
        }

        Err(ApiError::AllUpstreamsFailed { last_status: externalize_status(last_status) })
    }

    fn log_async(&self, entry: LogEntry) {
        self.logs.enqueue(entry);
    }
}

fn fault_response(status: u16, message: &str) -> Response {
    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
    let body = serde_json::json!({ "error": "upstream error", "message": message });
    (status, axum::Json(body)).into_response()
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    if let Some(auth) = headers.get(axum::http::header::AUTHORIZATION) {
        if let Ok(s) = auth.to_str() {
            if let Some(token) = s.strip_prefix("Bearer ") {
                return Some(token.to_string());
            }
        }
    }
    if let Some(key) = headers.get("x-api-key") {
        if let Ok(s) = key.to_str() {
            return Some(s.to_string());
        }
    }
    if let Some(key) = headers.get("x-goog-api-key") {
        if let Ok(s) = key.to_str() {
            return Some(s.to_string());
        }
    }
    None
}

fn reqwest_method(method: &Method) -> reqwest::Method {
    reqwest::Method::from_bytes(method.as_str().as_bytes()).unwrap_or(reqwest::Method::POST)
}

fn now_epoch() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bearer_token_reads_authorization_header() {
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::AUTHORIZATION,
            "Bearer abc123".parse().unwrap(),
        );
        assert_eq!(bearer_token(&headers), Some("abc123".to_string()));
    }

    #[test]
    fn bearer_token_falls_back_to_x_api_key() {
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", "xyz".parse().unwrap());
        assert_eq!(bearer_token(&headers), Some("xyz".to_string()));
    }

    #[test]
    fn missing_token_is_none() {
        let headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);
    }
}
