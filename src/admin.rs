//! Admin Surface (C11): the JSON API named in the external interfaces
//! section, composed over the Store, Cooldown Manager, Metrics Aggregator,
//! and Auth Gate. Handlers are thin HTTP-to-domain translations; the only
//! business logic here is request validation (empty/duplicate names,
//! out-of-range indices).

use crate::error::ApiError;
use crate::models::{ApiKeyRow, Channel, ChannelType, KeyStrategy, ModelEntry};
use crate::routes::Runtime;
use crate::store::ChannelFilter;
use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::{Request, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;

pub fn routes() -> Router<Arc<Runtime>> {
    let public = Router::new()
        .route("/login", post(login))
        .route("/health", get(health));

    let protected = Router::new()
        .route("/logout", post(logout))
        .route("/channels", get(list_channels).post(create_channel))
        .route(
            "/channels/:id",
            get(get_channel).put(update_channel).delete(delete_channel),
        )
        .route("/channels/:id/keys", get(list_keys).post(add_key))
        .route("/channels/:id/keys/:idx", axum::routing::delete(delete_key))
        .route("/channels/:id/cooldown", post(set_channel_cooldown))
        .route("/keys/:channel/:idx/cooldown", post(set_key_cooldown))
        .route("/metrics", get(metrics))
        .route("/stats", get(stats))
        .route("/errors", get(errors))
        .route("/channels/import", post(import_channels))
        .route("/channels/export", get(export_channels))
        .route_layer(middleware::from_fn(require_admin_session));

    public.merge(protected)
}

async fn require_admin_session(
    State(runtime): State<Arc<Runtime>>,
    headers: axum::http::HeaderMap,
    request: Request<axum::body::Body>,
    next: Next,
) -> Result<Response, ApiError> {
    let token = bearer(&headers).ok_or(ApiError::Unauthorized)?;
    runtime.auth.check_admin_session(&token, now_epoch()).await?;
    Ok(next.run(request).await)
}

fn bearer(headers: &axum::http::HeaderMap) -> Option<String> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .map(|s| s.to_string())
}

fn now_epoch() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

#[derive(Deserialize)]
struct LoginRequest {
    password: String,
}

#[derive(Serialize)]
struct LoginResponse {
    token: String,
    #[serde(rename = "expiresIn")]
    expires_in: i64,
}

async fn login(
    State(runtime): State<Arc<Runtime>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(req): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, ApiError> {
    let (token, expires_in) = runtime.auth.login(addr.ip(), &req.password, now_epoch()).await?;
    Ok(Json(LoginResponse { token, expires_in }))
}

async fn logout(State(runtime): State<Arc<Runtime>>, headers: axum::http::HeaderMap) -> Result<StatusCode, ApiError> {
    if let Some(token) = bearer(&headers) {
        runtime.auth.logout(&token).await?;
    }
    Ok(StatusCode::NO_CONTENT)
}

async fn health() -> &'static str {
    "ok"
}

async fn list_channels(State(runtime): State<Arc<Runtime>>) -> Result<Json<Vec<Channel>>, ApiError> {
    Ok(Json(runtime.store.list_channels().await?))
}

#[derive(Deserialize)]
struct ChannelRequest {
    name: String,
    url: String,
    priority: i64,
    #[serde(rename = "type")]
    channel_type: String,
    enabled: bool,
    models: Vec<ModelRequest>,
}

#[derive(Deserialize)]
struct ModelRequest {
    model: String,
    redirect_model: Option<String>,
}

async fn create_channel(
    State(runtime): State<Arc<Runtime>>,
    Json(req): Json<ChannelRequest>,
) -> Result<(StatusCode, Json<Channel>), ApiError> {
    let name = req.name.trim().to_string();
    if name.is_empty() {
        return Err(ApiError::BadRequest("channel name must not be empty".into()));
    }
    if runtime.store.get_channel_by_name(&name).await?.is_some() {
        return Err(ApiError::BadRequest(format!("channel {name} already exists")));
    }

    let now = now_epoch();
    let created = runtime
        .store
        .create_channel(Channel {
            id: 0,
            name,
            url: req.url,
            priority: req.priority,
            channel_type: ChannelType::from_str_loose(&req.channel_type),
            enabled: req.enabled,
            cooldown_until: 0,
            cooldown_duration_ms: 0,
            created_at: now,
            updated_at: now,
        })
        .await?;

    runtime
        .store
        .replace_models(
            created.id,
            req.models
                .into_iter()
                .map(|m| ModelEntry { channel_id: created.id, model: m.model, redirect_model: m.redirect_model })
                .collect(),
        )
        .await?;
    runtime.cache_invalidator.invalidate_all().await;

    Ok((StatusCode::CREATED, Json(created)))
}

async fn get_channel(State(runtime): State<Arc<Runtime>>, Path(id): Path<i64>) -> Result<Json<Channel>, ApiError> {
    Ok(Json(runtime.store.get_channel(id).await?))
}

async fn update_channel(
    State(runtime): State<Arc<Runtime>>,
    Path(id): Path<i64>,
    Json(req): Json<ChannelRequest>,
) -> Result<Json<Channel>, ApiError> {
    let existing = runtime.store.get_channel(id).await?;
    let updated = runtime
        .store
        .update_channel(Channel {
            id,
            name: req.name,
            url: req.url,
            priority: req.priority,
            channel_type: ChannelType::from_str_loose(&req.channel_type),
            enabled: req.enabled,
            updated_at: now_epoch(),
            ..existing
        })
        .await?;
    runtime
        .store
        .replace_models(
            id,
            req.models
                .into_iter()
                .map(|m| ModelEntry { channel_id: id, model: m.model, redirect_model: m.redirect_model })
                .collect(),
        )
        .await?;
    runtime.cache_invalidator.invalidate_channel(id).await;
    Ok(Json(updated))
}

async fn delete_channel(State(runtime): State<Arc<Runtime>>, Path(id): Path<i64>) -> Result<StatusCode, ApiError> {
    runtime.store.delete_channel(id).await?;
    runtime.cache_invalidator.invalidate_channel(id).await;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_keys(
    State(runtime): State<Arc<Runtime>>,
    Path(id): Path<i64>,
) -> Result<Json<Vec<ApiKeyRow>>, ApiError> {
    Ok(Json(runtime.store.list_keys(id).await?))
}

#[derive(Deserialize)]
struct AddKeyRequest {
    api_key: String,
    #[serde(default)]
    key_strategy: Option<String>,
}

async fn add_key(
    State(runtime): State<Arc<Runtime>>,
    Path(id): Path<i64>,
    Json(req): Json<AddKeyRequest>,
) -> Result<(StatusCode, Json<ApiKeyRow>), ApiError> {
    if req.api_key.trim().is_empty() {
        return Err(ApiError::BadRequest("api_key must not be empty".into()));
    }
    let strategy = req
        .key_strategy
        .as_deref()
        .map(KeyStrategy::from_str_loose)
        .unwrap_or_default();
    let created = runtime.store.add_key(id, req.api_key, strategy).await?;
    runtime.cache_invalidator.invalidate_channel(id).await;
    Ok((StatusCode::CREATED, Json(created)))
}

async fn delete_key(
    State(runtime): State<Arc<Runtime>>,
    Path((id, idx)): Path<(i64, i64)>,
) -> Result<StatusCode, ApiError> {
    runtime.store.delete_key(id, idx).await?;
    runtime.cache_invalidator.invalidate_channel(id).await;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
struct CooldownRequest {
    /// `None` resets the cooldown; `Some(seconds)` force-sets it.
    until: Option<i64>,
}

async fn set_channel_cooldown(
    State(runtime): State<Arc<Runtime>>,
    Path(id): Path<i64>,
    Json(req): Json<CooldownRequest>,
) -> Result<StatusCode, ApiError> {
    match req.until {
        Some(until) => runtime.store.bump_channel_cooldown(id, until, 0).await?,
        None => runtime.store.reset_channel_cooldown(id).await?,
    }
    runtime.cache_invalidator.invalidate_channel(id).await;
    Ok(StatusCode::NO_CONTENT)
}

async fn set_key_cooldown(
    State(runtime): State<Arc<Runtime>>,
    Path((channel_id, idx)): Path<(i64, i64)>,
    Json(req): Json<CooldownRequest>,
) -> Result<StatusCode, ApiError> {
    match req.until {
        Some(until) => runtime.store.bump_key_cooldown(channel_id, idx, until, 0).await?,
        None => runtime.store.reset_key_cooldown(channel_id, idx).await?,
    }
    runtime.cache_invalidator.invalidate_channel(channel_id).await;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
struct MetricsQuery {
    since: i64,
    until: i64,
    #[serde(default = "default_bucket")]
    bucket: i64,
    channel_type: Option<String>,
    channel_name: Option<String>,
    model: Option<String>,
    auth_token_id: Option<i64>,
}

fn default_bucket() -> i64 {
    60
}

async fn metrics(
    State(runtime): State<Arc<Runtime>>,
    Query(q): Query<MetricsQuery>,
) -> Result<Json<crate::metrics::MetricsSummary>, ApiError> {
    let filter = ChannelFilter {
        channel_type: q.channel_type,
        channel_name: q.channel_name,
        model: q.model,
        auth_token_id: q.auth_token_id,
    };
    let summary = runtime.metrics.summary(q.since, q.until, q.bucket, filter).await?;
    Ok(Json(summary))
}

async fn stats(
    State(runtime): State<Arc<Runtime>>,
    Query(q): Query<MetricsQuery>,
) -> Result<Json<crate::metrics::MetricsSummary>, ApiError> {
    metrics(State(runtime), Query(q)).await
}

#[derive(Deserialize)]
struct ErrorsQuery {
    #[serde(default = "default_errors_limit")]
    limit: i64,
}

fn default_errors_limit() -> i64 {
    100
}

async fn errors(
    State(runtime): State<Arc<Runtime>>,
    Query(q): Query<ErrorsQuery>,
) -> Result<Json<Vec<crate::models::LogEntry>>, ApiError> {
    Ok(Json(runtime.store.recent_errors(q.limit).await?))
}

/// CSV import round-trips on channel `name`: a second identical import is
/// idempotent (`created=0, updated=K`).
#[derive(Serialize)]
struct ImportResult {
    created: u32,
    updated: u32,
}

async fn import_channels(
    State(runtime): State<Arc<Runtime>>,
    body: axum::body::Bytes,
) -> Result<Json<ImportResult>, ApiError> {
    let text = String::from_utf8_lossy(&body);
    let mut created = 0u32;
    let mut updated = 0u32;
    for (i, line) in text.lines().enumerate() {
        if i == 0 || line.trim().is_empty() {
            continue; // header row
        }
        let fields: Vec<&str> = line.split(',').collect();
        if fields.len() < 5 {
            continue;
        }
        let name = fields[0].trim().to_string();
        let url = fields[1].trim().to_string();
        let priority: i64 = fields[2].trim().parse().unwrap_or(0);
        let channel_type = ChannelType::from_str_loose(fields[3].trim());
        let enabled = matches!(fields[4].trim(), "true" | "1");
        let models: Vec<ModelEntry> = fields
            .get(5)
            .map(|cell| {
                cell.split(';')
                    .filter(|m| !m.is_empty())
                    .map(|m| ModelEntry { channel_id: 0, model: m.to_string(), redirect_model: None })
                    .collect()
            })
            .unwrap_or_default();

        let now = now_epoch();
        if let Some(existing) = runtime.store.get_channel_by_name(&name).await? {
            let updated_channel = runtime
                .store
                .update_channel(Channel {
                    url,
                    priority,
                    channel_type,
                    enabled,
                    updated_at: now,
                    ..existing
                })
                .await?;
            let models = models.into_iter().map(|m| ModelEntry { channel_id: updated_channel.id, ..m }).collect();
            runtime.store.replace_models(updated_channel.id, models).await?;
            updated += 1;
        } else {
            let created_channel = runtime
                .store
                .create_channel(Channel {
                    id: 0,
                    name,
                    url,
                    priority,
                    channel_type,
                    enabled,
                    cooldown_until: 0,
                    cooldown_duration_ms: 0,
                    created_at: now,
                    updated_at: now,
                })
                .await?;
            let models = models.into_iter().map(|m| ModelEntry { channel_id: created_channel.id, ..m }).collect();
            runtime.store.replace_models(created_channel.id, models).await?;
            created += 1;
        }
    }
    runtime.cache_invalidator.invalidate_all().await;
    Ok(Json(ImportResult { created, updated }))
}

async fn export_channels(State(runtime): State<Arc<Runtime>>) -> Result<Response, ApiError> {
    let channels = runtime.store.list_channels().await?;
    let mut csv = String::from("name,url,priority,type,enabled,models\n");
    for channel in channels {
        let models = runtime.store.list_models(channel.id).await?;
        let models_cell = models.iter().map(|m| m.model.clone()).collect::<Vec<_>>().join(";");
        csv.push_str(&format!(
            "{},{},{},{},{},{}\n",
            channel.name,
            channel.url,
            channel.priority,
            channel.channel_type.as_str(),
            channel.enabled,
            models_cell,
        ));
    }
    Ok(([(axum::http::header::CONTENT_TYPE, "text/csv")], csv).into_response())
}
