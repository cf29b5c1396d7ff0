//! Runtime & Wiring (C12): the process-wide state threaded into every
//! handler, and the route table composed from the proxy and admin
//! surfaces.

use crate::auth::AuthGate;
use crate::cache::{CacheInvalidator, ChannelCache};
use crate::cooldown::CooldownManager;
use crate::forwarder::Forwarder;
use crate::log_pipeline::LogPipeline;
use crate::metrics::MetricsAggregator;
use crate::orchestrator::{Orchestrator, ProxyRequest};
use crate::selector::Selector;
use crate::store::Store;
use axum::body::Bytes;
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, Method, Uri};
use axum::response::Response;
use axum::routing::any;
use axum::Router;
use std::net::SocketAddr;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Process-wide state, constructed once in `main` and threaded into every
/// handler via `State<Arc<Runtime>>`. No component reaches for
/// global/thread-local state.
pub struct Runtime {
    pub store: Arc<dyn Store>,
    pub cache: Arc<ChannelCache>,
    /// The same cache, reached through its narrow invalidation port. Admin
    /// handlers invalidate through this, not the concrete type, so the
    /// store/cache dependency stays one-directional (see C2 in DESIGN.md).
    pub cache_invalidator: Arc<dyn CacheInvalidator>,
    pub metrics: MetricsAggregator,
    pub auth: Arc<AuthGate>,
    pub orchestrator: Orchestrator,
    pub shutting_down: Arc<AtomicBool>,
}

impl Runtime {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn Store>,
        cache: Arc<ChannelCache>,
        config: &crate::config::Config,
        http_client: reqwest::Client,
        logs: Arc<LogPipeline>,
        shutting_down: Arc<AtomicBool>,
    ) -> Self {
        let selector = Selector::new(Arc::clone(&cache));
        let cooldowns = CooldownManager::new(Arc::clone(&store));
        let forwarder = Forwarder::new(http_client, config.first_byte_timeout_secs);
        let auth = Arc::new(AuthGate::new(Arc::clone(&store), config));
        let admission = Arc::new(Semaphore::new(config.max_concurrency));

        let orchestrator = Orchestrator::new(
            Arc::clone(&store),
            selector,
            cooldowns,
            forwarder,
            Arc::clone(&auth),
            logs,
            admission,
            config.max_key_retries,
            Arc::clone(&shutting_down),
        );

        let cache_invalidator: Arc<dyn CacheInvalidator> = Arc::clone(&cache);

        Self {
            metrics: MetricsAggregator::new(Arc::clone(&store)),
            store,
            cache,
            cache_invalidator,
            auth,
            orchestrator,
            shutting_down,
        }
    }
}

pub fn build_router(runtime: Arc<Runtime>) -> Router {
    let admin_routes = crate::admin::routes();

    Router::new()
        .nest("/admin", admin_routes)
        .fallback(any(proxy_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(runtime)
}

async fn proxy_handler(
    State(runtime): State<Arc<Runtime>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let path_and_query = uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| uri.path().to_string());

    let req = ProxyRequest {
        method,
        path_and_query,
        headers,
        body,
        client_ip: Some(addr.ip()),
    };
    runtime.orchestrator.handle(req).await
}
