//! LLM Load-Balancing Proxy — HTTP server entry point.

use llm_loadbalance_proxy::cache::ChannelCache;
use llm_loadbalance_proxy::config::Config;
use llm_loadbalance_proxy::log_pipeline::LogPipeline;
use llm_loadbalance_proxy::routes::{build_router, Runtime};
use llm_loadbalance_proxy::store::SqliteStore;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "llm_loadbalance_proxy=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("configuration error: {e}");
            std::process::exit(1);
        }
    };
    info!(port = config.port, db_path = %config.db_path, "configuration loaded");

    let store: Arc<dyn llm_loadbalance_proxy::store::Store> =
        match SqliteStore::new(std::path::PathBuf::from(&config.db_path)).await {
            Ok(s) => Arc::new(s),
            Err(e) => {
                eprintln!("store migration failed: {e}");
                std::process::exit(2);
            }
        };

    let cache = Arc::new(ChannelCache::new(Arc::clone(&store)));
    cache.warm_up().await;

    let http_client = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(30))
        .pool_max_idle_per_host(5)
        .pool_idle_timeout(Duration::from_secs(30))
        .danger_accept_invalid_certs(config.skip_tls_verify)
        // No global request timeout: it would apply to the full response
        // body, including streaming chunks, which would kill long-running
        // generations. Only the first-byte watchdog bounds latency here.
        .build()?;

    let shutting_down = Arc::new(AtomicBool::new(false));

    let (log_pipeline, log_handles) = LogPipeline::start(
        Arc::clone(&store),
        config.log_buffer_size,
        config.log_workers,
        config.log_retention_days,
        Arc::clone(&shutting_down),
    );
    let logs = Arc::new(log_pipeline);

    let runtime = Arc::new(Runtime::new(
        Arc::clone(&store),
        cache,
        &config,
        http_client,
        Arc::clone(&logs),
        Arc::clone(&shutting_down),
    ));

    spawn_admin_session_cleanup(Arc::clone(&store));

    let app = build_router(Arc::clone(&runtime));
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    info!(%addr, "starting server");
    let listener = tokio::net::TcpListener::bind(addr).await?;

    let shutdown_runtime = Arc::clone(&runtime);
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal(shutdown_runtime))
        .await?;

    logs.close();
    if tokio::time::timeout(Duration::from_millis(300), futures::future::join_all(log_handles))
        .await
        .is_err()
    {
        warn!("log pipeline workers did not drain within the shutdown deadline");
    }
    warn!("log pipeline dropped {} entries over process lifetime", logs.dropped_count());

    Ok(())
}

async fn shutdown_signal(runtime: Arc<Runtime>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received, draining in-flight requests");
    runtime.shutting_down.store(true, Ordering::Relaxed);
    tokio::time::sleep(Duration::from_millis(300)).await;
}

fn spawn_admin_session_cleanup(store: Arc<dyn llm_loadbalance_proxy::store::Store>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(3600));
        loop {
            ticker.tick().await;
            let now = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs() as i64;
            match store.delete_expired_admin_sessions(now).await {
                Ok(deleted) if deleted > 0 => info!(deleted, "pruned expired admin sessions"),
                Ok(_) => {}
                Err(e) => warn!(error = %e, "admin session cleanup failed"),
            }
        }
    });
}
