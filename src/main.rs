use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use rate_gate::{
    config::{LimiterConfig, LogFormat, StoreBackendConfig},
    gate::Gate,
    ratelimit::{RateLimiter, Store, in_memory::InMemoryStore, redis_backend::RedisStore},
    routes,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = LimiterConfig::from_env().context("failed to build limiter config")?;
    init_tracing(cfg.log_format);

    let store: Arc<dyn Store> = match &cfg.backend {
        StoreBackendConfig::InMemory => {
            tracing::warn!("using the in-memory store; counters are not shared between instances");
            Arc::new(InMemoryStore::new())
        }
        StoreBackendConfig::Redis(redis) => Arc::new(
            RedisStore::connect(redis)
                .await
                .context("failed to connect to redis")?,
        ),
    };

    let limiter = RateLimiter::new(store.clone(), cfg.anonymous, cfg.credentialed);
    let gate = Arc::new(Gate::new(limiter, &cfg.token_header, routes::service_routes()));
    let app = routes::app(gate, cfg.expose_diagnostics.then_some(store));

    let listener = TcpListener::bind(cfg.bind_addr)
        .await
        .context("failed to bind listener")?;

    tracing::info!(
        addr = %cfg.bind_addr,
        ip_limit = cfg.anonymous.limit,
        ip_block_seconds = cfg.anonymous.block_seconds,
        token_limit = cfg.credentialed.limit,
        token_block_seconds = cfg.credentialed.block_seconds,
        "rate limiter listening"
    );

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .await
        .context("server error")?;

    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,hyper=warn,redis=warn"));

    match format {
        LogFormat::Compact => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .compact()
            .init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .with_current_span(false)
            .with_span_list(false)
            .init(),
    }
}
