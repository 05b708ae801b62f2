// UnoBench server entry point

use anyhow::Context;
use std::net::SocketAddr;
use std::sync::Arc;
use unobench::config::ServerConfig;
use unobench::server::rate_limit::RateLimiter;
use unobench::server::{build_router, AppState};
use unobench::session::SessionManager;
use unobench::toolchain::gcc::GccToolchain;
use unobench::toolchain::Toolchain;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let config = ServerConfig::from_env();
    log::info!(
        "UnoBench starting (port {}, {:?}, compiler '{}')",
        config.port,
        config.env,
        config.compiler
    );
    if config.disable_rate_limit {
        log::warn!("rate limiting disabled");
    }

    let runtime_source =
        unobench::load_runtime_source(&config).context("loading Arduino runtime source")?;
    let toolchain: Arc<dyn Toolchain> = Arc::new(GccToolchain::new(&config.compiler));
    let manager = Arc::new(SessionManager::new(
        config.clone(),
        toolchain.clone(),
        runtime_source.clone(),
    ));

    let state = AppState {
        limiter: Arc::new(RateLimiter::new(config.rate_limit_per_minute)),
        config: Arc::new(config.clone()),
        manager,
        toolchain,
        runtime_source: Arc::new(runtime_source),
    };

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    log::info!("listening on {}", addr);

    axum::serve(
        listener,
        build_router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("server error")?;

    log::info!("clean shutdown");
    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        log::error!("failed to listen for shutdown signal");
        return;
    }
    log::info!("shutdown signal received");
}
