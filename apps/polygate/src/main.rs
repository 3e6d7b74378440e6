use anyhow::Result;
use tracing_subscriber::EnvFilter;

mod bootstrap;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let boot = bootstrap::bootstrap().await?;

    // Adapter warmup runs in the background so a slow upstream cannot delay
    // the listener.
    let warmup_engine = boot.engine.clone();
    tokio::spawn(async move { warmup_engine.warmup().await });
    bootstrap::spawn_background(boot.engine.clone());

    let app = polygate_router::gateway_router(boot.engine.clone());
    let listener = tokio::net::TcpListener::bind(&boot.bind).await?;
    tracing::info!(event = "listening", bind = %boot.bind);
    axum::serve(listener, app).await?;
    Ok(())
}
