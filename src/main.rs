use std::sync::Arc;

use anyhow::Context;
use tracing::info;
use tracing_subscriber::EnvFilter;

use hyperlocal_feed::{server, Config, FeedService};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "hyperlocal_feed=info,tower_http=warn".into()),
        )
        .init();

    let config = Config::from_env().context("failed to load configuration")?;
    let bind_addr = config.bind_addr;

    let service = Arc::new(FeedService::new(config));
    server::spawn_sweeper(Arc::clone(&service));
    let app = server::router(service);

    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;
    info!(addr = %bind_addr, "hyperlocal feed service listening");

    axum::serve(listener, app).await.context("server error")?;
    Ok(())
}
