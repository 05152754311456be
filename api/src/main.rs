use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;

mod handlers;
mod routes;
mod state;

use common::bootstrap;
use common::webhook::{BackgroundSyncDispatcher, WebhookIngestor};
use state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    let settings = bootstrap::load_settings()?;
    bootstrap::init_observability(&settings)?;

    tracing::info!(
        host = %settings.server.host,
        port = %settings.server.port,
        "Starting webhook API server"
    );

    let store = bootstrap::init_store(&settings).await?;
    let engine = bootstrap::init_sync_engine(&settings, store.clone())?;
    let dispatcher = Arc::new(BackgroundSyncDispatcher::new(store, engine));
    let ingestor = WebhookIngestor::new(settings.webhook.secret.clone(), dispatcher);

    let addr = SocketAddr::from((
        settings.server.host.parse::<std::net::IpAddr>()?,
        settings.server.port,
    ));
    let app = routes::create_router(AppState::new(ingestor, settings));

    tracing::info!(addr = %addr, "Starting HTTP server");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(bootstrap::shutdown_signal())
        .await?;

    tracing::info!("API server stopped");
    Ok(())
}
