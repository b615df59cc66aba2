use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn, Level};
use tracing_subscriber::EnvFilter;

use marketplace_webhooks::{
    router, InMemoryStorage, ReqwestClient, Settings, Storage, WebhookService,
};

#[tokio::main]
async fn main() -> Result<()> {
    let settings = Settings::parse();

    let level = if settings.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(format!("marketplace_webhooks={level}"))),
        )
        .init();

    let storage = open_storage(&settings).await?;
    let config = settings.dispatcher_config();
    info!(
        workers = config.worker_count,
        queue_size = config.queue_size,
        "Starting webhook dispatcher"
    );

    let service = Arc::new(WebhookService::new(
        storage,
        Arc::new(ReqwestClient::new()),
        config,
    ));

    let listener = tokio::net::TcpListener::bind(settings.listen)
        .await
        .with_context(|| format!("failed to bind {}", settings.listen))?;
    info!(listen = %settings.listen, "Management API listening");

    axum::serve(listener, router(service.clone()))
        .with_graceful_shutdown(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = %err, "Failed to listen for ctrl-c");
            }
        })
        .await
        .context("management API failed")?;

    service.shutdown().await;
    Ok(())
}

#[cfg(feature = "postgres")]
async fn open_storage(settings: &Settings) -> Result<Arc<dyn Storage>> {
    use marketplace_webhooks::PostgresStorage;

    let Some(url) = settings.database_url.as_deref() else {
        warn!("No DATABASE_URL given; using in-memory storage");
        return Ok(Arc::new(InMemoryStorage::new()));
    };

    let (client, connection) = tokio_postgres::connect(url, tokio_postgres::NoTls)
        .await
        .context("failed to connect to postgres")?;
    tokio::spawn(async move {
        if let Err(err) = connection.await {
            tracing::error!(error = %err, "Postgres connection closed");
        }
    });

    let storage = PostgresStorage::new(client)
        .await
        .context("failed to prepare postgres schema")?;
    info!("Using postgres storage");
    Ok(Arc::new(storage))
}

#[cfg(not(feature = "postgres"))]
async fn open_storage(settings: &Settings) -> Result<Arc<dyn Storage>> {
    if settings.database_url.is_some() {
        warn!("DATABASE_URL ignored: built without the postgres feature");
    }
    info!("Using in-memory storage; pending retries are lost on exit");
    Ok(Arc::new(InMemoryStorage::new()))
}
