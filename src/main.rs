use anyhow::{Context, Result};
use axum::Router;
use chunk_store::{
    config::AppConfig,
    routes::routes::routes,
    services::{
        chunk_store::FsChunkStore,
        metadata_index::SqliteMetadataIndex,
        storage_service::{StorageService, StoreSettings},
    },
};
use std::{fs, io::ErrorKind, path::Path, sync::Arc};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = AppConfig::from_env_and_args()?;

    tracing::info!("Starting chunk-store with config: {:?}", cfg);

    // --- Ensure storage directory exists ---
    if !Path::new(&cfg.storage_dir).exists() {
        fs::create_dir_all(&cfg.storage_dir)
            .with_context(|| format!("creating storage directory {}", cfg.storage_dir))?;
        tracing::info!("Created storage directory at {}", cfg.storage_dir);
    }

    // --- Initialize metadata index ---
    let db_url = &cfg.database_url;
    let db_path = db_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .trim_start_matches("file:");
    tracing::debug!("Interpreted SQLite path => {}", db_path);

    if let Some(parent) = Path::new(db_path).parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating database directory {:?}", parent))?;
            tracing::info!("Created missing directory {:?}", parent);
        }
    }

    let index = SqliteMetadataIndex::connect(db_url)
        .await
        .with_context(|| format!("connecting to {}", db_url))?;
    index.migrate().await.context("applying schema")?;

    // --- Handle migration mode ---
    if migrate {
        tracing::info!("Database migration complete.");
        return Ok(()); // exit after migration
    }

    // --- Initialize core service ---
    let storage = StorageService::new(
        Arc::new(index),
        Arc::new(FsChunkStore::new(&cfg.storage_dir)),
        StoreSettings {
            default_chunk_size: cfg.chunk_size,
            upload_ttl: cfg.upload_ttl(),
        },
    );

    // --- Reconcile leftovers from a previous run, then keep sweeping ---
    match storage.sweep().await {
        Ok(report) => tracing::info!(?report, "startup sweep finished"),
        Err(err) => tracing::warn!("startup sweep failed: {}", err),
    }
    let shutdown = CancellationToken::new();
    let sweeper = storage.spawn_sweeper(cfg.sweep_interval(), shutdown.clone());

    // --- Build router ---
    let app: Router = routes().with_state(storage);

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;

    shutdown.cancel();
    if let Err(err) = sweeper.await {
        tracing::warn!("sweeper task ended abnormally: {}", err);
    }
    tracing::info!("Server stopped");

    Ok(())
}

/// Resolve on Ctrl-C, cancelling `shutdown` so background tasks stop too.
async fn shutdown_signal(shutdown: CancellationToken) {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!("failed to listen for shutdown signal: {}", err);
        shutdown.cancelled().await;
        return;
    }
    tracing::info!("Shutdown requested");
    shutdown.cancel();
}
