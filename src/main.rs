use anyhow::{Context, Result};
use file_store::{
    config::AppConfig,
    middleware::auth::ApiKey,
    routes::routes::routes,
    services::{
        file_service::FileService, metadata_store::SqliteMetadataStore,
        object_store::LocalObjectStore, validator::ContentValidator,
    },
    state::AppState,
};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::{io::ErrorKind, path::Path, str::FromStr, sync::Arc};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = AppConfig::from_env_and_args()?;

    tracing::info!(
        addr = %cfg.addr(),
        storage_dir = %cfg.storage_dir,
        bucket = %cfg.bucket,
        max_body_bytes = cfg.max_body_bytes,
        store_timeout_secs = cfg.store_timeout.as_secs(),
        "starting file-store"
    );

    // --- Initialize SQLite connection ---
    let db_url = &cfg.database_url;
    let db_path = db_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .trim_start_matches("file:");
    if let Some(parent) = Path::new(db_path).parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)?;
            tracing::info!("Created missing directory {:?}", parent);
        }
    }

    let options = SqliteConnectOptions::from_str(db_url)
        .with_context(|| format!("parsing database url `{}`", db_url))?
        .create_if_missing(true);
    let db = Arc::new(
        SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?,
    );

    let metadata = SqliteMetadataStore::new(db);
    metadata.migrate().await?;

    // --- Handle migration mode ---
    if migrate {
        tracing::info!("Database migration complete.");
        return Ok(());
    }

    // --- Initialize stores and service ---
    let objects = LocalObjectStore::new(&cfg.storage_dir, cfg.bucket.clone(), cfg.public_base_url.clone())
        .await
        .context("initializing object store")?;
    tokio::fs::create_dir_all(&cfg.staging_dir)
        .await
        .with_context(|| format!("creating staging dir {}", cfg.staging_dir.display()))?;

    let files = FileService::new(
        Arc::new(objects),
        Arc::new(metadata),
        ContentValidator::new(cfg.upload_policy.clone(), cfg.replace_policy.clone()),
        cfg.store_timeout,
    );
    let state = AppState::new(files, cfg.staging_dir.clone());

    // --- Build router ---
    let app = routes(state, ApiKey::new(cfg.api_key.as_str()), cfg.max_body_bytes);

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
    axum::serve(listener, app).await?;

    Ok(())
}
