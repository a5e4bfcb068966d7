//! Server assembly: construct the dependency struct, mount the router,
//! serve with graceful shutdown.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::api::{self, AppState, SharedState};
use crate::clients::music::MusicSource;
use crate::clients::replicate::{ReplicateClient, ReplicateImageModel, ReplicateVideoModel};
use crate::config::AppConfig;
use crate::deps::Deps;
use crate::media::MediaTools;
use crate::object_io::ObjectIO;
use crate::orchestrator::Orchestrator;
use crate::progress::ProgressChannel;
use crate::store::{Db, DbHandle};

/// Build the application router.
pub fn build_router(state: SharedState, dev_mode: bool) -> Router {
    let mut app = api::api_router().with_state(state);
    if dev_mode {
        app = app.layer(CorsLayer::permissive());
    }
    app
}

/// Wire every dependency from config + environment.
pub async fn build_deps(config: AppConfig) -> Result<Arc<Deps>> {
    if let Some(parent) = config.db_path.parent() {
        std::fs::create_dir_all(parent).context("Failed to create database directory")?;
    }
    let db = DbHandle::new(Db::new(&config.db_path).context("Failed to open database")?);

    let objects = match &config.blob_root {
        Some(root) => {
            std::fs::create_dir_all(root).context("Failed to create blob root")?;
            info!(root = %root.display(), "using local blob storage");
            ObjectIO::local(&config.s3_bucket, root)
        }
        None => ObjectIO::from_env(&config.s3_bucket, config.s3_endpoint.as_deref()).await,
    };

    let progress = ProgressChannel::new(&config.redis_url, config.presign_ttl);
    let media = MediaTools::new();

    let api_token = std::env::var("REPLICATE_API_TOKEN").unwrap_or_default();
    let replicate = ReplicateClient::new(api_token);
    let music = MusicSource::new(objects.clone(), media.clone(), config.music_prefix.clone());

    Ok(Arc::new(Deps {
        db,
        objects,
        progress,
        media,
        image_model: Arc::new(ReplicateImageModel::new(replicate.clone())),
        video_model: Arc::new(ReplicateVideoModel::new(replicate)),
        music,
        config,
    }))
}

/// Start the server and block until shutdown.
pub async fn start_server(config: AppConfig) -> Result<()> {
    let port = config.port;
    let dev_mode = config.dev_mode;
    let deps = build_deps(config).await?;
    let state = Arc::new(AppState {
        orchestrator: Orchestrator::new(deps),
    });

    let app = build_router(Arc::clone(&state), dev_mode);
    let host = if dev_mode { "0.0.0.0" } else { "127.0.0.1" };
    let addr = format!("{}:{}", host, port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    info!(addr = %listener.local_addr()?, "vidforge listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    state.orchestrator.shutdown().await;
    info!("server shut down");
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install Ctrl+C handler");
    info!("shutting down");
}
