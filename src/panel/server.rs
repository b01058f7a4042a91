use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{Router, extract::DefaultBodyLimit, routing::get};
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;

use super::api::{self, AppState, SharedState};
use super::files::FileManager;
use super::logbuf::LogBroadcast;
use super::pipeline::{DeployDefaults, DeployPipeline};
use super::sandbox::WorkspaceSandbox;
use super::supervisor::{NoiseFilter, ProcessSupervisor};
use super::ws;
use crate::config::PanelConfig;

/// Configuration for the panel server.
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub public_dir: Option<PathBuf>,
    pub permissive_cors: bool,
    pub max_upload_bytes: usize,
}

impl From<&PanelConfig> for ServerConfig {
    fn from(config: &PanelConfig) -> Self {
        Self {
            host: config.server.host.clone(),
            port: config.server.port,
            public_dir: config.server.public_dir.clone(),
            permissive_cors: config.server.permissive_cors,
            max_upload_bytes: config.server.max_upload_bytes,
        }
    }
}

/// Wire the log buffer, supervisor, pipeline and file manager together.
pub fn build_state(config: &PanelConfig) -> Result<SharedState> {
    let sandbox = WorkspaceSandbox::new(&config.workspace.root)?;
    std::fs::create_dir_all(&config.workspace.staging_dir).with_context(|| {
        format!(
            "Failed to create staging directory {}",
            config.workspace.staging_dir.display()
        )
    })?;

    let noise = NoiseFilter::new(&config.process.noise_patterns)
        .context("Invalid process.noise_patterns")?;
    let logs = Arc::new(LogBroadcast::new(config.logs.capacity));
    let supervisor = Arc::new(
        ProcessSupervisor::new(sandbox.root(), Arc::clone(&logs))
            .with_noise_filter(noise)
            .with_stop_grace(config.process.stop_grace()),
    );
    let pipeline = Arc::new(
        DeployPipeline::new(
            sandbox.root(),
            &config.workspace.staging_dir,
            Arc::clone(&supervisor),
            Arc::clone(&logs),
        )
        .with_defaults(DeployDefaults {
            run_command: config.process.run_command.clone(),
            install_command: config.process.install_command.clone(),
            install_timeout: config.process.install_timeout(),
        }),
    );
    let files = FileManager::new(sandbox, &config.workspace.staging_dir, Arc::clone(&logs));

    Ok(Arc::new(AppState {
        logs,
        supervisor,
        pipeline,
        files,
    }))
}

/// Build the full application router: API, WebSocket, optional static files.
pub fn build_router(state: SharedState, config: &ServerConfig) -> Router {
    let mut app = api::api_router().route("/ws", get(ws::ws_handler));

    if let Some(public_dir) = &config.public_dir {
        app = app.fallback_service(ServeDir::new(public_dir));
    }

    let mut app = app
        .layer(DefaultBodyLimit::max(config.max_upload_bytes))
        .with_state(state);

    if config.permissive_cors {
        app = app.layer(CorsLayer::permissive());
    }
    app
}

/// Start the panel server and run until Ctrl+C.
pub async fn start_server(config: PanelConfig) -> Result<()> {
    let state = build_state(&config)?;
    let server_config = ServerConfig::from(&config);
    let app = build_router(Arc::clone(&state), &server_config);

    let addr = format!("{}:{}", server_config.host, server_config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    tracing::info!(
        workspace = %state.files.sandbox().root().display(),
        "Deploy panel running at http://{}",
        local_addr
    );
    state
        .logs
        .success(format!("Panel online on port {}.", local_addr.port()));

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    state.supervisor.stop().await;
    tracing::info!("Server shut down gracefully.");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to install Ctrl+C handler: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutting down...");
}

// ── Tests ─────────────────────────────────────────────────────────────
