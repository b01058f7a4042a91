use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Multipart, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use serde::{Deserialize, Deserializer, Serialize};

use super::files::FileManager;
use super::logbuf::LogBroadcast;
use super::models::{DeployRequest, DeploySource, ProcessState};
use super::pipeline::DeployPipeline;
use super::supervisor::ProcessSupervisor;
use crate::errors::{DeployError, FileError};

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub logs: Arc<LogBroadcast>,
    pub supervisor: Arc<ProcessSupervisor>,
    pub pipeline: Arc<DeployPipeline>,
    pub files: FileManager,
}

pub type SharedState = Arc<AppState>;

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitDeployRequest {
    #[serde(default)]
    pub repo_url: String,
    #[serde(default)]
    pub start_command: Option<String>,
    #[serde(default, deserialize_with = "flexible_bool")]
    pub install_deps: bool,
}

#[derive(Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub path: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteRequest {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub current_path: String,
}

#[derive(Serialize)]
pub struct ActionResponse {
    pub success: bool,
    pub message: String,
}

impl ActionResponse {
    fn ok(message: impl Into<String>) -> Json<Self> {
        Json(Self {
            success: true,
            message: message.into(),
        })
    }
}

#[derive(Serialize)]
pub struct StatusResponse {
    #[serde(flatten)]
    pub process: ProcessState,
    pub deploying: bool,
}

/// Accepts `true`/`false` as JSON booleans or as form-style strings.
fn flexible_bool<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum BoolOrString {
        Bool(bool),
        String(String),
    }

    match Option::<BoolOrString>::deserialize(deserializer)? {
        Some(BoolOrString::Bool(b)) => Ok(b),
        Some(BoolOrString::String(s)) => Ok(parse_flag(&s)),
        None => Ok(false),
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "true" | "1" | "on" | "yes")
}

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Forbidden(String),
    Conflict(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<FileError> for ApiError {
    fn from(err: FileError) -> Self {
        match err {
            FileError::PathEscape(e) => {
                tracing::warn!("rejected path outside the workspace");
                ApiError::Forbidden(e.to_string())
            }
            FileError::NotFound { .. } => ApiError::NotFound(err.to_string()),
            FileError::NotADirectory { .. } | FileError::CannotDeleteRoot | FileError::InvalidName(_) => {
                ApiError::BadRequest(err.to_string())
            }
            FileError::Io(e) => {
                tracing::error!("file operation failed: {}", e);
                ApiError::Internal(format!("File operation failed: {}", e.kind()))
            }
        }
    }
}

impl From<DeployError> for ApiError {
    fn from(err: DeployError) -> Self {
        match err {
            DeployError::AlreadyInProgress => ApiError::Conflict(err.to_string()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<axum::extract::multipart::MultipartError> for ApiError {
    fn from(err: axum::extract::multipart::MultipartError) -> Self {
        ApiError::BadRequest(format!("Invalid multipart body: {}", err.body_text()))
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/deploy/zip", post(deploy_archive))
        .route("/deploy/git", post(deploy_repository))
        .route("/files/list", get(list_files))
        .route("/files/upload", post(upload_file))
        .route("/files/delete", delete(delete_file))
        .route("/process/status", get(process_status))
        .route("/process/stop", post(stop_process))
        .route("/health", get(health_check))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn deploy_archive(
    State(state): State<SharedState>,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, ApiError> {
    if state.pipeline.is_deploying() {
        return Err(DeployError::AlreadyInProgress.into());
    }

    let mut archive: Option<Vec<u8>> = None;
    let mut start_command = None;
    let mut install_deps = false;
    while let Some(field) = multipart.next_field().await? {
        match field.name() {
            Some("file") => archive = Some(field.bytes().await?.to_vec()),
            Some("startCommand") => start_command = Some(field.text().await?),
            Some("installDeps") => install_deps = parse_flag(&field.text().await?),
            _ => {}
        }
    }
    let archive = match archive {
        Some(bytes) if !bytes.is_empty() => bytes,
        _ => return Err(ApiError::BadRequest("No archive uploaded".to_string())),
    };

    let staged = stage_archive(state.pipeline.staging_dir(), &archive)
        .await
        .map_err(|e| ApiError::from(DeployError::Staging(e)))?;

    let request = DeployRequest {
        source: DeploySource::Archive {
            staged: staged.clone(),
        },
        run_command: start_command,
        install_dependencies: install_deps,
    };
    if let Err(e) = state.pipeline.trigger(request) {
        let _ = tokio::fs::remove_file(&staged).await;
        return Err(e.into());
    }

    Ok((StatusCode::ACCEPTED, ActionResponse::ok("Deploy started.")))
}

async fn stage_archive(staging_dir: &std::path::Path, bytes: &[u8]) -> std::io::Result<std::path::PathBuf> {
    tokio::fs::create_dir_all(staging_dir).await?;
    let path = staging_dir.join(format!("deploy-{}.archive", uuid::Uuid::new_v4()));
    tokio::fs::write(&path, bytes).await?;
    Ok(path)
}

async fn deploy_repository(
    State(state): State<SharedState>,
    Json(req): Json<GitDeployRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let url = req.repo_url.trim();
    if url.is_empty() {
        return Err(ApiError::BadRequest("Repository URL is empty".to_string()));
    }
    if url.chars().any(char::is_control) {
        return Err(ApiError::BadRequest(
            "Repository URL contains control characters".to_string(),
        ));
    }

    let _deploy = state.pipeline.trigger(DeployRequest {
        source: DeploySource::Repository {
            url: url.to_string(),
        },
        run_command: req.start_command,
        install_dependencies: req.install_deps,
    })?;

    Ok((StatusCode::ACCEPTED, ActionResponse::ok("Git deploy started.")))
}

async fn list_files(
    State(state): State<SharedState>,
    Query(query): Query<ListQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let entries = state.files.list(&query.path).await?;
    Ok(Json(entries))
}

async fn upload_file(
    State(state): State<SharedState>,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, ApiError> {
    let mut file: Option<(String, Vec<u8>)> = None;
    let mut current_path = String::new();
    while let Some(field) = multipart.next_field().await? {
        match field.name() {
            Some("file") => {
                let name = field.file_name().unwrap_or_default().to_string();
                file = Some((name, field.bytes().await?.to_vec()));
            }
            Some("currentPath") => current_path = field.text().await?,
            _ => {}
        }
    }
    let Some((name, bytes)) = file else {
        return Err(ApiError::BadRequest("No file uploaded".to_string()));
    };

    let relative = state.files.upload(&current_path, &name, bytes).await?;
    Ok(ActionResponse::ok(format!("Uploaded {}", relative)))
}

async fn delete_file(
    State(state): State<SharedState>,
    Json(req): Json<DeleteRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let relative = state.files.delete(&req.current_path, &req.name).await?;
    Ok(ActionResponse::ok(format!("Deleted {}", relative)))
}

async fn process_status(State(state): State<SharedState>) -> impl IntoResponse {
    Json(StatusResponse {
        process: state.supervisor.status().await,
        deploying: state.pipeline.is_deploying(),
    })
}

async fn stop_process(State(state): State<SharedState>) -> impl IntoResponse {
    let outcome = state.supervisor.stop().await;
    tracing::info!(?outcome, "stop requested");
    ActionResponse::ok("Process stopped.")
}

// ── Tests ─────────────────────────────────────────────────────────────

#[cfg(test)]
pub(crate) fn test_state() -> (tempfile::TempDir, SharedState) {
    use super::sandbox::WorkspaceSandbox;
    use std::time::Duration;

    let dir = tempfile::tempdir().unwrap();
    let sandbox = WorkspaceSandbox::new(dir.path().join("workspace")).unwrap();
    let staging = dir.path().join("staging");
    let logs = Arc::new(LogBroadcast::new(100));
    let supervisor = Arc::new(
        ProcessSupervisor::new(sandbox.root(), Arc::clone(&logs))
            .with_stop_grace(Duration::from_millis(500)),
    );
    let pipeline = Arc::new(DeployPipeline::new(
        sandbox.root(),
        &staging,
        Arc::clone(&supervisor),
        Arc::clone(&logs),
    ));
    let files = FileManager::new(sandbox, &staging, Arc::clone(&logs));
    let state = Arc::new(AppState {
        logs,
        supervisor,
        pipeline,
        files,
    });
    (dir, state)
}
