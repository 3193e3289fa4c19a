// src/server.rs

use axum::{
    body::Body,
    extract::{rejection::JsonRejection, Path as AxumPath, State},
    http::{header, HeaderValue, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::io::ReaderStream;

use crate::downloader::{EngineError, MediaInfo};
use crate::manager::{JobManager, ManagerError};
use crate::models::JobRecord;
use crate::settings::Settings;

const INDEX_HTML: &str = include_str!("../assets/index.html");

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<JobManager>,
}

/// A JSON error response: `{"error": message}` with a status code.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    body: Value,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            body: json!({ "error": message.into() }),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::bad_request(format!("Invalid request body: {}", rejection.body_text()))
    }
}

type ApiResult<T> = Result<T, ApiError>;

pub fn router(manager: Arc<JobManager>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/api/analyze", post(analyze))
        .route("/api/download", post(start_download))
        .route("/api/download/{id}", get(get_download))
        .route("/api/downloads", get(list_downloads))
        .route("/api/settings", get(get_settings).post(save_settings))
        .route("/download/{*filepath}", get(serve_file))
        .with_state(AppState { manager })
}

async fn index() -> impl IntoResponse {
    (
        [(header::CACHE_CONTROL, "no-cache, no-store, must-revalidate")],
        Html(INDEX_HTML),
    )
}

#[derive(Debug, Deserialize)]
struct AnalyzeRequest {
    #[serde(default)]
    url: String,
}

async fn analyze(
    State(state): State<AppState>,
    payload: Result<Json<AnalyzeRequest>, JsonRejection>,
) -> ApiResult<Json<MediaInfo>> {
    let Json(request) = payload?;
    match state.manager.analyze(&request.url).await {
        Ok(info) => Ok(Json(info)),
        Err(ManagerError::InvalidRequest(message)) => Err(ApiError::bad_request(message)),
        Err(ManagerError::Engine(EngineError::Reported(message))) => Err(ApiError::bad_request(
            format!("Video platform error: {message}"),
        )),
        Err(e) => Err(ApiError::internal(format!("Analysis failed: {e}"))),
    }
}

#[derive(Debug, Deserialize)]
struct DownloadRequest {
    url: Option<String>,
    format_id: Option<String>,
    filename: Option<String>,
}

async fn start_download(
    State(state): State<AppState>,
    payload: Result<Json<DownloadRequest>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let Json(request) = payload?;
    let (Some(url), Some(format_id)) = (request.url, request.format_id) else {
        return Err(ApiError::bad_request("URL and format_id are required"));
    };
    let filename = request.filename.unwrap_or_else(|| "download".to_string());

    match state.manager.start_download(&url, &format_id, &filename).await {
        Ok(id) => Ok(Json(json!({
            "status": "started",
            "download_id": id,
            "message": "Download has been started",
        }))),
        Err(ManagerError::InvalidRequest(message)) => Err(ApiError::bad_request(message)),
        Err(e) => Err(ApiError::internal(format!("Download failed: {e}"))),
    }
}

async fn get_download(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> ApiResult<Json<JobRecord>> {
    match state.manager.get_job(&id).await {
        Ok(job) => Ok(Json(job)),
        Err(ManagerError::JobNotFound(_)) => Err(ApiError::new(StatusCode::NOT_FOUND, "Download not found")),
        Err(e) => Err(ApiError::internal(e.to_string())),
    }
}

async fn list_downloads(State(state): State<AppState>) -> Json<Vec<JobRecord>> {
    Json(state.manager.list_jobs().await)
}

async fn get_settings(State(state): State<AppState>) -> Json<Settings> {
    Json(state.manager.settings().await)
}

/// Keys present in the body replace the current values; absent keys are
/// left alone.
async fn save_settings(
    State(state): State<AppState>,
    payload: Result<Json<Value>, JsonRejection>,
) -> Response {
    let failed = |message: String| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "status": "error", "message": message })),
        )
            .into_response()
    };

    let Json(patch) = match payload {
        Ok(body) => body,
        Err(rejection) => return ApiError::from(rejection).into_response(),
    };
    let Some(patch) = patch.as_object() else {
        return ApiError::bad_request("Settings must be a JSON object").into_response();
    };

    let mut merged = match serde_json::to_value(state.manager.settings().await) {
        Ok(value) => value,
        Err(e) => return failed(format!("Failed to save settings: {e}")),
    };
    if let Some(current) = merged.as_object_mut() {
        for (key, value) in patch {
            current.insert(key.clone(), value.clone());
        }
    }
    let settings: Settings = match serde_json::from_value(merged) {
        Ok(settings) => settings,
        Err(e) => return ApiError::bad_request(format!("Invalid settings: {e}")).into_response(),
    };

    match state.manager.save_settings(settings).await {
        Ok(()) => Json(json!({
            "status": "success",
            "message": "Settings saved successfully",
        }))
        .into_response(),
        Err(e) => {
            tracing::warn!("saving settings failed: {e}");
            failed("Failed to save settings".to_string())
        }
    }
}

/// Resolves a requested path to a servable file: anything inside `root`,
/// or the recorded output of a completed job wherever it was written.
async fn resolve_servable(manager: &JobManager, requested: &str) -> Option<PathBuf> {
    let root = manager.download_dir().await;
    let requested = PathBuf::from(requested);
    let candidate = if requested.is_absolute() {
        requested
    } else {
        root.join(requested)
    };
    let candidate = tokio::fs::canonicalize(candidate).await.ok()?;
    if !tokio::fs::metadata(&candidate).await.ok()?.is_file() {
        return None;
    }

    if let Ok(root) = tokio::fs::canonicalize(&root).await {
        if candidate.starts_with(&root) {
            return Some(candidate);
        }
    }
    for output in manager.completed_outputs().await {
        if tokio::fs::canonicalize(&output).await.ok().as_ref() == Some(&candidate) {
            return Some(candidate);
        }
    }
    None
}

async fn serve_file(
    State(state): State<AppState>,
    AxumPath(filepath): AxumPath<String>,
) -> ApiResult<Response> {
    let not_found = || ApiError::new(StatusCode::NOT_FOUND, "File not found");
    let path = resolve_servable(&state.manager, &filepath)
        .await
        .ok_or_else(not_found)?;

    let file = tokio::fs::File::open(&path).await.map_err(|_| not_found())?;
    let len = file
        .metadata()
        .await
        .map_err(|e| ApiError::internal(format!("File serving error: {e}")))?
        .len();
    let mime = mime_guess::from_path(&path).first_or_octet_stream();
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().replace('"', ""))
        .unwrap_or_else(|| "download".to_string());
    let disposition = HeaderValue::from_str(&format!("attachment; filename=\"{name}\""))
        .unwrap_or_else(|_| HeaderValue::from_static("attachment"));

    Response::builder()
        .header(header::CONTENT_TYPE, mime.as_ref())
        .header(header::CONTENT_DISPOSITION, disposition)
        .header(header::CONTENT_LENGTH, len)
        .body(Body::from_stream(ReaderStream::new(file)))
        .map_err(|e| ApiError::internal(format!("File serving error: {e}")))
}
