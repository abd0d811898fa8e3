//! HTTP playback and metadata API
//!
//! Authentication happens upstream. The auth layer forwards the caller's
//! camera capability in the `x-camera-scope` header: `*` for every camera or
//! a comma-separated list of camera ids.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, patch};
use axum::{Json, Router};
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveTime, Offset, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::broadcast;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::clock::parse_day_key;
use crate::error::{ContainerError, CryptoError, RangeError, Result, SinkError, VaultError};
use crate::format::ContainerReader;
#[cfg(feature = "metrics")]
use crate::metrics::VaultMetrics;
use crate::playback::{PlaybackResponse, RangeStreamReader, Source};
use crate::sink::{MetadataIndex, StorageHandle, VideoMetadata, VideoQuery};

/// Header carrying the caller's camera capability
pub const SCOPE_HEADER: &str = "x-camera-scope";

/// Cameras a caller may view
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CameraScope {
    All,
    Cameras(Vec<String>),
}

impl CameraScope {
    pub fn from_headers(headers: &HeaderMap) -> std::result::Result<Self, ApiError> {
        let raw = headers
            .get(SCOPE_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| ApiError::new(StatusCode::UNAUTHORIZED, "Missing camera scope"))?;

        if raw == "*" {
            return Ok(Self::All);
        }
        let cameras = raw
            .split(',')
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(str::to_string)
            .collect();
        Ok(Self::Cameras(cameras))
    }

    pub fn allows(&self, camera_id: &str) -> bool {
        match self {
            Self::All => true,
            Self::Cameras(cameras) => cameras.iter().any(|c| c == camera_id),
        }
    }

    /// Camera filter for index queries; `None` means unrestricted
    pub fn cameras(&self) -> Option<Vec<String>> {
        match self {
            Self::All => None,
            Self::Cameras(cameras) => Some(cameras.clone()),
        }
    }

    fn check(&self, camera_id: &str) -> std::result::Result<(), ApiError> {
        if self.allows(camera_id) {
            Ok(())
        } else {
            Err(ApiError::new(StatusCode::FORBIDDEN, "Camera not in scope"))
        }
    }
}

/// JSON error response
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
    content_range: Option<String>,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self { status, message: message.into(), content_range: None }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<VaultError> for ApiError {
    fn from(err: VaultError) -> Self {
        match err {
            VaultError::Range(RangeError::Malformed { .. }) => Self::new(StatusCode::BAD_REQUEST, "Malformed range"),
            VaultError::Range(RangeError::Unsatisfiable { total, .. }) => Self {
                status: StatusCode::RANGE_NOT_SATISFIABLE,
                message: "Range not satisfiable".to_string(),
                content_range: Some(format!("bytes */{}", total)),
            },
            VaultError::NotFound { what } => {
                debug!("Not found: {}", what);
                Self::new(StatusCode::NOT_FOUND, "Video not found")
            }
            VaultError::Sink(SinkError::NotFound { .. })
            | VaultError::Container(ContainerError::NoChunkAtOffset { .. }) => {
                Self::new(StatusCode::NOT_FOUND, "Video not found")
            }
            VaultError::Sink(SinkError::InvalidHandle { .. }) => Self::new(StatusCode::BAD_REQUEST, "Invalid video id"),
            VaultError::Crypto(CryptoError::IntegrityFailure) => {
                error!("Playback refused: stored ciphertext failed authentication");
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
            }
            other => {
                error!("Request failed ({}): {}", other.category(), other);
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
            }
        }
    }
}

/// Map a playback failure, naming the sealed source when it failed authentication
fn playback_error(err: VaultError, source: &str) -> ApiError {
    if let VaultError::Crypto(CryptoError::IntegrityFailure) = err {
        error!("Playback refused: stored ciphertext of {} failed authentication", source);
        return ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error");
    }
    err.into()
}

impl From<SinkError> for ApiError {
    fn from(err: SinkError) -> Self {
        VaultError::from(err).into()
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut response = (self.status, Json(json!({ "error": self.message }))).into_response();
        if let Some(value) = self.content_range.and_then(|v| HeaderValue::from_str(&v).ok()) {
            response.headers_mut().insert(header::CONTENT_RANGE, value);
        }
        response
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

/// Shared state behind every handler
pub struct AppState {
    reader: RangeStreamReader,
    index: Arc<dyn MetadataIndex>,
    container_dir: PathBuf,
    container_extension: String,
    offset: FixedOffset,
    #[cfg(feature = "metrics")]
    metrics: Option<Arc<VaultMetrics>>,
}

impl AppState {
    pub fn new(
        reader: RangeStreamReader,
        index: Arc<dyn MetadataIndex>,
        container_dir: PathBuf,
        container_extension: &str,
        utc_offset_minutes: i32,
    ) -> Self {
        let offset = FixedOffset::east_opt(utc_offset_minutes * 60).unwrap_or_else(|| {
            warn!("UTC offset of {} minutes is out of range, using UTC", utc_offset_minutes);
            Utc.fix()
        });
        Self {
            reader,
            index,
            container_dir,
            container_extension: container_extension.trim_start_matches('.').to_string(),
            offset,
            #[cfg(feature = "metrics")]
            metrics: None,
        }
    }

    /// Serve `metrics` on `GET /metrics` and count refused playbacks in it
    #[cfg(feature = "metrics")]
    pub fn with_metrics(mut self, metrics: Arc<VaultMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    fn playback_error(&self, err: VaultError, source: &str) -> ApiError {
        #[cfg(feature = "metrics")]
        if let (Some(metrics), true) = (&self.metrics, err.is_integrity_failure()) {
            metrics.record_integrity_failure();
        }
        playback_error(err, source)
    }

    fn container_path(&self, day: &str) -> ApiResult<PathBuf> {
        if parse_day_key(day).is_none() {
            return Err(ApiError::new(StatusCode::BAD_REQUEST, "Invalid day, use YYYY-MM-DD"));
        }
        let path = self.container_dir.join(format!("{}.{}", day, self.container_extension));
        if !path.is_file() {
            return Err(ApiError::new(StatusCode::NOT_FOUND, "Container not found"));
        }
        Ok(path)
    }
}

type SharedState = Arc<AppState>;

/// Build the API router
pub fn router(state: AppState) -> Router {
    let routes = Router::new()
        .route("/health", get(health))
        .route("/videos/search", get(search_videos))
        .route("/videos/:handle", get(play_video))
        .route("/videos/:handle/plates", patch(add_plate))
        .route("/containers/:day", get(list_container))
        .route("/containers/:day/chunks/:offset", get(play_chunk))
        .route("/containers/:day/stream", get(stream_container));
    #[cfg(feature = "metrics")]
    let routes = routes.route("/metrics", get(metrics));

    routes.layer(TraceLayer::new_for_http()).with_state(Arc::new(state))
}

/// Serve until the shutdown signal fires, then drain open connections
pub async fn serve(state: AppState, addr: SocketAddr, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Playback server listening on {}", listener.local_addr()?);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
            info!("Playback server shutting down");
        })
        .await?;
    Ok(())
}

#[cfg(feature = "metrics")]
async fn metrics(State(state): State<SharedState>) -> ApiResult<Response> {
    let metrics = state
        .metrics
        .as_ref()
        .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, "Metrics disabled"))?;
    let body = metrics.render().map_err(VaultError::from)?;
    let headers = [(header::CONTENT_TYPE, HeaderValue::from_static("text/plain; version=0.0.4"))];
    Ok((StatusCode::OK, headers, body).into_response())
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

#[derive(Debug, Default, Deserialize)]
pub struct SearchParams {
    plate: Option<String>,
    camera_id: Option<String>,
    date: Option<String>,
    start_time: Option<String>,
    end_time: Option<String>,
}

#[derive(Debug, Serialize)]
struct SearchHit {
    video_id: String,
    filename: String,
    camera_id: String,
    upload_date_local: String,
    plates_found: Vec<String>,
    file_size: u64,
}

impl SearchParams {
    /// Upload window in UTC for a local date, optionally narrowed to a time span
    fn window(&self, offset: &FixedOffset) -> ApiResult<Option<(DateTime<Utc>, DateTime<Utc>)>> {
        let Some(date) = self.date.as_deref().filter(|d| !d.is_empty()) else {
            return Ok(None);
        };
        let invalid = || ApiError::new(StatusCode::BAD_REQUEST, "Invalid format. Use date YYYY-MM-DD, time HH:MM:SS");
        let date = NaiveDate::parse_from_str(date, "%Y-%m-%d").map_err(|_| invalid())?;

        let (start, end) = match (self.start_time.as_deref(), self.end_time.as_deref()) {
            (Some(start), Some(end)) => {
                let start = NaiveTime::parse_from_str(start, "%H:%M:%S").map_err(|_| invalid())?;
                let end = NaiveTime::parse_from_str(end, "%H:%M:%S").map_err(|_| invalid())?;
                (date.and_time(start), date.and_time(end))
            }
            _ => {
                let midnight = date.and_time(NaiveTime::MIN);
                (midnight, midnight + chrono::Duration::days(1))
            }
        };

        let to_utc = |local| {
            offset
                .from_local_datetime(&local)
                .single()
                .map(|dt| dt.with_timezone(&Utc))
                .ok_or_else(invalid)
        };
        Ok(Some((to_utc(start)?, to_utc(end)?)))
    }
}

async fn search_videos(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(params): Query<SearchParams>,
) -> ApiResult<Json<serde_json::Value>> {
    let scope = CameraScope::from_headers(&headers)?;
    let camera_id = params.camera_id.clone().filter(|c| !c.is_empty());
    if let Some(camera) = &camera_id {
        scope.check(camera)?;
    }

    let window = params.window(&state.offset)?;
    let query = VideoQuery {
        plate: params.plate.clone().filter(|p| !p.trim().is_empty()),
        camera_id,
        cameras: scope.cameras(),
        from: window.map(|(from, _)| from),
        until: window.map(|(_, until)| until),
        limit: None,
    };

    let results: Vec<SearchHit> = state
        .index
        .find(&query)?
        .into_iter()
        .map(|record| SearchHit {
            video_id: record.storage_handle.to_string(),
            upload_date_local: record
                .upload_date
                .with_timezone(&state.offset)
                .format("%Y-%m-%d %H:%M:%S")
                .to_string(),
            filename: record.filename,
            camera_id: record.camera_id,
            plates_found: record.plate_numbers,
            file_size: record.file_size,
        })
        .collect();

    debug!("Search matched {} videos", results.len());
    Ok(Json(json!({ "count": results.len(), "results": results })))
}

fn range_header(headers: &HeaderMap) -> ApiResult<Option<&str>> {
    match headers.get(header::RANGE) {
        None => Ok(None),
        Some(value) => value
            .to_str()
            .map(Some)
            .map_err(|_| ApiError::new(StatusCode::BAD_REQUEST, "Malformed range")),
    }
}

fn playback_response(playback: PlaybackResponse) -> Response {
    let status = playback.status();
    let headers = playback.headers();
    (status, headers, Body::from_stream(playback.body)).into_response()
}

fn lookup_video(state: &AppState, scope: &CameraScope, raw: &str) -> ApiResult<VideoMetadata> {
    let handle = StorageHandle::parse(raw)?;
    let record = state
        .index
        .get(&handle)?
        .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, "Video not found"))?;
    scope.check(&record.camera_id)?;
    Ok(record)
}

async fn play_video(
    State(state): State<SharedState>,
    Path(handle): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let scope = CameraScope::from_headers(&headers)?;
    let record = lookup_video(&state, &scope, &handle)?;
    let label = format!("video {}", record.storage_handle);
    let source = Source::Remote { handle: record.storage_handle, format: record.format };

    let range = range_header(&headers)?;
    let playback = state.reader.open(source, range).await.map_err(|e| state.playback_error(e, &label))?;
    Ok(playback_response(playback))
}

#[derive(Debug, Deserialize)]
pub struct PlateUpdate {
    #[serde(alias = "plate_numbers")]
    plate_number: String,
}

async fn add_plate(
    State(state): State<SharedState>,
    Path(handle): Path<String>,
    headers: HeaderMap,
    Json(update): Json<PlateUpdate>,
) -> ApiResult<Json<serde_json::Value>> {
    let scope = CameraScope::from_headers(&headers)?;
    if update.plate_number.trim().is_empty() {
        return Err(ApiError::new(StatusCode::BAD_REQUEST, "No plate number provided"));
    }
    let record = lookup_video(&state, &scope, &handle)?;

    if !state.index.append_plate(&record.storage_handle, &update.plate_number)? {
        return Err(ApiError::new(StatusCode::NOT_FOUND, "Video not found"));
    }
    info!("Added plate to {}", record.storage_handle);
    Ok(Json(json!({ "message": "Plate added to metadata" })))
}

#[derive(Debug, Serialize)]
struct ChunkSummary {
    offset: u64,
    filename: String,
    timestamp: DateTime<Utc>,
    file_size: u64,
    duration_est_min: u32,
}

async fn list_container(
    State(state): State<SharedState>,
    Path(day): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Json<serde_json::Value>> {
    let scope = CameraScope::from_headers(&headers)?;
    let path = state.container_path(&day)?;

    let scan = tokio::task::spawn_blocking(move || ContainerReader::open(&path).map(ContainerReader::scan))
        .await
        .map_err(|e| VaultError::Generic(format!("scan task failed: {}", e)))??;
    scope.check(&scan.day_header.camera_id)?;

    let chunks: Vec<ChunkSummary> = scan
        .frames
        .iter()
        .map(|frame| ChunkSummary {
            offset: frame.offset,
            filename: frame.header.original_filename.clone(),
            timestamp: frame.header.timestamp,
            file_size: frame.header.plaintext_size,
            duration_est_min: frame.header.duration_estimate,
        })
        .collect();
    Ok(Json(json!({
        "date": scan.day_header.date,
        "camera_id": scan.day_header.camera_id,
        "chunks": chunks,
        "truncated": !scan.is_clean(),
    })))
}

async fn container_camera(path: PathBuf) -> ApiResult<String> {
    let camera = tokio::task::spawn_blocking(move || {
        ContainerReader::open(&path).map(|reader| reader.day_header().camera_id.clone())
    })
    .await
    .map_err(|e| VaultError::Generic(format!("open task failed: {}", e)))??;
    Ok(camera)
}

async fn play_chunk(
    State(state): State<SharedState>,
    Path((day, offset)): Path<(String, u64)>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let scope = CameraScope::from_headers(&headers)?;
    let path = state.container_path(&day)?;
    scope.check(&container_camera(path.clone()).await?)?;

    let label = format!("chunk at offset {} of {}", offset, path.display());
    let range = range_header(&headers)?;
    let playback = state
        .reader
        .open(Source::Container { path, offset }, range)
        .await
        .map_err(|e| state.playback_error(e, &label))?;
    Ok(playback_response(playback))
}

async fn stream_container(
    State(state): State<SharedState>,
    Path(day): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let scope = CameraScope::from_headers(&headers)?;
    let path = state.container_path(&day)?;
    scope.check(&container_camera(path.clone()).await?)?;

    let body = state.reader.stream_container(path)?;
    let headers = [
        (header::CONTENT_TYPE, HeaderValue::from_static("video/mp4")),
        (header::ACCEPT_RANGES, HeaderValue::from_static("none")),
    ];
    Ok((StatusCode::OK, headers, Body::from_stream(body)).into_response())
}
