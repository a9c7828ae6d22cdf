//! Dashboard HTTP handlers: the cached archive API, per-camera proxies,
//! and the label/delete curation endpoints.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use actix_web::{
    HttpRequest, HttpResponse,
    http::header,
    web::{self, Bytes},
};
use chrono::{NaiveDateTime, Utc};
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tracing::warn;

use crate::dashboard::cache::DetectionCache;
use crate::dashboard::config::DashboardConfig;
use crate::dashboard::html;
use crate::dashboard::monitor::MonitorState;
use crate::dashboard::stats::CpuSampler;
use crate::camera::twilight::twilight_window;
use crate::store;
use crate::telemetry;

const SNAPSHOT_TIMEOUT: Duration = Duration::from_secs(5);
const RESTART_TIMEOUT: Duration = Duration::from_secs(10);

pub struct DashboardState {
    pub config: Arc<DashboardConfig>,
    pub cache: Arc<DetectionCache>,
    pub monitor: Arc<MonitorState>,
    /// Short-request client (stats, snapshots, restarts).
    pub http: reqwest::Client,
    /// Long-lived stream client with a generous read timeout.
    pub stream_http: reqwest::Client,
    pub sampler: CpuSampler,
}

type State = web::Data<DashboardState>;

fn camera_url(state: &State, index: usize) -> Option<String> {
    state.config.camera(index).map(|cam| cam.url.clone())
}

fn camera_dir_checked(state: &State, camera: &str) -> Option<PathBuf> {
    state
        .config
        .cameras
        .iter()
        .find(|cam| cam.name == camera)
        .map(|cam| state.config.camera_dir(&cam.name))
}

pub async fn index(state: State) -> HttpResponse {
    HttpResponse::Ok()
        .insert_header((header::CACHE_CONTROL, "no-store"))
        .content_type("text/html; charset=utf-8")
        .body(html::dashboard_page(&state.config.cameras))
}

pub async fn detections(state: State) -> HttpResponse {
    let snapshot = state.cache.snapshot();
    HttpResponse::Ok()
        .insert_header((header::CACHE_CONTROL, "no-store"))
        .json(json!({"total": snapshot.total, "recent": snapshot.recent}))
}

pub async fn detections_mtime(state: State) -> HttpResponse {
    let snapshot = state.cache.snapshot();
    HttpResponse::Ok()
        .insert_header((header::CACHE_CONTROL, "no-store"))
        .json(json!({"mtime": snapshot.mtime}))
}

#[derive(Deserialize)]
pub struct LabelRequest {
    camera: String,
    timestamp: String,
    #[serde(default)]
    label: String,
}

pub async fn set_detection_label(state: State, body: web::Json<LabelRequest>) -> HttpResponse {
    let label = body.label.trim();
    if !store::is_allowed_label(label) {
        return HttpResponse::BadRequest().json(json!({
            "success": false,
            "error": format!("unknown label {label:?}"),
        }));
    }
    let Some(dir) = camera_dir_checked(&state, &body.camera) else {
        return HttpResponse::BadRequest().json(json!({
            "success": false,
            "error": "unknown camera",
        }));
    };
    if body.timestamp.is_empty() {
        return HttpResponse::BadRequest().json(json!({
            "success": false,
            "error": "timestamp is required",
        }));
    }

    if let Err(err) = store::upsert_label(&dir, &body.timestamp, label) {
        return HttpResponse::InternalServerError().json(json!({
            "success": false,
            "error": err.to_string(),
        }));
    }
    state.cache.refresh(true);
    HttpResponse::Ok().json(json!({
        "success": true,
        "camera": body.camera,
        "timestamp": body.timestamp,
        "label": label,
    }))
}

pub async fn delete_detection(
    state: State,
    path: web::Path<(String, String)>,
) -> HttpResponse {
    let (camera, display_time) = path.into_inner();
    let Some(dir) = camera_dir_checked(&state, &camera) else {
        return HttpResponse::NotFound().json(json!({"success": false, "error": "unknown camera"}));
    };
    let Ok(wall) = NaiveDateTime::parse_from_str(&display_time, "%Y-%m-%d %H:%M:%S") else {
        return HttpResponse::BadRequest().json(json!({
            "success": false,
            "error": "timestamp must be YYYY-MM-DD HH:MM:SS",
        }));
    };

    let base_name = format!("meteor_{}", wall.format("%Y%m%d_%H%M%S"));
    let prefix = wall.format("%Y-%m-%dT%H:%M:%S").to_string();

    let deleted_files = store::delete_event_files(&dir, &base_name);
    let removed_lines = match store::remove_detection_lines(&dir, &prefix) {
        Ok(count) => count,
        Err(err) => {
            return HttpResponse::InternalServerError()
                .json(json!({"success": false, "error": err.to_string()}));
        }
    };
    let _ = store::remove_labels_with_prefix(&dir, &prefix);
    state.cache.refresh(true);

    HttpResponse::Ok().json(json!({
        "success": true,
        "deleted_files": deleted_files,
        "removed_records": removed_lines,
    }))
}

pub async fn bulk_delete_non_meteor(state: State, path: web::Path<String>) -> HttpResponse {
    let camera = path.into_inner();
    let Some(dir) = camera_dir_checked(&state, &camera) else {
        return HttpResponse::NotFound().json(json!({"success": false, "error": "unknown camera"}));
    };

    let labels = store::load_labels(&dir);
    let mut deleted_files = Vec::new();
    let mut deleted_count = 0usize;

    for record in store::read_detections(&dir) {
        let label = labels
            .get(&record.timestamp)
            .map(|l| store::normalize_label(l))
            .unwrap_or("");
        if label != "non-meteor" {
            continue;
        }
        if let Some(base_name) = record.base_name() {
            deleted_files.extend(store::delete_event_files(&dir, &base_name));
        }
        if store::remove_detection_lines(&dir, &record.timestamp).is_ok() {
            deleted_count += 1;
        }
        let _ = store::remove_labels_with_prefix(&dir, &record.timestamp);
    }
    state.cache.refresh(true);

    HttpResponse::Ok().json(json!({
        "success": true,
        "deleted_count": deleted_count,
        "files": deleted_files,
    }))
}

pub async fn camera_stats(state: State, path: web::Path<usize>) -> HttpResponse {
    match state.monitor.snapshot(path.into_inner()) {
        Some(snapshot) => HttpResponse::Ok()
            .insert_header((header::CACHE_CONTROL, "no-store"))
            .json(snapshot),
        None => HttpResponse::NotFound().finish(),
    }
}

/// Proxy the camera's MJPEG stream. Client disconnects are normal here;
/// upstream failures map to 503.
pub async fn camera_stream(state: State, path: web::Path<usize>) -> HttpResponse {
    let Some(base) = camera_url(&state, path.into_inner()) else {
        return HttpResponse::NotFound().finish();
    };
    let response = match state.stream_http.get(format!("{base}/stream")).send().await {
        Ok(response) => response,
        Err(err) => {
            warn!("stream proxy failed: {err}");
            return HttpResponse::ServiceUnavailable().finish();
        }
    };

    let content_type = response
        .headers()
        .get(header::CONTENT_TYPE.as_str())
        .and_then(|v| v.to_str().ok())
        .unwrap_or("multipart/x-mixed-replace; boundary=frame")
        .to_string();

    let body = response.bytes_stream().map(|chunk| {
        chunk.map_err(|err| actix_web::error::ErrorInternalServerError(err.to_string()))
    });

    HttpResponse::Ok()
        .insert_header((header::CACHE_CONTROL, "no-store"))
        .content_type(content_type)
        .streaming(body)
}

pub async fn camera_snapshot(
    state: State,
    path: web::Path<usize>,
    req: HttpRequest,
) -> HttpResponse {
    let index = path.into_inner();
    let Some(base) = camera_url(&state, index) else {
        return HttpResponse::NotFound().finish();
    };
    let response = state
        .http
        .get(format!("{base}/snapshot"))
        .timeout(SNAPSHOT_TIMEOUT)
        .send()
        .await;
    let payload = match response {
        Ok(response) => match response.bytes().await {
            Ok(bytes) => bytes,
            Err(_) => return HttpResponse::ServiceUnavailable().finish(),
        },
        Err(_) => return HttpResponse::ServiceUnavailable().finish(),
    };

    let mut builder = HttpResponse::Ok();
    builder.content_type("image/jpeg");
    builder.insert_header((header::CACHE_CONTROL, "no-store"));

    let download = req
        .query_string()
        .split('&')
        .any(|pair| matches!(pair, "download=1" | "download=true" | "download=yes"));
    if download {
        let name = state
            .config
            .camera(index)
            .map(|cam| cam.name.replace(|c: char| !c.is_alphanumeric(), "_"))
            .unwrap_or_else(|| format!("camera{}", index + 1));
        let filename = format!("snapshot_{name}_{}.jpg", Utc::now().format("%Y%m%d_%H%M%S"));
        builder.insert_header((
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{filename}\""),
        ));
    }
    builder.body(payload)
}

pub async fn camera_restart(state: State, path: web::Path<usize>) -> HttpResponse {
    let Some(base) = camera_url(&state, path.into_inner()) else {
        return HttpResponse::NotFound().finish();
    };
    match state
        .http
        .post(format!("{base}/restart"))
        .timeout(RESTART_TIMEOUT)
        .send()
        .await
    {
        Ok(response) => {
            let payload = response.bytes().await.unwrap_or_default();
            HttpResponse::Accepted()
                .content_type("application/json")
                .body(payload)
        }
        Err(err) => HttpResponse::ServiceUnavailable()
            .json(json!({"success": false, "error": err.to_string()})),
    }
}

pub async fn camera_update_mask(state: State, path: web::Path<usize>) -> HttpResponse {
    let Some(base) = camera_url(&state, path.into_inner()) else {
        return HttpResponse::NotFound().finish();
    };
    match state
        .http
        .post(format!("{base}/update_mask"))
        .timeout(RESTART_TIMEOUT)
        .send()
        .await
    {
        Ok(response) => {
            let payload = response.bytes().await.unwrap_or_default();
            HttpResponse::Ok()
                .content_type("application/json")
                .body(payload)
        }
        Err(err) => HttpResponse::ServiceUnavailable()
            .json(json!({"success": false, "error": err.to_string()})),
    }
}

pub async fn camera_mask_image(state: State, path: web::Path<usize>) -> HttpResponse {
    let Some(base) = camera_url(&state, path.into_inner()) else {
        return HttpResponse::NotFound().finish();
    };
    match state
        .http
        .get(format!("{base}/mask"))
        .timeout(SNAPSHOT_TIMEOUT)
        .send()
        .await
    {
        Ok(response) if response.status().as_u16() == 404 => HttpResponse::NotFound().finish(),
        Ok(response) => match response.bytes().await {
            Ok(bytes) => HttpResponse::Ok()
                .content_type("image/png")
                .insert_header((header::CACHE_CONTROL, "no-store"))
                .body(bytes),
            Err(_) => HttpResponse::ServiceUnavailable().finish(),
        },
        Err(_) => HttpResponse::ServiceUnavailable().finish(),
    }
}

/// Fan one settings patch out to every camera and collect the results.
pub async fn apply_settings_all(state: State, body: Bytes) -> HttpResponse {
    let mut results = Vec::new();
    for camera in &state.config.cameras {
        let outcome = state
            .http
            .post(format!("{}/apply_settings", camera.url))
            .timeout(RESTART_TIMEOUT)
            .header(header::CONTENT_TYPE.as_str(), "application/json")
            .body(body.clone())
            .send()
            .await;
        match outcome {
            Ok(response) => {
                let status = response.status().as_u16();
                let payload: serde_json::Value = response.json().await.unwrap_or(json!(null));
                results.push(json!({
                    "camera": camera.name,
                    "status": status,
                    "response": payload,
                }));
            }
            Err(err) => results.push(json!({
                "camera": camera.name,
                "status": 503,
                "error": err.to_string(),
            })),
        }
    }
    HttpResponse::Ok().json(json!({"results": results}))
}

pub async fn dashboard_stats(state: State) -> HttpResponse {
    HttpResponse::Ok()
        .insert_header((header::CACHE_CONTROL, "no-store"))
        .json(state.sampler.sample())
}

pub async fn detection_window(state: State) -> HttpResponse {
    let config = &state.config;
    let now = Utc::now().with_timezone(&config.timezone);
    match twilight_window(config.latitude, config.longitude, config.timezone, now) {
        Some((start, end)) => HttpResponse::Ok().json(json!({
            "start": start.format("%Y-%m-%d %H:%M:%S").to_string(),
            "end": end.format("%Y-%m-%d %H:%M:%S").to_string(),
            "enabled": config.enable_time_window,
            "latitude": config.latitude,
            "longitude": config.longitude,
        })),
        None => HttpResponse::Ok().json(json!({
            "start": "",
            "end": "",
            "enabled": config.enable_time_window,
            "error": "window undefined at this latitude",
        })),
    }
}

/// Serve stills and clips from the archive. Clips honour Range requests
/// so the browser can seek.
pub async fn serve_media(
    state: State,
    path: web::Path<(String, String)>,
    req: HttpRequest,
) -> HttpResponse {
    let (camera, filename) = path.into_inner();
    let Some(dir) = camera_dir_checked(&state, &camera) else {
        return HttpResponse::NotFound().finish();
    };
    if filename.contains("..") || filename.contains('/') {
        return HttpResponse::BadRequest().finish();
    }
    let file_path = dir.join(&filename);
    if !file_path.is_file() {
        return HttpResponse::NotFound().finish();
    }

    let content_type = match file_path.extension().and_then(|e| e.to_str()) {
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("png") => "image/png",
        Some("mov") => "video/quicktime",
        Some("mp4") => "video/mp4",
        _ => "application/octet-stream",
    };
    let is_video = matches!(content_type, "video/quicktime" | "video/mp4");

    let Ok(mut file) = File::open(&file_path) else {
        return HttpResponse::NotFound().finish();
    };
    let file_size = file
        .metadata()
        .map(|metadata| metadata.len())
        .unwrap_or_default();

    if is_video {
        if let Some(range) = req
            .headers()
            .get(header::RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| parse_byte_range(v, file_size))
        {
            let (start, end) = range;
            let length = end - start + 1;
            let mut buffer = vec![0u8; length as usize];
            if file.seek(SeekFrom::Start(start)).is_err()
                || file.read_exact(&mut buffer).is_err()
            {
                return HttpResponse::InternalServerError().finish();
            }
            return HttpResponse::PartialContent()
                .content_type(content_type)
                .insert_header((
                    header::CONTENT_RANGE,
                    format!("bytes {start}-{end}/{file_size}"),
                ))
                .insert_header((header::ACCEPT_RANGES, "bytes"))
                .insert_header((header::CACHE_CONTROL, "no-cache"))
                .body(buffer);
        }
    }

    let mut buffer = Vec::with_capacity(file_size as usize);
    if file.read_to_end(&mut buffer).is_err() {
        return HttpResponse::InternalServerError().finish();
    }
    let mut builder = HttpResponse::Ok();
    builder.content_type(content_type);
    if is_video {
        builder.insert_header((header::ACCEPT_RANGES, "bytes"));
        builder.insert_header((header::CACHE_CONTROL, "no-cache"));
    }
    builder.body(buffer)
}

pub async fn metrics_text() -> HttpResponse {
    HttpResponse::Ok()
        .content_type("text/plain; version=0.0.4")
        .body(telemetry::render_metrics())
}

/// Parse `bytes=start-end`, clamping into the file. Suffix ranges
/// (`bytes=-N`) are mapped to the final N bytes.
fn parse_byte_range(value: &str, file_size: u64) -> Option<(u64, u64)> {
    if file_size == 0 {
        return None;
    }
    let spec = value.strip_prefix("bytes=")?;
    let (start_raw, end_raw) = spec.split_once('-')?;

    let (start, end) = if start_raw.is_empty() {
        let suffix: u64 = end_raw.parse().ok()?;
        if suffix == 0 {
            return None;
        }
        (file_size.saturating_sub(suffix), file_size - 1)
    } else {
        let start: u64 = start_raw.parse().ok()?;
        let end = if end_raw.is_empty() {
            file_size - 1
        } else {
            end_raw.parse().ok()?
        };
        (start, end)
    };

    let start = if start >= file_size { 0 } else { start };
    let end = end.min(file_size - 1);
    if start > end {
        return None;
    }
    Some((start, end))
}
