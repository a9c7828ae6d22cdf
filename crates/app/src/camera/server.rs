//! Per-camera HTTP surface: preview page, MJPEG stream, stats and the
//! settings/mask/restart control endpoints.
//!
//! The server runs on a dedicated thread with its own Actix system so the
//! detection hot path never touches the async runtime; it outlives
//! pipeline restarts and is stopped once at process shutdown.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use actix_web::{
    App, HttpRequest, HttpResponse, HttpServer,
    http::header,
    web::{self, Bytes},
};
use anyhow::{Context, Result};
use async_stream::stream;
use chrono::Utc;
use serde_json::json;
use tokio::sync::oneshot;
use tracing::{error, warn};

use crate::camera::config::CameraConfig;
use crate::camera::html;
use crate::camera::masks::regenerate_exclusion;
use crate::camera::state::CameraShared;
use crate::camera::twilight::TwilightGate;
use crate::telemetry;

struct ServerState {
    shared: Arc<CameraShared>,
    gate: Arc<TwilightGate>,
    mask_file: PathBuf,
}

/// Handle for the HTTP server thread.
pub struct CameraServer {
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl CameraServer {
    /// Signal the server to stop and block until the thread exits.
    pub fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Spawn the server thread for one camera.
pub fn spawn(
    shared: Arc<CameraShared>,
    gate: Arc<TwilightGate>,
    config: &CameraConfig,
) -> Result<CameraServer> {
    let port = config.web_port;
    let mask_file = config.mask_file();
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

    let handle = std::thread::Builder::new()
        .name("camera-http".into())
        .spawn(move || {
            if let Err(err) = actix_web::rt::System::new().block_on(async move {
                let server = HttpServer::new(move || {
                    App::new()
                        .app_data(web::Data::new(ServerState {
                            shared: shared.clone(),
                            gate: gate.clone(),
                            mask_file: mask_file.clone(),
                        }))
                        .route("/", web::get().to(index))
                        .route("/stream", web::get().to(stream_mjpeg))
                        .route("/snapshot", web::get().to(snapshot))
                        .route("/stats", web::get().to(stats))
                        .route("/apply_settings", web::post().to(apply_settings))
                        .route("/update_mask", web::post().to(update_mask))
                        .route("/restart", web::post().to(restart))
                        .route("/mask", web::get().to(mask_image))
                        .route("/detection_window", web::get().to(detection_window))
                        .route("/metrics", web::get().to(metrics_text))
                })
                .bind(("0.0.0.0", port))?
                .shutdown_timeout(5)
                .disable_signals()
                .run();

                let srv_handle = server.handle();
                actix_web::rt::spawn(async move {
                    let _ = shutdown_rx.await;
                    srv_handle.stop(true).await;
                });

                server.await
            }) {
                error!("camera HTTP server error: {err}");
            }
        })
        .context("failed to spawn camera HTTP thread")?;

    Ok(CameraServer {
        shutdown: Some(shutdown_tx),
        handle: Some(handle),
    })
}

async fn index(state: web::Data<ServerState>) -> HttpResponse {
    HttpResponse::Ok()
        .content_type("text/html; charset=utf-8")
        .body(html::preview_page(&state.shared.camera_name))
}

/// multipart/x-mixed-replace MJPEG at roughly the stream rate. The loop
/// ends (closing the connection) on process shutdown.
async fn stream_mjpeg(state: web::Data<ServerState>) -> HttpResponse {
    let shared = state.shared.clone();
    let body = stream! {
        let mut interval = actix_web::rt::time::interval(Duration::from_millis(33));
        loop {
            interval.tick().await;
            if shared.shutdown.load(Ordering::SeqCst) {
                break;
            }
            if let Some(jpeg) = shared.preview_jpeg() {
                let mut payload = Vec::with_capacity(jpeg.len() + 96);
                payload.extend_from_slice(b"--frame\r\n");
                payload.extend_from_slice(b"Content-Type: image/jpeg\r\n");
                payload.extend_from_slice(
                    format!("Content-Length: {}\r\n\r\n", jpeg.len()).as_bytes(),
                );
                payload.extend_from_slice(&jpeg);
                payload.extend_from_slice(b"\r\n");
                yield Ok::<Bytes, actix_web::Error>(Bytes::from(payload));
            }
        }
    };

    HttpResponse::Ok()
        .insert_header((header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"))
        .insert_header((header::CACHE_CONTROL, "no-cache"))
        .content_type("multipart/x-mixed-replace; boundary=frame")
        .streaming(body)
}

async fn snapshot(req: HttpRequest, state: web::Data<ServerState>) -> HttpResponse {
    let Some(jpeg) = state.shared.preview_jpeg() else {
        return HttpResponse::NoContent().finish();
    };

    let mut response = HttpResponse::Ok();
    response.content_type("image/jpeg");
    response.insert_header((header::CACHE_CONTROL, "no-store"));

    let download = req
        .query_string()
        .split('&')
        .any(|pair| matches!(pair, "download=1" | "download=true" | "download=yes"));
    if download {
        let filename = format!(
            "snapshot_{}_{}.jpg",
            state.shared.camera_name,
            Utc::now().format("%Y%m%d_%H%M%S")
        );
        response.insert_header((
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{filename}\""),
        ));
    }
    response.body(jpeg)
}

async fn stats(state: web::Data<ServerState>) -> HttpResponse {
    let shared = &state.shared;
    let settings = shared.settings.snapshot();
    let body = json!({
        "detections": shared.detection_count.load(Ordering::Relaxed),
        "elapsed": (shared.elapsed_seconds() * 10.0).round() / 10.0,
        "camera": shared.camera_name,
        "settings": &*settings,
        "runtime_fps": (shared.runtime_fps() * 10.0).round() / 10.0,
        "stream_alive": shared.stream_alive(),
        "time_since_last_frame": shared.time_since_last_frame().map(|s| (s * 10.0).round() / 10.0),
        "is_detecting": shared.is_detecting.load(Ordering::Relaxed),
    });

    HttpResponse::Ok()
        .insert_header((header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"))
        .insert_header((header::CACHE_CONTROL, "no-store"))
        .json(body)
}

async fn apply_settings(state: web::Data<ServerState>, body: Bytes) -> HttpResponse {
    let patch: serde_json::Map<String, serde_json::Value> =
        match serde_json::from_slice::<serde_json::Value>(&body) {
            Ok(serde_json::Value::Object(map)) => map,
            Ok(_) => {
                return HttpResponse::BadRequest().json(json!({
                    "success": false,
                    "errors": [{"key": "", "reason": "body must be a JSON object"}],
                }));
            }
            Err(err) => {
                return HttpResponse::BadRequest().json(json!({
                    "success": false,
                    "errors": [{"key": "", "reason": format!("invalid JSON: {err}")}],
                }));
            }
        };

    let mut outcome = state.shared.settings.apply(&patch);
    if outcome.restart_required {
        // Settings are already persisted, so the rebuilt pipeline (or a
        // crash-restart) replays this request's intent.
        state.shared.restart_requested.store(true, Ordering::SeqCst);
        outcome.restart_requested = true;
    }

    if outcome.success {
        HttpResponse::Ok().json(outcome)
    } else {
        HttpResponse::BadRequest().json(outcome)
    }
}

async fn update_mask(state: web::Data<ServerState>) -> HttpResponse {
    let Some(frame) = state
        .shared
        .latest_raw
        .lock()
        .expect("raw cell poisoned")
        .clone()
    else {
        return HttpResponse::Conflict().json(json!({
            "success": false,
            "error": "no frame received yet",
        }));
    };
    let Some(proc_size) = *state.shared.proc_size.lock().expect("proc size poisoned") else {
        return HttpResponse::Conflict().json(json!({
            "success": false,
            "error": "stream geometry unknown",
        }));
    };

    let dilate = state.shared.settings.snapshot().mask_dilate;
    match regenerate_exclusion(&frame, dilate, proc_size, &state.mask_file) {
        Ok((_full, proc)) => {
            state.shared.detector.set_exclusion_mask(Some(proc));
            let path = state.mask_file.to_string_lossy().to_string();
            state.shared.settings.set_mask_path(path.clone());
            HttpResponse::Ok().json(json!({"success": true, "mask_path": path}))
        }
        Err(err) => {
            warn!("mask regeneration failed: {err}");
            HttpResponse::InternalServerError().json(json!({
                "success": false,
                "error": err.to_string(),
            }))
        }
    }
}

async fn restart(state: web::Data<ServerState>) -> HttpResponse {
    state.shared.restart_requested.store(true, Ordering::SeqCst);
    HttpResponse::Accepted().json(json!({"success": true, "restarting": true}))
}

async fn mask_image(state: web::Data<ServerState>) -> HttpResponse {
    match std::fs::read(&state.mask_file) {
        Ok(bytes) => HttpResponse::Ok()
            .content_type("image/png")
            .insert_header((header::CACHE_CONTROL, "no-store"))
            .body(bytes),
        Err(_) => HttpResponse::NotFound().finish(),
    }
}

async fn detection_window(state: web::Data<ServerState>) -> HttpResponse {
    match state.gate.window_now(Utc::now()) {
        Some((start, end)) => HttpResponse::Ok().json(json!({
            "start": start.format("%Y-%m-%d %H:%M:%S").to_string(),
            "end": end.format("%Y-%m-%d %H:%M:%S").to_string(),
        })),
        None => HttpResponse::Ok().json(json!({"start": "", "end": ""})),
    }
}

async fn metrics_text() -> HttpResponse {
    HttpResponse::Ok()
        .content_type("text/plain; version=0.0.4")
        .body(telemetry::render_metrics())
}
