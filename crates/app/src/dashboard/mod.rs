//! Multi-camera dashboard: archive API, stream proxies, liveness monitor.

pub mod cache;
pub mod config;
pub mod html;
pub mod monitor;
pub mod routes;
pub mod stats;

use std::sync::{Arc, atomic::AtomicBool, atomic::Ordering};
use std::time::Duration;

use actix_web::{App, HttpServer, web};
use anyhow::{Context, Result};
use tracing::info;

use crate::dashboard::cache::{DetectionCache, spawn_watcher};
use crate::dashboard::config::DashboardConfig;
use crate::dashboard::monitor::{MonitorState, spawn_monitor};
use crate::dashboard::routes::{self, DashboardState};
use crate::dashboard::stats::CpuSampler;

pub fn run(config: DashboardConfig) -> Result<()> {
    let config = Arc::new(config);
    info!(
        port = config.port,
        cameras = config.cameras.len(),
        dir = %config.detections_dir.display(),
        "dashboard starting"
    );
    for camera in &config.cameras {
        info!(name = %camera.name, url = %camera.url, "camera registered");
    }

    let cache = Arc::new(DetectionCache::new(config.clone()));
    let monitor = Arc::new(MonitorState::new(config.clone()));
    let stop = Arc::new(AtomicBool::new(false));
    let watcher_handle = spawn_watcher(cache.clone(), config.cache_interval, stop.clone());
    let monitor_handle = spawn_monitor(monitor.clone(), stop.clone());

    let http = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .build()
        .context("failed to build HTTP client")?;
    let stream_http = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .read_timeout(Duration::from_secs(300))
        .build()
        .context("failed to build stream HTTP client")?;

    let state = web::Data::new(DashboardState {
        config: config.clone(),
        cache,
        monitor,
        http,
        stream_http,
        sampler: CpuSampler::new(),
    });

    let port = config.port;
    let result = actix_web::rt::System::new().block_on(async move {
        HttpServer::new(move || {
            App::new()
                .app_data(state.clone())
                .route("/", web::get().to(routes::index))
                .route("/detections", web::get().to(routes::detections))
                .route("/detections_mtime", web::get().to(routes::detections_mtime))
                .route("/detection_label", web::post().to(routes::set_detection_label))
                .route(
                    "/detection/{camera}/{timestamp}",
                    web::delete().to(routes::delete_detection),
                )
                .route(
                    "/bulk_delete_non_meteor/{camera}",
                    web::post().to(routes::bulk_delete_non_meteor),
                )
                .route("/camera_stats/{index}", web::get().to(routes::camera_stats))
                .route("/camera_stream/{index}", web::get().to(routes::camera_stream))
                .route(
                    "/camera_snapshot/{index}",
                    web::get().to(routes::camera_snapshot),
                )
                .route(
                    "/camera_restart/{index}",
                    web::post().to(routes::camera_restart),
                )
                .route(
                    "/camera_mask/{index}",
                    web::post().to(routes::camera_update_mask),
                )
                .route(
                    "/camera_mask_image/{index}",
                    web::get().to(routes::camera_mask_image),
                )
                .route(
                    "/camera_settings/apply_all",
                    web::post().to(routes::apply_settings_all),
                )
                .route("/dashboard_stats", web::get().to(routes::dashboard_stats))
                .route("/detection_window", web::get().to(routes::detection_window))
                .route("/image/{camera}/{file}", web::get().to(routes::serve_media))
                .route("/metrics", web::get().to(routes::metrics_text))
        })
        .bind(("0.0.0.0", port))
        .with_context(|| format!("failed to bind dashboard port {port}"))?
        .shutdown_timeout(5)
        .run()
        .await
        .context("dashboard server failed")
    });

    stop.store(true, Ordering::SeqCst);
    let _ = watcher_handle.join();
    let _ = monitor_handle.join();
    info!("dashboard stopped");
    result
}
