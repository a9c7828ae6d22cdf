//! Camera pipeline supervisor and detection loop.
//!
//! `run` owns the restart loop: one HTTP server outlives any number of
//! pipeline incarnations, so `/restart` and restart-class settings swap
//! the pipeline without dropping the listening socket.

use std::sync::{
    Arc, Once,
    atomic::{AtomicBool, Ordering},
};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use crossbeam_channel::Sender;
use detect_core::{EventMerger, FrameDetector, MaskSet, MeteorEvent, RingBuffer, Tracker};
use opencv::{
    core::{AlgorithmHint, Mat, Size},
    imgproc,
    prelude::*,
};
use tracing::{error, info, warn};
use video_ingest::{FrameSource, RtspReader, SourceEvent};

use crate::camera::clips::{SaveJob, spawn_clip_worker};
use crate::camera::config::CameraConfig;
use crate::camera::masks::load_masks;
use crate::camera::preview::render_preview;
use crate::camera::server;
use crate::camera::settings::{Settings, SettingsStore};
use crate::camera::state::CameraShared;
use crate::camera::twilight::TwilightGate;

/// How a single pipeline incarnation ended.
enum Outcome {
    Graceful,
    Restart(&'static str),
}

pub fn run(config: CameraConfig) -> Result<()> {
    static CTRL_HANDLER: Once = Once::new();

    let shutdown = Arc::new(AtomicBool::new(false));
    let handler_shutdown = shutdown.clone();
    CTRL_HANDLER.call_once(move || {
        if let Err(err) = ctrlc::set_handler({
            let handler_shutdown = handler_shutdown.clone();
            move || {
                handler_shutdown.store(true, Ordering::SeqCst);
            }
        }) {
            warn!("failed to install Ctrl+C handler: {err}");
        }
    });

    std::fs::create_dir_all(config.camera_dir())
        .with_context(|| format!("creating {}", config.camera_dir().display()))?;

    let settings = Arc::new(SettingsStore::load_or_init(
        config.runtime_settings_path(),
        Settings::from_config(&config),
    ));
    let detector = Arc::new(FrameDetector::new(MaskSet::default()));
    let shared = Arc::new(CameraShared::new(
        config.camera_name.clone(),
        settings.clone(),
        detector.clone(),
        shutdown.clone(),
    ));
    let gate = Arc::new(TwilightGate::new(
        config.enable_time_window,
        config.latitude,
        config.longitude,
        config.timezone,
    ));

    let server = server::spawn(shared.clone(), gate.clone(), &config)
        .context("failed to start camera HTTP server")?;
    info!(
        camera = %config.camera_name,
        port = config.web_port,
        "camera service up"
    );

    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match run_pipeline_once(&config, &shared, &gate) {
            Ok(Outcome::Graceful) => break,
            Ok(Outcome::Restart(reason)) => {
                warn!(reason, "pipeline restarting");
                metrics::counter!("camera_pipeline_restarts_total").increment(1);
                thread::sleep(Duration::from_secs(1));
            }
            Err(err) => {
                error!("pipeline error: {err:?}");
                if shutdown.load(Ordering::SeqCst) {
                    break;
                }
                thread::sleep(Duration::from_secs(1));
            }
        }
    }

    server.stop();
    info!(camera = %config.camera_name, "camera service stopped");
    Ok(())
}

fn run_pipeline_once(
    config: &CameraConfig,
    shared: &Arc<CameraShared>,
    gate: &Arc<TwilightGate>,
) -> Result<Outcome> {
    // Restart-class settings are fixed for this incarnation.
    let boot = shared.settings.snapshot();
    let scale = boot.scale;
    let inv_scale = 1.0 / scale;
    let buffer_seconds = boot.buffer.max(boot.params.max_duration + 2.0);
    let extract_clips = boot.extract_clips;
    let fb_normalize = boot.fb_normalize;
    let fb_delete_mov = boot.fb_delete_mov;

    let mut params = boot.params.clone();
    let mut clip_margin_before = boot.clip_margin_before.min(buffer_seconds);
    let mut clip_margin_after = boot.clip_margin_after.min(buffer_seconds);

    let ring = Arc::new(RingBuffer::new(buffer_seconds));
    let (save_tx, save_handle) = spawn_clip_worker(config.camera_dir());

    let reader = RtspReader::start(&config.url, Duration::from_secs_f64(config.reconnect_delay));
    if !reader.wait_connected(Duration::from_secs(10)) {
        warn!(url = %config.url, "no connection yet; reader keeps retrying");
    }

    let mut tracker = Tracker::new();
    let mut merger = EventMerger::new();
    let mut prev_gray: Option<Mat> = None;
    let mut proc_size: Option<Size> = None;
    let mut nominal_fps = 30.0;

    let mut smoothed_fps = 0.0f64;
    let mut last_instant: Option<Instant> = None;
    let mut settings_generation: Option<u64> = None;
    let mut frame_count: u64 = 0;

    let shutdown = &shared.shutdown;
    let outcome: Outcome = loop {
        if shutdown.load(Ordering::SeqCst) {
            break Outcome::Graceful;
        }
        if shared.restart_requested.load(Ordering::SeqCst) {
            break Outcome::Restart("restart requested");
        }

        let frame = match reader.read(Duration::from_secs(1)) {
            SourceEvent::Frame(frame) => frame,
            SourceEvent::Idle => continue,
            SourceEvent::Eof => break Outcome::Graceful,
        };

        shared.mark_frame();
        frame_count += 1;

        // First frame after (re)connect fixes the geometry.
        if proc_size.is_none() {
            let size = frame.mat.size()?;
            let proc = Size::new(
                ((size.width as f64) * scale).round().max(1.0) as i32,
                ((size.height as f64) * scale).round().max(1.0) as i32,
            );
            proc_size = Some(proc);
            *shared.proc_size.lock().expect("proc size poisoned") = Some(proc);
            if let Some(info) = reader.info() {
                nominal_fps = info.source_fps;
                shared.set_stream_alive_timeout((60.0 / info.source_fps).clamp(2.0, 10.0));
            }
            info!(
                width = size.width,
                height = size.height,
                proc_width = proc.width,
                proc_height = proc.height,
                fps = nominal_fps,
                "detection geometry fixed"
            );
        }
        let proc = proc_size.expect("set above");

        let now = Instant::now();
        if let Some(last) = last_instant {
            let elapsed = now.duration_since(last).as_secs_f64();
            if elapsed > 0.0 {
                let instant = 1.0 / elapsed;
                smoothed_fps = if smoothed_fps == 0.0 {
                    instant
                } else {
                    0.9 * smoothed_fps + 0.1 * instant
                };
                shared.set_runtime_fps(smoothed_fps);
                metrics::gauge!("camera_runtime_fps").set(smoothed_fps);
            }
        }
        last_instant = Some(now);

        ring.add(frame.clone());
        *shared.latest_raw.lock().expect("raw cell poisoned") = Some(frame.mat.clone());

        // Hot settings: pick up a fresh snapshot at the frame boundary.
        let generation = shared.settings.generation();
        if settings_generation != Some(generation) {
            let snapshot = shared.settings.snapshot();
            params = snapshot.params.clone();
            clip_margin_before = snapshot.clip_margin_before.min(buffer_seconds);
            clip_margin_after = snapshot.clip_margin_after.min(buffer_seconds);
            reload_masks(&snapshot, proc, frame.mat.size()?, shared, &mut tracker);
            settings_generation = Some(generation);
        }

        let mut proc_frame = Mat::default();
        let working = if (scale - 1.0).abs() > f64::EPSILON {
            imgproc::resize(
                &*frame.mat,
                &mut proc_frame,
                proc,
                0.0,
                0.0,
                imgproc::INTER_AREA,
            )?;
            &proc_frame
        } else {
            &*frame.mat
        };
        let mut gray = Mat::default();
        imgproc::cvt_color(
            working,
            &mut gray,
            imgproc::COLOR_BGR2GRAY,
            0,
            AlgorithmHint::ALGO_HINT_DEFAULT,
        )?;

        let gate_active = gate.is_active(frame.wall);
        shared
            .is_detecting
            .store(gate_active && prev_gray.is_some(), Ordering::Relaxed);

        let mut candidates = Vec::new();
        if gate_active {
            if let Some(prev) = &prev_gray {
                let tracking_mode = tracker.has_active_tracks();
                candidates = match shared.detector.detect(
                    &gray,
                    prev,
                    &params,
                    tracking_mode,
                    inv_scale,
                    frame.ts,
                ) {
                    Ok(candidates) => candidates,
                    Err(err) => {
                        warn!("detector error: {err}");
                        Vec::new()
                    }
                };

                let wall = frame.wall.with_timezone(&config.timezone).naive_local();
                let mut finished = Vec::new();
                for event in tracker.observe(&candidates, frame.ts, wall, &params) {
                    finished.extend(merger.add_event(event, &params));
                }
                finished.extend(merger.flush_expired(frame.ts, &params));
                tracker.drain_rejections();

                for event in finished {
                    dispatch_save(
                        shared,
                        &ring,
                        &save_tx,
                        event,
                        nominal_fps,
                        clip_margin_before,
                        clip_margin_after,
                        extract_clips,
                        fb_normalize,
                        fb_delete_mov,
                    );
                }
            }
        } else if tracker.has_active_tracks() {
            // The window just closed: flush whatever was in flight.
            let wall = frame.wall.with_timezone(&config.timezone).naive_local();
            for event in tracker.finalize_all(wall, &params) {
                for merged in merger.add_event(event, &params) {
                    dispatch_save(
                        shared,
                        &ring,
                        &save_tx,
                        merged,
                        nominal_fps,
                        clip_margin_before,
                        clip_margin_after,
                        extract_clips,
                        fb_normalize,
                        fb_delete_mov,
                    );
                }
            }
        }

        let header = format!(
            "{} | {:.0}s | Detections: {}",
            shared.camera_name,
            shared.elapsed_seconds(),
            shared.detection_count.load(Ordering::Relaxed)
        );
        match render_preview(&frame.mat, &candidates, &tracker.active_polylines(), &header) {
            Ok(jpeg) => shared.set_preview(jpeg),
            Err(err) => warn!("preview render failed: {err}"),
        }

        prev_gray = Some(gray);

        if frame_count % 1800 == 0 {
            info!(
                frames = frame_count,
                fps = format!("{smoothed_fps:.1}"),
                detections = shared.detection_count.load(Ordering::Relaxed),
                "detection heartbeat"
            );
        }
    };

    // Drain open tracks so shutdown loses nothing.
    let wall = chrono::Utc::now()
        .with_timezone(&config.timezone)
        .naive_local();
    let mut finished = Vec::new();
    for event in tracker.finalize_all(wall, &params) {
        finished.extend(merger.add_event(event, &params));
    }
    finished.extend(merger.flush_all());
    for event in finished {
        dispatch_save(
            shared,
            &ring,
            &save_tx,
            event,
            nominal_fps,
            clip_margin_before,
            clip_margin_after,
            extract_clips,
            fb_normalize,
            fb_delete_mov,
        );
    }

    reader.stop();
    drop(save_tx);
    let _ = save_handle.join();

    if shared.restart_requested.swap(false, Ordering::SeqCst) {
        return Ok(Outcome::Restart("restart requested"));
    }
    Ok(outcome)
}

#[allow(clippy::too_many_arguments)]
fn dispatch_save(
    shared: &Arc<CameraShared>,
    ring: &Arc<RingBuffer>,
    save_tx: &Sender<SaveJob>,
    event: MeteorEvent,
    nominal_fps: f64,
    margin_before: f64,
    margin_after: f64,
    extract_clips: bool,
    fb_normalize: bool,
    fb_delete_mov: bool,
) {
    shared.detection_count.fetch_add(1, Ordering::Relaxed);
    info!(
        start = format!("{:?}", event.start_point),
        end = format!("{:?}", event.end_point),
        length_px = format!("{:.1}", event.length()),
        duration_s = format!("{:.2}", event.duration()),
        "meteor detected"
    );

    let frames = ring.range(
        (event.start_ts - margin_before).max(0.0),
        event.end_ts + margin_after,
    );
    let job = SaveJob {
        event,
        frames,
        nominal_fps,
        extract_clips,
        fb_normalize,
        fb_delete_mov,
    };
    if save_tx.send(job).is_err() {
        error!("clip writer is gone; event dropped from disk (still counted)");
    }
}

fn reload_masks(
    settings: &Settings,
    proc_size: Size,
    full_size: Size,
    shared: &Arc<CameraShared>,
    tracker: &mut Tracker,
) {
    let masks = load_masks(settings, proc_size, full_size);
    shared.detector.set_exclusion_mask(masks.detector.exclusion);
    shared.detector.set_nuisance_mask(masks.detector.nuisance);
    tracker.set_nuisance_mask(masks.nuisance_full);
}
