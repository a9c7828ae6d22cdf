//! Background clip/composite writer.
//!
//! A single worker thread drains save jobs in FIFO order, which keeps
//! `detections.jsonl` strictly ordered by wall timestamp even when clip
//! encoding is slow. A failed clip never loses the detection record.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::thread::JoinHandle;

use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, Sender, unbounded};
use detect_core::{MeteorEvent, estimate_fps, open_clip_writer};
use opencv::{
    core::{self, Mat, Point, Scalar, Vector},
    imgcodecs, imgproc,
    prelude::*,
};
use tracing::{error, info, warn};
use video_ingest::Frame;

use crate::store;

/// Everything the worker needs to persist one event.
pub struct SaveJob {
    pub event: MeteorEvent,
    /// Margin-extended frame range pulled from the ring buffer.
    pub frames: Vec<Frame>,
    pub nominal_fps: f64,
    pub extract_clips: bool,
    pub fb_normalize: bool,
    pub fb_delete_mov: bool,
}

/// Spawn the writer thread for one camera directory.
pub fn spawn_clip_worker(camera_dir: PathBuf) -> (Sender<SaveJob>, JoinHandle<()>) {
    let (tx, rx): (Sender<SaveJob>, Receiver<SaveJob>) = unbounded();
    let handle = crate::telemetry::spawn_thread("clip-writer", move || {
        for job in rx {
            if let Err(err) = save_event(&camera_dir, &job) {
                error!("failed to persist event: {err:#}");
            }
        }
    })
    .expect("failed to spawn clip writer thread");
    (tx, handle)
}

fn save_event(camera_dir: &Path, job: &SaveJob) -> Result<()> {
    std::fs::create_dir_all(camera_dir)
        .with_context(|| format!("creating {}", camera_dir.display()))?;

    let event = &job.event;
    let base_name = event.base_name();
    let mut clip_path: Option<PathBuf> = None;

    if job.frames.is_empty() {
        warn!(event = %event.timestamp_key(), "buffer had no frames for event; recording metadata only");
    } else {
        let fps = estimate_fps(&job.frames, job.nominal_fps);
        let size = job.frames[0].mat.size()?;

        if job.extract_clips {
            let path = camera_dir.join(format!("{base_name}.mov"));
            match open_clip_writer(&path.to_string_lossy(), fps, size) {
                Some(mut writer) => {
                    for frame in &job.frames {
                        writer.write(&*frame.mat)?;
                    }
                    writer.release()?;
                    metrics::counter!("camera_clips_written_total").increment(1);
                    clip_path = Some(path);
                }
                None => {
                    metrics::counter!("camera_clip_failures_total").increment(1);
                }
            }
        }

        if let Err(err) = write_composites(camera_dir, &base_name, event, &job.frames) {
            warn!("composite generation failed: {err}");
        }
    }

    store::append_detection(camera_dir, &event.to_record())?;
    metrics::counter!("camera_detections_total").increment(1);
    info!(
        event = %event.timestamp_key(),
        length_px = format!("{:.1}", event.length()),
        duration_s = format!("{:.2}", event.duration()),
        confidence = format!("{:.0}%", event.confidence * 100.0),
        "meteor event saved"
    );

    if let Some(path) = clip_path {
        if job.fb_normalize {
            normalize_clip(&path, job.fb_delete_mov);
        }
    }
    Ok(())
}

/// Pixel-wise maximum composite over the event frames, written twice:
/// untouched, and with the trajectory marked.
fn write_composites(
    camera_dir: &Path,
    base_name: &str,
    event: &MeteorEvent,
    frames: &[Frame],
) -> opencv::Result<()> {
    let mut composite = frames[0].mat.try_clone()?;
    let mut scratch = Mat::default();
    for frame in &frames[1..] {
        core::max(&composite, &*frame.mat, &mut scratch)?;
        std::mem::swap(&mut composite, &mut scratch);
    }

    let original_path = camera_dir.join(format!("{base_name}_composite_original.jpg"));
    imgcodecs::imwrite(
        &original_path.to_string_lossy(),
        &composite,
        &Vector::new(),
    )?;

    let mut marked = composite.try_clone()?;
    let start = Point::new(event.start_point.0, event.start_point.1);
    let end = Point::new(event.end_point.0, event.end_point.1);
    imgproc::line(
        &mut marked,
        start,
        end,
        Scalar::new(0.0, 255.0, 255.0, 0.0),
        2,
        imgproc::LINE_AA,
        0,
    )?;
    imgproc::circle(
        &mut marked,
        start,
        6,
        Scalar::new(0.0, 255.0, 0.0, 0.0),
        2,
        imgproc::LINE_8,
        0,
    )?;
    imgproc::circle(
        &mut marked,
        end,
        6,
        Scalar::new(0.0, 0.0, 255.0, 0.0),
        2,
        imgproc::LINE_8,
        0,
    )?;
    let overlay = format!(
        "{} | Conf: {:.0}%",
        event.wall.format("%H:%M:%S"),
        event.confidence * 100.0
    );
    imgproc::put_text(
        &mut marked,
        &overlay,
        Point::new(10, 30),
        imgproc::FONT_HERSHEY_SIMPLEX,
        0.7,
        Scalar::new(255.0, 255.0, 255.0, 0.0),
        2,
        imgproc::LINE_8,
        false,
    )?;

    let marked_path = camera_dir.join(format!("{base_name}_composite.jpg"));
    imgcodecs::imwrite(&marked_path.to_string_lossy(), &marked, &Vector::new())?;
    Ok(())
}

/// Re-encode the clip as H.264 baseline MP4 with faststart, for browsers
/// that refuse the raw .mov container.
fn normalize_clip(mov_path: &Path, delete_mov: bool) {
    let mp4_path = mov_path.with_extension("mp4");
    let status = Command::new("ffmpeg")
        .arg("-hide_banner")
        .arg("-loglevel")
        .arg("error")
        .arg("-y")
        .arg("-i")
        .arg(mov_path)
        .arg("-c:v")
        .arg("libx264")
        .arg("-profile:v")
        .arg("baseline")
        .arg("-pix_fmt")
        .arg("yuv420p")
        .arg("-movflags")
        .arg("+faststart")
        .arg(&mp4_path)
        .status();

    match status {
        Ok(status) if status.success() => {
            metrics::counter!("camera_clips_normalized_total").increment(1);
            if delete_mov {
                if let Err(err) = std::fs::remove_file(mov_path) {
                    warn!(path = %mov_path.display(), "failed to remove original clip: {err}");
                }
            }
        }
        Ok(status) => {
            warn!(path = %mov_path.display(), "ffmpeg normalisation exited with {status}");
        }
        Err(err) => {
            warn!("ffmpeg not available, skipping normalisation: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, Utc};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn frame(ts: f64, brightness: f64) -> Frame {
        let mat = Mat::new_rows_cols_with_default(
            60,
            80,
            core::CV_8UC3,
            Scalar::new(brightness, brightness, brightness, 0.0),
        )
        .unwrap();
        Frame {
            ts,
            wall: Utc::now(),
            mat: Arc::new(mat),
        }
    }

    fn event() -> MeteorEvent {
        MeteorEvent {
            wall: NaiveDate::from_ymd_opt(2026, 2, 2)
                .unwrap()
                .and_hms_micro_opt(6, 55, 33, 411_811)
                .unwrap(),
            start_ts: 10.0,
            end_ts: 10.4,
            start_point: (10, 10),
            end_point: (60, 40),
            peak_brightness: 240.0,
            confidence: 0.8,
        }
    }

    #[test]
    fn metadata_is_recorded_even_without_frames() {
        let dir = TempDir::new().unwrap();
        let job = SaveJob {
            event: event(),
            frames: Vec::new(),
            nominal_fps: 30.0,
            extract_clips: true,
            fb_normalize: false,
            fb_delete_mov: false,
        };
        save_event(dir.path(), &job).unwrap();
        let records = store::read_detections(dir.path());
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].timestamp, "2026-02-02T06:55:33.411811");
    }

    #[test]
    fn composites_and_record_are_written() {
        let dir = TempDir::new().unwrap();
        let job = SaveJob {
            event: event(),
            frames: vec![frame(10.0, 20.0), frame(10.2, 90.0), frame(10.4, 40.0)],
            nominal_fps: 30.0,
            extract_clips: false,
            fb_normalize: false,
            fb_delete_mov: false,
        };
        save_event(dir.path(), &job).unwrap();

        assert!(dir
            .path()
            .join("meteor_20260202_065533_composite.jpg")
            .exists());
        assert!(dir
            .path()
            .join("meteor_20260202_065533_composite_original.jpg")
            .exists());
        assert_eq!(store::read_detections(dir.path()).len(), 1);
    }

    #[test]
    fn composite_is_pixelwise_maximum() {
        let frames = [frame(0.0, 10.0), frame(0.1, 200.0), frame(0.2, 50.0)];
        let mut composite = frames[0].mat.try_clone().unwrap();
        let mut scratch = Mat::default();
        for f in &frames[1..] {
            core::max(&composite, &*f.mat, &mut scratch).unwrap();
            std::mem::swap(&mut composite, &mut scratch);
        }
        let value: &core::Vec3b = composite.at_2d(30, 40).unwrap();
        assert_eq!(value[0], 200);
    }
}
