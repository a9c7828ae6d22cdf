//! Shared data types exposed by the video ingest layer.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Error;
use chrono::{DateTime, Utc};
use opencv::core::Mat;
use thiserror::Error;

/// A single decoded frame.
///
/// The pixel matrix is shared behind an [`Arc`] so the ring buffer and the
/// clip writer can hold on to it after the capture layer has moved on.
#[derive(Clone)]
pub struct Frame {
    /// Seconds since the reader first connected, monotone within one camera.
    pub ts: f64,
    /// Wall-clock capture time.
    pub wall: DateTime<Utc>,
    /// BGR pixel matrix as decoded by OpenCV.
    pub mat: Arc<Mat>,
}

/// Stream metadata published once a connection is established.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StreamInfo {
    pub width: i32,
    pub height: i32,
    /// Nominal FPS reported by the source, sanitised into [1, 120].
    pub source_fps: f64,
}

/// Outcome of a single [`FrameSource::read`] call.
pub enum SourceEvent {
    /// A frame arrived.
    Frame(Frame),
    /// Nothing arrived within the timeout; the source is still running.
    Idle,
    /// The source has stopped and will deliver no more frames.
    Eof,
}

#[derive(Debug, Error)]
/// Errors that can arise while configuring or driving capture pipelines.
pub enum CaptureError {
    #[error("failed to open video source {uri:?}")]
    Open { uri: String },
    #[error(transparent)]
    Other(#[from] Error),
}

/// Capability surface shared by the RTSP reader and test sources.
///
/// The detection loop only ever sees this trait, so file-backed and
/// synthetic readers can stand in for a live camera.
pub trait FrameSource: Send {
    /// Block up to `timeout` for the next frame.
    fn read(&self, timeout: Duration) -> SourceEvent;

    /// Metadata for the current connection, if one has been established.
    fn info(&self) -> Option<StreamInfo>;

    /// Seconds since the last frame was delivered, if any frame ever was.
    fn last_frame_age(&self) -> Option<Duration>;

    /// Signal shutdown and release the underlying handle.
    fn stop(&self);
}

/// Clamp a reported FPS into a usable range, falling back otherwise.
///
/// IP cameras routinely report 0, NaN, or four-digit values here.
pub fn sanitize_fps(value: f64, default: f64) -> f64 {
    if !value.is_finite() || !(1.0..=120.0).contains(&value) {
        default
    } else {
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_fps_clamps_garbage() {
        assert_eq!(sanitize_fps(25.0, 30.0), 25.0);
        assert_eq!(sanitize_fps(0.0, 30.0), 30.0);
        assert_eq!(sanitize_fps(f64::NAN, 30.0), 30.0);
        assert_eq!(sanitize_fps(9000.0, 30.0), 30.0);
        assert_eq!(sanitize_fps(-5.0, 24.0), 24.0);
    }
}
