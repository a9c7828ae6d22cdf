//! Shared state between the detection pipeline and the HTTP surface.

use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, AtomicU64, Ordering},
};
use std::time::Instant;

use detect_core::FrameDetector;
use opencv::core::{Mat, Size};

use crate::camera::settings::SettingsStore;

/// Latest annotated preview frame, already JPEG-encoded.
#[derive(Clone)]
pub struct PreviewFrame {
    pub jpeg: Vec<u8>,
    pub at: Instant,
}

/// Single-writer cells read by the HTTP handlers.
///
/// The detection loop is the only writer of everything except the restart
/// flag; handlers take short-held locks and never block the writer for
/// long.
pub struct CameraShared {
    pub camera_name: String,
    pub started_at: Instant,

    /// Most recent preview; single-slot, most recent wins.
    pub preview: Mutex<Option<PreviewFrame>>,
    /// Most recent raw frame, kept for mask regeneration and snapshots
    /// before the first preview exists.
    pub latest_raw: Mutex<Option<Arc<Mat>>>,

    pub detection_count: AtomicU64,
    /// Smoothed measured FPS ×1000, stored as integer bits for atomics.
    runtime_fps_millis: AtomicU64,
    /// Milliseconds since `started_at` of the last frame, u64::MAX = never.
    last_frame_offset_ms: AtomicU64,
    /// Seconds without frames after which the stream counts as dead.
    stream_alive_timeout: Mutex<f64>,
    pub is_detecting: AtomicBool,

    pub restart_requested: AtomicBool,
    pub shutdown: Arc<AtomicBool>,

    pub settings: Arc<SettingsStore>,
    pub detector: Arc<FrameDetector>,
    /// Processing-scale frame size, available once the stream connected.
    pub proc_size: Mutex<Option<Size>>,
}

impl CameraShared {
    pub fn new(
        camera_name: String,
        settings: Arc<SettingsStore>,
        detector: Arc<FrameDetector>,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            camera_name,
            started_at: Instant::now(),
            preview: Mutex::new(None),
            latest_raw: Mutex::new(None),
            detection_count: AtomicU64::new(0),
            runtime_fps_millis: AtomicU64::new(0),
            last_frame_offset_ms: AtomicU64::new(u64::MAX),
            stream_alive_timeout: Mutex::new(2.0),
            is_detecting: AtomicBool::new(false),
            restart_requested: AtomicBool::new(false),
            shutdown,
            settings,
            detector,
            proc_size: Mutex::new(None),
        }
    }

    pub fn elapsed_seconds(&self) -> f64 {
        self.started_at.elapsed().as_secs_f64()
    }

    pub fn set_runtime_fps(&self, fps: f64) {
        self.runtime_fps_millis
            .store((fps.max(0.0) * 1000.0) as u64, Ordering::Relaxed);
    }

    pub fn runtime_fps(&self) -> f64 {
        self.runtime_fps_millis.load(Ordering::Relaxed) as f64 / 1000.0
    }

    pub fn mark_frame(&self) {
        let offset = self.started_at.elapsed().as_millis() as u64;
        self.last_frame_offset_ms.store(offset, Ordering::Relaxed);
    }

    /// Seconds since the last frame, if one ever arrived.
    pub fn time_since_last_frame(&self) -> Option<f64> {
        let offset = self.last_frame_offset_ms.load(Ordering::Relaxed);
        if offset == u64::MAX {
            return None;
        }
        let now = self.started_at.elapsed().as_millis() as u64;
        Some(now.saturating_sub(offset) as f64 / 1000.0)
    }

    pub fn set_stream_alive_timeout(&self, seconds: f64) {
        *self
            .stream_alive_timeout
            .lock()
            .expect("timeout cell poisoned") = seconds;
    }

    pub fn stream_alive(&self) -> bool {
        let timeout = *self
            .stream_alive_timeout
            .lock()
            .expect("timeout cell poisoned");
        matches!(self.time_since_last_frame(), Some(age) if age <= timeout)
    }

    pub fn set_preview(&self, jpeg: Vec<u8>) {
        *self.preview.lock().expect("preview cell poisoned") = Some(PreviewFrame {
            jpeg,
            at: Instant::now(),
        });
    }

    pub fn preview_jpeg(&self) -> Option<Vec<u8>> {
        self.preview
            .lock()
            .expect("preview cell poisoned")
            .as_ref()
            .map(|frame| frame.jpeg.clone())
    }
}
