//! OpenCV-backed RTSP capture with automatic reconnection.
//!
//! A background thread owns the `VideoCapture` handle and pushes decoded
//! frames onto a bounded channel. When the channel is full the oldest frame
//! is discarded so consumers always see the freshest picture. Transport
//! failures are never fatal: the thread drops the handle and reconnects
//! after a delay, forever, until [`FrameSource::stop`] is called.

use std::sync::{
    Arc, Condvar, Mutex,
    atomic::{AtomicBool, Ordering},
};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::Utc;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};
use opencv::{
    prelude::*,
    videoio::{self, VideoCapture},
};
use tracing::{debug, info, warn};

use crate::types::{Frame, FrameSource, SourceEvent, StreamInfo, sanitize_fps};

/// Frames buffered between the reader thread and the detection loop.
const QUEUE_CAPACITY: usize = 30;
/// Consecutive decode failures before the connection is considered dead.
const MAX_DECODE_FAILURES: u32 = 30;

/// Live RTSP frame source.
pub struct RtspReader {
    rx: Receiver<Frame>,
    shared: Arc<ReaderShared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

struct ReaderShared {
    url: String,
    reconnect_delay: Duration,
    stopped: AtomicBool,
    info: Mutex<Option<StreamInfo>>,
    last_frame: Mutex<Option<Instant>>,
    connected: (Mutex<bool>, Condvar),
}

impl RtspReader {
    /// Spawn the reader thread and begin connecting to `url`.
    pub fn start(url: impl Into<String>, reconnect_delay: Duration) -> Self {
        let (tx, rx) = bounded(QUEUE_CAPACITY);
        let shared = Arc::new(ReaderShared {
            url: url.into(),
            reconnect_delay,
            stopped: AtomicBool::new(false),
            info: Mutex::new(None),
            last_frame: Mutex::new(None),
            connected: (Mutex::new(false), Condvar::new()),
        });

        let thread_shared = shared.clone();
        let drain = rx.clone();
        let handle = thread::Builder::new()
            .name("rtsp-reader".into())
            .spawn(move || read_loop(thread_shared, tx, drain))
            .expect("failed to spawn rtsp reader thread");

        Self {
            rx,
            shared,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Block until the first connection succeeds, or `timeout` elapses.
    pub fn wait_connected(&self, timeout: Duration) -> bool {
        let (lock, cvar) = &self.shared.connected;
        let guard = lock.lock().expect("connected flag poisoned");
        let (guard, _) = cvar
            .wait_timeout_while(guard, timeout, |connected| !*connected)
            .expect("connected flag poisoned");
        *guard
    }
}

impl FrameSource for RtspReader {
    fn read(&self, timeout: Duration) -> SourceEvent {
        if self.shared.stopped.load(Ordering::SeqCst) {
            return SourceEvent::Eof;
        }
        match self.rx.recv_timeout(timeout) {
            Ok(frame) => SourceEvent::Frame(frame),
            Err(RecvTimeoutError::Timeout) => SourceEvent::Idle,
            Err(RecvTimeoutError::Disconnected) => SourceEvent::Eof,
        }
    }

    fn info(&self) -> Option<StreamInfo> {
        *self.shared.info.lock().expect("stream info poisoned")
    }

    fn last_frame_age(&self) -> Option<Duration> {
        self.shared
            .last_frame
            .lock()
            .expect("last frame cell poisoned")
            .map(|at| at.elapsed())
    }

    fn stop(&self) {
        self.shared.stopped.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.lock().expect("join handle poisoned").take() {
            let _ = handle.join();
        }
    }
}

fn read_loop(shared: Arc<ReaderShared>, tx: Sender<Frame>, drain: Receiver<Frame>) {
    // Monotonic origin for frame timestamps, fixed at the first connect so
    // timestamps stay comparable across reconnects.
    let mut origin: Option<Instant> = None;

    while !shared.stopped.load(Ordering::SeqCst) {
        let mut cap = match VideoCapture::from_file(&shared.url, videoio::CAP_FFMPEG) {
            Ok(cap) => cap,
            Err(err) => {
                warn!(url = %shared.url, "capture init failed: {err}");
                metrics::counter!("ingest_connect_failures_total").increment(1);
                sleep_unless_stopped(&shared, shared.reconnect_delay);
                continue;
            }
        };

        match cap.is_opened() {
            Ok(true) => {}
            _ => {
                warn!(url = %shared.url, "connection failed");
                metrics::counter!("ingest_connect_failures_total").increment(1);
                sleep_unless_stopped(&shared, shared.reconnect_delay);
                continue;
            }
        }

        let width = cap.get(videoio::CAP_PROP_FRAME_WIDTH).unwrap_or(0.0) as i32;
        let height = cap.get(videoio::CAP_PROP_FRAME_HEIGHT).unwrap_or(0.0) as i32;
        let source_fps = sanitize_fps(cap.get(videoio::CAP_PROP_FPS).unwrap_or(0.0), 30.0);
        *shared.info.lock().expect("stream info poisoned") = Some(StreamInfo {
            width,
            height,
            source_fps,
        });
        origin.get_or_insert_with(Instant::now);
        info!(url = %shared.url, width, height, fps = source_fps, "stream connected");
        set_connected(&shared, true);

        let mut scratch = Mat::default();
        let mut consecutive_failures: u32 = 0;

        while !shared.stopped.load(Ordering::SeqCst) {
            let ok = match cap.read(&mut scratch) {
                Ok(ok) => ok,
                Err(err) => {
                    debug!("decode error: {err}");
                    false
                }
            };

            if !ok {
                consecutive_failures += 1;
                metrics::counter!("ingest_decode_failures_total").increment(1);
                if consecutive_failures >= MAX_DECODE_FAILURES {
                    warn!(url = %shared.url, "stream lost after {consecutive_failures} decode failures");
                    break;
                }
                thread::sleep(Duration::from_millis(10));
                continue;
            }

            let size = match scratch.size() {
                Ok(size) => size,
                Err(_) => continue,
            };
            if size.width <= 0 || size.height <= 0 {
                metrics::counter!("ingest_frames_malformed_total").increment(1);
                continue;
            }

            consecutive_failures = 0;
            let ts = origin
                .map(|o| o.elapsed().as_secs_f64())
                .unwrap_or_default();

            // Frames must own their pixels; `cap.read` reuses the scratch Mat.
            let mat = match scratch.try_clone() {
                Ok(mat) => mat,
                Err(err) => {
                    warn!("frame copy failed: {err}");
                    metrics::counter!("ingest_frames_malformed_total").increment(1);
                    continue;
                }
            };

            let frame = Frame {
                ts,
                wall: Utc::now(),
                mat: Arc::new(mat),
            };

            if tx.is_full() {
                let _ = drain.try_recv();
                metrics::counter!("ingest_frames_dropped_total").increment(1);
            }
            if tx.send(frame).is_err() {
                return;
            }
            *shared.last_frame.lock().expect("last frame cell poisoned") = Some(Instant::now());
            metrics::counter!("ingest_frames_total").increment(1);
        }

        drop(cap);
        set_connected(&shared, false);
        metrics::counter!("ingest_reconnects_total").increment(1);

        if !shared.stopped.load(Ordering::SeqCst) {
            debug!(delay = ?shared.reconnect_delay, "reconnecting");
            sleep_unless_stopped(&shared, shared.reconnect_delay);
        }
    }
}

fn set_connected(shared: &ReaderShared, value: bool) {
    let (lock, cvar) = &shared.connected;
    *lock.lock().expect("connected flag poisoned") = value;
    cvar.notify_all();
}

fn sleep_unless_stopped(shared: &ReaderShared, delay: Duration) {
    let step = Duration::from_millis(100);
    let deadline = Instant::now() + delay;
    while Instant::now() < deadline {
        if shared.stopped.load(Ordering::SeqCst) {
            return;
        }
        thread::sleep(step.min(deadline.saturating_duration_since(Instant::now())));
    }
}
