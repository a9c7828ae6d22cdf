//! Channel-backed frame source for tests and offline replay.

use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, Ordering},
};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};

use crate::types::{Frame, FrameSource, SourceEvent, StreamInfo};

/// Test double for [`crate::RtspReader`]: frames are pushed in by the test
/// and come out through the same [`FrameSource`] surface the pipeline uses.
pub struct SyntheticSource {
    tx: Sender<Frame>,
    rx: Receiver<Frame>,
    info: StreamInfo,
    stopped: AtomicBool,
    last_frame: Mutex<Option<Instant>>,
}

impl SyntheticSource {
    pub fn new(info: StreamInfo) -> Self {
        let (tx, rx) = unbounded();
        Self {
            tx,
            rx,
            info,
            stopped: AtomicBool::new(false),
            last_frame: Mutex::new(None),
        }
    }

    /// Queue a frame for the pipeline to consume.
    pub fn push(&self, frame: Frame) {
        *self.last_frame.lock().expect("last frame cell poisoned") = Some(Instant::now());
        let _ = self.tx.send(frame);
    }

    /// Handle that lets a producer thread keep feeding frames.
    pub fn sender(&self) -> Sender<Frame> {
        self.tx.clone()
    }
}

impl FrameSource for Arc<SyntheticSource> {
    fn read(&self, timeout: Duration) -> SourceEvent {
        if self.stopped.load(Ordering::SeqCst) && self.rx.is_empty() {
            return SourceEvent::Eof;
        }
        match self.rx.recv_timeout(timeout) {
            Ok(frame) => SourceEvent::Frame(frame),
            Err(RecvTimeoutError::Timeout) => SourceEvent::Idle,
            Err(RecvTimeoutError::Disconnected) => SourceEvent::Eof,
        }
    }

    fn info(&self) -> Option<StreamInfo> {
        Some(self.info)
    }

    fn last_frame_age(&self) -> Option<Duration> {
        self.last_frame
            .lock()
            .expect("last frame cell poisoned")
            .map(|at| at.elapsed())
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use opencv::core::Mat;

    fn dummy_frame(ts: f64) -> Frame {
        Frame {
            ts,
            wall: Utc::now(),
            mat: Arc::new(Mat::default()),
        }
    }

    #[test]
    fn frames_come_out_in_push_order() {
        let source = Arc::new(SyntheticSource::new(StreamInfo {
            width: 64,
            height: 48,
            source_fps: 30.0,
        }));
        source.push(dummy_frame(0.0));
        source.push(dummy_frame(0.1));

        let first = match source.read(Duration::from_millis(10)) {
            SourceEvent::Frame(frame) => frame.ts,
            _ => panic!("expected a frame"),
        };
        let second = match source.read(Duration::from_millis(10)) {
            SourceEvent::Frame(frame) => frame.ts,
            _ => panic!("expected a frame"),
        };
        assert!(first < second);
    }

    #[test]
    fn stop_drains_then_reports_eof() {
        let source = Arc::new(SyntheticSource::new(StreamInfo {
            width: 64,
            height: 48,
            source_fps: 30.0,
        }));
        source.push(dummy_frame(0.0));
        source.stop();

        assert!(matches!(
            source.read(Duration::from_millis(10)),
            SourceEvent::Frame(_)
        ));
        assert!(matches!(
            source.read(Duration::from_millis(10)),
            SourceEvent::Eof
        ));
    }
}
