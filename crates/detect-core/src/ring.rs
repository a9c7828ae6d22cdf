//! Duration-bounded buffer of recent frames.

use std::collections::VecDeque;
use std::sync::Mutex;

use video_ingest::Frame;

/// Time-indexed queue of the most recent frames.
///
/// Single writer (the detection loop), occasional readers (the clip
/// writer). Frames share their pixel data, so `range` hands out cheap
/// clones that stay valid after eviction.
pub struct RingBuffer {
    max_seconds: f64,
    frames: Mutex<VecDeque<Frame>>,
}

impl RingBuffer {
    pub fn new(max_seconds: f64) -> Self {
        Self {
            max_seconds,
            frames: Mutex::new(VecDeque::new()),
        }
    }

    /// Retained window in seconds.
    pub fn max_seconds(&self) -> f64 {
        self.max_seconds
    }

    /// Append a frame and evict everything older than the window.
    ///
    /// Out-of-order or duplicate timestamps are dropped to keep the buffer
    /// strictly ordered.
    pub fn add(&self, frame: Frame) {
        let mut frames = self.frames.lock().expect("ring buffer poisoned");
        if let Some(newest) = frames.back() {
            if frame.ts <= newest.ts {
                return;
            }
        }
        let cutoff = frame.ts - self.max_seconds;
        frames.push_back(frame);
        while let Some(front) = frames.front() {
            if front.ts < cutoff {
                frames.pop_front();
            } else {
                break;
            }
        }
    }

    /// All frames with `t0 <= ts <= t1`, in increasing timestamp order.
    pub fn range(&self, t0: f64, t1: f64) -> Vec<Frame> {
        let frames = self.frames.lock().expect("ring buffer poisoned");
        frames
            .iter()
            .filter(|frame| frame.ts >= t0 && frame.ts <= t1)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.frames.lock().expect("ring buffer poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use opencv::core::Mat;
    use std::sync::Arc;

    fn frame(ts: f64) -> Frame {
        Frame {
            ts,
            wall: Utc::now(),
            mat: Arc::new(Mat::default()),
        }
    }

    #[test]
    fn range_is_inclusive_and_ordered() {
        let ring = RingBuffer::new(10.0);
        for i in 0..10 {
            ring.add(frame(i as f64 * 0.5));
        }
        let slice = ring.range(1.0, 2.5);
        let ts: Vec<f64> = slice.iter().map(|f| f.ts).collect();
        assert_eq!(ts, vec![1.0, 1.5, 2.0, 2.5]);
    }

    #[test]
    fn eviction_follows_the_newest_timestamp() {
        let ring = RingBuffer::new(2.0);
        for i in 0..50 {
            ring.add(frame(i as f64 * 0.1));
        }
        // Newest is 4.9; everything below 2.9 must be gone.
        let all = ring.range(f64::MIN, f64::MAX);
        assert!(all.first().unwrap().ts >= 2.9);
        assert_eq!(all.last().unwrap().ts, 4.9);
    }

    #[test]
    fn non_monotone_inserts_are_ignored() {
        let ring = RingBuffer::new(10.0);
        ring.add(frame(1.0));
        ring.add(frame(0.5));
        ring.add(frame(1.0));
        ring.add(frame(1.5));
        let ts: Vec<f64> = ring.range(0.0, 10.0).iter().map(|f| f.ts).collect();
        assert_eq!(ts, vec![1.0, 1.5]);
    }

    #[test]
    fn empty_range_outside_window() {
        let ring = RingBuffer::new(5.0);
        ring.add(frame(1.0));
        assert!(ring.range(2.0, 3.0).is_empty());
    }
}
