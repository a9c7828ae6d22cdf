//! Full detection round-trip on synthetic footage: frames go through the
//! detector, tracker, merger and clip writer, and come out as one JSONL
//! record with the right geometry.

use std::sync::Arc;

use app::store;
use chrono::{NaiveDate, NaiveDateTime, Utc};
use detect_core::{
    DetectionParams, EventMerger, FrameDetector, MaskSet, MeteorEvent, RingBuffer, Sensitivity,
    Tracker,
};
use opencv::{
    core::{self, AlgorithmHint, Mat, Point, Scalar},
    imgproc,
    prelude::*,
};
use tempfile::TempDir;
use video_ingest::Frame;

const WIDTH: i32 = 640;
const HEIGHT: i32 = 480;
const FPS: f64 = 30.0;

fn background() -> Mat {
    Mat::new_rows_cols_with_default(HEIGHT, WIDTH, core::CV_8UC3, Scalar::new(8.0, 8.0, 8.0, 0.0))
        .unwrap()
}

fn with_dot(at: (i32, i32)) -> Mat {
    let mut frame = background();
    imgproc::circle(
        &mut frame,
        Point::new(at.0, at.1),
        4,
        Scalar::new(255.0, 255.0, 255.0, 0.0),
        imgproc::FILLED,
        imgproc::LINE_8,
        0,
    )
    .unwrap();
    frame
}

fn to_gray(frame: &Mat) -> Mat {
    let mut gray = Mat::default();
    imgproc::cvt_color(
        frame,
        &mut gray,
        imgproc::COLOR_BGR2GRAY,
        0,
        AlgorithmHint::ALGO_HINT_DEFAULT,
    )
    .unwrap();
    gray
}

fn wall() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2026, 2, 2)
        .unwrap()
        .and_hms_micro_opt(6, 55, 33, 411_811)
        .unwrap()
}

fn medium_params() -> DetectionParams {
    let mut params = DetectionParams::default();
    Sensitivity::Medium.apply(&mut params);
    params
}

/// Drive BGR frames through detect → track → merge, collecting events.
struct Harness {
    detector: FrameDetector,
    tracker: Tracker,
    merger: EventMerger,
    ring: Arc<RingBuffer>,
    params: DetectionParams,
    prev_gray: Option<Mat>,
    events: Vec<MeteorEvent>,
}

impl Harness {
    fn new(params: DetectionParams) -> Self {
        Self {
            detector: FrameDetector::new(MaskSet::default()),
            tracker: Tracker::new(),
            merger: EventMerger::new(),
            ring: Arc::new(RingBuffer::new(30.0)),
            params,
            prev_gray: None,
            events: Vec::new(),
        }
    }

    fn feed(&mut self, ts: f64, frame: Mat) {
        let mat = Arc::new(frame);
        self.ring.add(Frame {
            ts,
            wall: Utc::now(),
            mat: mat.clone(),
        });

        let gray = to_gray(&mat);
        if let Some(prev) = &self.prev_gray {
            let tracking = self.tracker.has_active_tracks();
            let candidates = self
                .detector
                .detect(&gray, prev, &self.params, tracking, 1.0, ts)
                .unwrap();
            for event in self.tracker.observe(&candidates, ts, wall(), &self.params) {
                self.events.extend(self.merger.add_event(event, &self.params));
            }
            self.events
                .extend(self.merger.flush_expired(ts, &self.params));
        }
        self.prev_gray = Some(gray);
    }

    fn finish(&mut self) -> Vec<MeteorEvent> {
        for event in self.tracker.finalize_all(wall(), &self.params) {
            self.events.extend(self.merger.add_event(event, &self.params));
        }
        self.events.extend(self.merger.flush_all());
        std::mem::take(&mut self.events)
    }
}

#[test]
fn single_streak_produces_one_accurate_record() {
    let mut harness = Harness::new(medium_params());

    let start = (100, 100);
    let end = (400, 250);
    let steps = 20;

    // Frame 0 is pure background; the streak spans frames 1..=20.
    harness.feed(0.0, background());
    for k in 1..=steps {
        let t = (k - 1) as f64 / (steps - 1) as f64;
        let x = start.0 + ((end.0 - start.0) as f64 * t) as i32;
        let y = start.1 + ((end.1 - start.1) as f64 * t) as i32;
        harness.feed(k as f64 / FPS, with_dot((x, y)));
    }
    // Dark frames advance time past the gap and merge windows.
    for k in (steps + 1)..(steps + 1 + 150) {
        harness.feed(k as f64 / FPS, background());
    }

    let events = harness.finish();
    assert_eq!(events.len(), 1, "expected exactly one event");
    let event = &events[0];

    assert!((event.start_point.0 - start.0).abs() <= 3, "start x {:?}", event.start_point);
    assert!((event.start_point.1 - start.1).abs() <= 3, "start y {:?}", event.start_point);
    assert!((event.end_point.0 - end.0).abs() <= 3, "end x {:?}", event.end_point);
    assert!((event.end_point.1 - end.1).abs() <= 3, "end y {:?}", event.end_point);

    let true_duration = (steps - 1) as f64 / FPS;
    assert!(
        (event.duration() - true_duration).abs() <= 1.0 / FPS + 1e-9,
        "duration {} vs {}",
        event.duration(),
        true_duration
    );
    assert!(event.confidence > 0.5);

    // Persist through the store and read the record back.
    let dir = TempDir::new().unwrap();
    store::append_detection(dir.path(), &event.to_record()).unwrap();
    let records = store::read_detections(dir.path());
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].start_point, [event.start_point.0, event.start_point.1]);
    assert!((records[0].duration - true_duration).abs() <= 1.0 / FPS + 5e-3);
}

#[test]
fn no_motion_produces_no_events() {
    let mut harness = Harness::new(medium_params());
    for k in 0..120 {
        harness.feed(k as f64 / FPS, background());
    }
    assert!(harness.finish().is_empty());
}

#[test]
fn blinking_streak_merges_into_one_event() {
    // Tight gap so the blink splits the track, exercising the merge pass;
    // the merge window must outlast the gap plus the second segment.
    let mut params = medium_params();
    params.max_gap_time = 0.5;
    params.merge_max_gap_time = 2.0;

    let mut harness = Harness::new(params);
    harness.feed(0.0, background());

    // First segment: 10 frames moving right at ~474 px/s.
    let mut ts = 0.0;
    for k in 1..=10 {
        ts = k as f64 / FPS;
        harness.feed(ts, with_dot((100 + (k - 1) * 16, 200)));
    }
    let blink_start = ts;

    // 0.8 s of darkness.
    let mut k = 0;
    while ts - blink_start < 0.8 {
        k += 1;
        ts = blink_start + k as f64 / FPS;
        harness.feed(ts, background());
    }

    // Second segment resumes ~40 px further along at the same speed.
    let resume_x = 100 + 9 * 16 + 40;
    let resume_start = ts;
    for k in 1..=10 {
        ts = resume_start + k as f64 / FPS;
        harness.feed(ts, with_dot((resume_x + (k - 1) * 16, 200)));
    }

    // Quiet tail to flush everything.
    let tail_start = ts;
    for k in 1..=150 {
        harness.feed(tail_start + k as f64 / FPS, background());
    }

    let events = harness.finish();
    assert_eq!(events.len(), 1, "blink should merge into one event");
    let event = &events[0];
    assert!((event.start_point.0 - 100).abs() <= 3);
    assert!(event.end_point.0 > resume_x);
}
