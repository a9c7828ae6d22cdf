//! Multi-frame track association and acceptance.

use std::collections::BTreeMap;

use chrono::NaiveDateTime;
use opencv::core::Mat;
use tracing::debug;

use crate::detector::Candidate;
use crate::event::MeteorEvent;
use crate::mask::line_overlap_ratio;
use crate::math;
use crate::params::DetectionParams;

/// One observation along a track.
#[derive(Clone, Copy, Debug)]
pub struct TrackPoint {
    pub ts: f64,
    pub x: i32,
    pub y: i32,
    pub brightness: f64,
}

/// Why a closed track was not promoted to an event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RejectReason {
    TrackPoints,
    Duration,
    StationaryRatio,
    NuisancePath,
    Length,
    Speed,
    Linearity,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TrackPoints => "track_points",
            Self::Duration => "duration",
            Self::StationaryRatio => "stationary_ratio",
            Self::NuisancePath => "nuisance_path",
            Self::Length => "length",
            Self::Speed => "speed",
            Self::Linearity => "linearity",
        }
    }
}

/// Associates candidates into tracks and finalises them on gap timeout.
///
/// Track ids are monotone, so iterating the map visits older tracks first;
/// that ordering is the association tie-break.
pub struct Tracker {
    active: BTreeMap<u64, Vec<TrackPoint>>,
    next_id: u64,
    /// Full-resolution nuisance mask for the path-overlap acceptance gate.
    nuisance_mask: Option<Mat>,
    rejections: Vec<RejectReason>,
}

impl Tracker {
    pub fn new() -> Self {
        Self {
            active: BTreeMap::new(),
            next_id: 0,
            nuisance_mask: None,
            rejections: Vec::new(),
        }
    }

    /// Swap the full-resolution nuisance mask used at finalisation.
    pub fn set_nuisance_mask(&mut self, mask: Option<Mat>) {
        self.nuisance_mask = mask;
    }

    /// True while any track is open; drives the detector's tracking mode.
    pub fn has_active_tracks(&self) -> bool {
        !self.active.is_empty()
    }

    /// Snapshot of open track polylines for preview drawing.
    pub fn active_polylines(&self) -> Vec<Vec<(i32, i32)>> {
        self.active
            .values()
            .map(|points| points.iter().map(|p| (p.x, p.y)).collect())
            .collect()
    }

    /// Reasons recorded since the last call; used by tests and tuning logs.
    pub fn drain_rejections(&mut self) -> Vec<RejectReason> {
        std::mem::take(&mut self.rejections)
    }

    /// Feed one frame's candidates at `ts`, returning any events whose
    /// tracks closed on this step.
    pub fn observe(
        &mut self,
        candidates: &[Candidate],
        ts: f64,
        wall: NaiveDateTime,
        params: &DetectionParams,
    ) -> Vec<MeteorEvent> {
        let mut used = vec![false; candidates.len()];
        let mut expired = Vec::new();

        for (&id, points) in self.active.iter_mut() {
            let last = match points.last() {
                Some(last) => *last,
                None => continue,
            };
            let gap = ts - last.ts;
            if gap > params.max_gap_time {
                expired.push(id);
                continue;
            }

            // Constant-velocity extrapolation from the previous pair helps
            // fast streaks that outrun the plain radius.
            let predicted = if points.len() >= 2 {
                let prev = points[points.len() - 2];
                let dt = last.ts - prev.ts;
                if dt > 0.0 {
                    let vx = (last.x - prev.x) as f64 / dt;
                    let vy = (last.y - prev.y) as f64 / dt;
                    Some((last.x as f64 + vx * gap, last.y as f64 + vy * gap))
                } else {
                    None
                }
            } else {
                None
            };

            let mut best: Option<(usize, f64)> = None;
            for (i, candidate) in candidates.iter().enumerate() {
                if used[i] {
                    continue;
                }
                let (cx, cy) = candidate.centroid;
                let direct =
                    ((cx - last.x) as f64).hypot((cy - last.y) as f64);
                let dist = match predicted {
                    Some((px, py)) => {
                        direct.min((cx as f64 - px).hypot(cy as f64 - py))
                    }
                    None => direct,
                };
                if dist < params.max_distance
                    && best.map_or(true, |(_, d)| dist < d)
                {
                    best = Some((i, dist));
                }
            }

            if let Some((i, _)) = best {
                let candidate = &candidates[i];
                points.push(TrackPoint {
                    ts,
                    x: candidate.centroid.0,
                    y: candidate.centroid.1,
                    brightness: candidate.brightness,
                });
                used[i] = true;
            }
        }

        let mut events = Vec::new();
        for id in expired {
            if let Some(event) = self.finalize(id, wall, params) {
                events.push(event);
            }
        }

        for (i, candidate) in candidates.iter().enumerate() {
            if !used[i] {
                self.active.insert(
                    self.next_id,
                    vec![TrackPoint {
                        ts,
                        x: candidate.centroid.0,
                        y: candidate.centroid.1,
                        brightness: candidate.brightness,
                    }],
                );
                self.next_id += 1;
            }
        }

        events
    }

    /// Close every remaining track, e.g. on shutdown.
    pub fn finalize_all(
        &mut self,
        wall: NaiveDateTime,
        params: &DetectionParams,
    ) -> Vec<MeteorEvent> {
        let ids: Vec<u64> = self.active.keys().copied().collect();
        ids.into_iter()
            .filter_map(|id| self.finalize(id, wall, params))
            .collect()
    }

    fn finalize(
        &mut self,
        id: u64,
        wall: NaiveDateTime,
        params: &DetectionParams,
    ) -> Option<MeteorEvent> {
        let points = self.active.remove(&id)?;
        match self.evaluate(&points, wall, params) {
            Ok(event) => {
                metrics::counter!("detect_events_accepted_total").increment(1);
                Some(event)
            }
            Err(reason) => {
                debug!(
                    track = id,
                    points = points.len(),
                    rejected_by = reason.as_str(),
                    "track rejected"
                );
                metrics::counter!(
                    "detect_tracks_rejected_total",
                    "reason" => reason.as_str()
                )
                .increment(1);
                self.rejections.push(reason);
                None
            }
        }
    }

    fn evaluate(
        &self,
        points: &[TrackPoint],
        wall: NaiveDateTime,
        params: &DetectionParams,
    ) -> Result<MeteorEvent, RejectReason> {
        if points.len() < params.min_track_points {
            return Err(RejectReason::TrackPoints);
        }

        let start = points.first().expect("non-empty track");
        let end = points.last().expect("non-empty track");
        let duration = end.ts - start.ts;
        if !(params.min_duration..=params.max_duration).contains(&duration) {
            return Err(RejectReason::Duration);
        }

        let coords: Vec<(f64, f64)> =
            points.iter().map(|p| (p.x as f64, p.y as f64)).collect();
        if math::stationary_ratio(&coords) > params.max_stationary_ratio {
            return Err(RejectReason::StationaryRatio);
        }

        let start_point = (start.x, start.y);
        let end_point = (end.x, end.y);

        if let Some(mask) = &self.nuisance_mask {
            let ratio = line_overlap_ratio(mask, start_point, end_point)
                .unwrap_or(0.0);
            if ratio > params.nuisance_path_overlap_threshold {
                return Err(RejectReason::NuisancePath);
            }
        }

        let length = ((end.x - start.x) as f64).hypot((end.y - start.y) as f64);
        if !(params.min_length..=params.max_length).contains(&length) {
            return Err(RejectReason::Length);
        }

        let speed = length / duration.max(0.001);
        if speed < params.min_speed {
            return Err(RejectReason::Speed);
        }

        let linearity = math::linearity(&coords);
        if linearity < params.min_linearity {
            return Err(RejectReason::Linearity);
        }

        let peak_brightness = points
            .iter()
            .map(|p| p.brightness)
            .fold(f64::MIN, f64::max);
        let confidence =
            math::confidence(length, speed, linearity, peak_brightness, duration);

        Ok(MeteorEvent {
            wall,
            start_ts: start.ts,
            end_ts: end.ts,
            start_point,
            end_point,
            peak_brightness,
            confidence,
        })
    }
}

impl Default for Tracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use opencv::core::{self, Rect, Scalar};
    use opencv::imgproc;
    use opencv::prelude::*;

    fn wall() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 2, 2)
            .unwrap()
            .and_hms_opt(1, 2, 3)
            .unwrap()
    }

    fn candidate(x: i32, y: i32, brightness: f64) -> Candidate {
        Candidate {
            centroid: (x, y),
            area: 10.0,
            brightness,
            bbox: Rect::new(x - 2, y - 2, 4, 4),
            frame_ts: 0.0,
        }
    }

    fn relaxed() -> DetectionParams {
        DetectionParams {
            min_track_points: 4,
            min_duration: 0.05,
            max_duration: 5.0,
            min_length: 1.0,
            max_length: 5000.0,
            min_speed: 0.1,
            min_linearity: 0.1,
            max_stationary_ratio: 0.95,
            ..DetectionParams::default()
        }
    }

    /// Feed a straight streak and close it by timing out the gap.
    fn run_streak(tracker: &mut Tracker, params: &DetectionParams, n: usize) -> Vec<MeteorEvent> {
        let mut events = Vec::new();
        for i in 0..n {
            let ts = i as f64 * 0.1;
            let c = candidate(20 + i as i32 * 15, 30 + i as i32 * 10, 220.0);
            events.extend(tracker.observe(&[c], ts, wall(), params));
        }
        let close_ts = n as f64 * 0.1 + params.max_gap_time + 0.5;
        events.extend(tracker.observe(&[], close_ts, wall(), params));
        events
    }

    #[test]
    fn straight_streak_becomes_one_event() {
        let mut tracker = Tracker::new();
        let params = relaxed();
        let events = run_streak(&mut tracker, &params, 6);
        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert_eq!(event.start_point, (20, 30));
        assert_eq!(event.end_point, (95, 80));
        assert!(event.confidence > 0.0 && event.confidence <= 1.0);
        assert!(tracker.drain_rejections().is_empty());
    }

    #[test]
    fn too_few_points_rejects_with_track_points() {
        let mut tracker = Tracker::new();
        let params = relaxed();
        let events = run_streak(&mut tracker, &params, 3);
        assert!(events.is_empty());
        assert_eq!(tracker.drain_rejections(), vec![RejectReason::TrackPoints]);
    }

    #[test]
    fn boundary_track_is_accepted() {
        // Exactly min_track_points points at exactly min_speed.
        let mut tracker = Tracker::new();
        let mut params = relaxed();
        params.min_track_points = 4;
        params.min_speed = 50.0;
        params.min_length = 20.0;

        // 60 px over 1.2 s = 50 px/s, 4 points.
        let mut events = Vec::new();
        for i in 0..4 {
            let c = candidate(100 + i * 20, 100, 230.0);
            events.extend(tracker.observe(&[c], i as f64 * 0.4, wall(), &params));
        }
        events.extend(tracker.observe(&[], 10.0, wall(), &params));
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn stationary_blob_is_rejected() {
        let mut tracker = Tracker::new();
        let mut params = relaxed();
        params.max_stationary_ratio = 0.40;

        for i in 0..5 {
            let c = candidate(50, 50, 220.0);
            tracker.observe(&[c], i as f64 * 0.1, wall(), &params);
        }
        let events = tracker.observe(&[], 10.0, wall(), &params);
        assert!(events.is_empty());
        assert_eq!(
            tracker.drain_rejections(),
            vec![RejectReason::StationaryRatio]
        );
    }

    #[test]
    fn slow_track_is_rejected_with_speed() {
        let mut tracker = Tracker::new();
        let mut params = relaxed();
        params.min_speed = 500.0;
        let events = run_streak(&mut tracker, &params, 6);
        assert!(events.is_empty());
        assert_eq!(tracker.drain_rejections(), vec![RejectReason::Speed]);
    }

    #[test]
    fn zigzag_is_rejected_with_linearity() {
        let mut tracker = Tracker::new();
        let mut params = relaxed();
        params.min_linearity = 0.9;
        params.max_distance = 200.0;

        let zigzag = [(20, 20), (60, 90), (100, 20), (140, 90), (180, 20)];
        for (i, (x, y)) in zigzag.iter().enumerate() {
            let c = candidate(*x, *y, 220.0);
            tracker.observe(&[c], i as f64 * 0.1, wall(), &params);
        }
        let events = tracker.observe(&[], 10.0, wall(), &params);
        assert!(events.is_empty());
        assert_eq!(tracker.drain_rejections(), vec![RejectReason::Linearity]);
    }

    #[test]
    fn track_along_nuisance_band_is_rejected() {
        let mut nuisance = Mat::zeros(120, 200, core::CV_8UC1)
            .unwrap()
            .to_mat()
            .unwrap();
        imgproc::rectangle(
            &mut nuisance,
            Rect::new(0, 55, 200, 10),
            Scalar::all(255.0),
            imgproc::FILLED,
            imgproc::LINE_8,
            0,
        )
        .unwrap();

        let mut tracker = Tracker::new();
        tracker.set_nuisance_mask(Some(nuisance));
        let params = relaxed();

        for i in 0..5 {
            let c = candidate(20 + i * 30, 60, 220.0);
            tracker.observe(&[c], i as f64 * 0.1, wall(), &params);
        }
        let events = tracker.observe(&[], 10.0, wall(), &params);
        assert!(events.is_empty());
        assert_eq!(tracker.drain_rejections(), vec![RejectReason::NuisancePath]);
    }

    #[test]
    fn two_parallel_streaks_stay_separate() {
        let mut tracker = Tracker::new();
        let params = relaxed();

        let mut events = Vec::new();
        for i in 0..6 {
            let ts = i as f64 * 0.1;
            let a = candidate(20 + i * 15, 30, 220.0);
            let b = candidate(20 + i * 15, 400, 220.0);
            events.extend(tracker.observe(&[a, b], ts, wall(), &params));
        }
        events.extend(tracker.observe(&[], 10.0, wall(), &params));
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn finalize_all_flushes_open_tracks() {
        let mut tracker = Tracker::new();
        let params = relaxed();
        for i in 0..6 {
            let c = candidate(20 + i * 15, 30 + i * 10, 220.0);
            tracker.observe(&[c], i as f64 * 0.1, wall(), &params);
        }
        assert!(tracker.has_active_tracks());
        let events = tracker.finalize_all(wall(), &params);
        assert_eq!(events.len(), 1);
        assert!(!tracker.has_active_tracks());
    }
}
