//! Merges consecutively finalised tracks that belong to one physical event.
//!
//! A streak that saturates the sensor or blinks behind thin cloud closes as
//! two or more tracks; events are therefore parked briefly and stitched
//! together when the gap, endpoint distance and speed ratio all agree.

use std::collections::VecDeque;

use crate::event::MeteorEvent;
use crate::params::DetectionParams;

pub struct EventMerger {
    pending: VecDeque<MeteorEvent>,
}

impl EventMerger {
    pub fn new() -> Self {
        Self {
            pending: VecDeque::new(),
        }
    }

    /// Queue a freshly finalised event, merging it into the previous one
    /// when the gates allow. Returns events whose merge window has passed.
    pub fn add_event(
        &mut self,
        event: MeteorEvent,
        params: &DetectionParams,
    ) -> Vec<MeteorEvent> {
        let flush_from = event.start_ts;
        if let Some(prev) = self.pending.back_mut() {
            if is_mergeable(prev, &event, params) {
                *prev = merge(prev, &event);
                return self.flush_expired(flush_from, params);
            }
        }
        self.pending.push_back(event);
        self.flush_expired(flush_from, params)
    }

    /// Release every pending event that can no longer gain a continuation.
    pub fn flush_expired(
        &mut self,
        current_ts: f64,
        params: &DetectionParams,
    ) -> Vec<MeteorEvent> {
        let cutoff = current_ts - params.merge_max_gap_time;
        let mut out = Vec::new();
        while let Some(front) = self.pending.front() {
            if front.end_ts < cutoff {
                out.push(self.pending.pop_front().expect("front checked"));
            } else {
                break;
            }
        }
        out
    }

    /// Drain everything, e.g. at shutdown.
    pub fn flush_all(&mut self) -> Vec<MeteorEvent> {
        self.pending.drain(..).collect()
    }
}

impl Default for EventMerger {
    fn default() -> Self {
        Self::new()
    }
}

fn mean_speed(event: &MeteorEvent) -> f64 {
    event.length() / event.duration().max(0.001)
}

fn is_mergeable(prev: &MeteorEvent, next: &MeteorEvent, params: &DetectionParams) -> bool {
    let gap = next.start_ts - prev.end_ts;
    if gap < 0.0 || gap > params.merge_max_gap_time {
        return false;
    }

    let dx = (next.start_point.0 - prev.end_point.0) as f64;
    let dy = (next.start_point.1 - prev.end_point.1) as f64;
    if dx.hypot(dy) > params.merge_max_distance {
        return false;
    }

    let ratio = mean_speed(prev) / mean_speed(next).max(0.001);
    let lower = params.merge_max_speed_ratio;
    (lower..=1.0 / lower).contains(&ratio)
}

fn merge(prev: &MeteorEvent, next: &MeteorEvent) -> MeteorEvent {
    MeteorEvent {
        wall: prev.wall,
        start_ts: prev.start_ts,
        end_ts: next.end_ts,
        start_point: prev.start_point,
        end_point: next.end_point,
        peak_brightness: prev.peak_brightness.max(next.peak_brightness),
        confidence: prev.confidence.max(next.confidence),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn event(start_ts: f64, end_ts: f64, start: (i32, i32), end: (i32, i32)) -> MeteorEvent {
        MeteorEvent {
            wall: NaiveDate::from_ymd_opt(2026, 2, 2)
                .unwrap()
                .and_hms_opt(3, 0, 0)
                .unwrap(),
            start_ts,
            end_ts,
            start_point: start,
            end_point: end,
            peak_brightness: 230.0,
            confidence: 0.8,
        }
    }

    fn params() -> DetectionParams {
        DetectionParams::default()
    }

    #[test]
    fn blinking_streak_merges_into_one() {
        let mut merger = EventMerger::new();
        // ~316 px/s, resumes 0.8 s later 45 px away at similar speed.
        let first = event(10.0, 10.5, (100, 100), (250, 150));
        let second = event(11.3, 11.8, (280, 160), (430, 210));

        assert!(merger.add_event(first, &params()).is_empty());
        assert!(merger.add_event(second, &params()).is_empty());

        let out = merger.flush_all();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].start_point, (100, 100));
        assert_eq!(out[0].end_point, (430, 210));
        assert_eq!(out[0].start_ts, 10.0);
        assert_eq!(out[0].end_ts, 11.8);
    }

    #[test]
    fn distant_resume_stays_two_events() {
        let mut merger = EventMerger::new();
        let first = event(10.0, 10.5, (100, 100), (250, 150));
        let second = event(11.3, 11.8, (600, 400), (750, 450));

        merger.add_event(first, &params());
        merger.add_event(second, &params());
        assert_eq!(merger.flush_all().len(), 2);
    }

    #[test]
    fn speed_mismatch_blocks_merge() {
        let mut merger = EventMerger::new();
        // 300 px/s followed by a crawl at ~30 px/s from the same spot.
        let first = event(10.0, 10.5, (100, 100), (250, 150));
        let second = event(11.0, 12.0, (260, 155), (280, 175));

        merger.add_event(first, &params());
        merger.add_event(second, &params());
        assert_eq!(merger.flush_all().len(), 2);
    }

    #[test]
    fn expired_events_flush_on_later_activity() {
        let mut merger = EventMerger::new();
        let first = event(10.0, 10.5, (100, 100), (250, 150));
        merger.add_event(first, &params());

        // Something far in the future pushes the first event out.
        let late = event(60.0, 60.4, (10, 10), (60, 40));
        let flushed = merger.add_event(late, &params());
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].start_ts, 10.0);
        assert_eq!(merger.flush_all().len(), 1);
    }

    #[test]
    fn merge_is_left_associative_over_three_segments() {
        let mut merger = EventMerger::new();
        let a = event(10.0, 10.4, (100, 100), (220, 140));
        let b = event(10.9, 11.3, (240, 147), (360, 187));
        let c = event(11.8, 12.2, (380, 194), (500, 234));

        merger.add_event(a, &params());
        merger.add_event(b, &params());
        merger.add_event(c, &params());

        let out = merger.flush_all();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].start_point, (100, 100));
        assert_eq!(out[0].end_point, (500, 234));
    }
}
