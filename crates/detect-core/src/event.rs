//! Finalised meteor events and their persisted form.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// An accepted track, frozen at finalisation.
#[derive(Clone, Debug)]
pub struct MeteorEvent {
    /// Wall-clock time the event was finalised (camera-local, naive).
    pub wall: NaiveDateTime,
    /// Monotonic stream seconds of the first track point.
    pub start_ts: f64,
    /// Monotonic stream seconds of the last track point.
    pub end_ts: f64,
    pub start_point: (i32, i32),
    pub end_point: (i32, i32),
    pub peak_brightness: f64,
    pub confidence: f64,
}

impl MeteorEvent {
    pub fn duration(&self) -> f64 {
        self.end_ts - self.start_ts
    }

    pub fn length(&self) -> f64 {
        let dx = (self.end_point.0 - self.start_point.0) as f64;
        let dy = (self.end_point.1 - self.start_point.1) as f64;
        dx.hypot(dy)
    }

    /// Stem shared by the clip and composite files.
    pub fn base_name(&self) -> String {
        format!("meteor_{}", self.wall.format("%Y%m%d_%H%M%S"))
    }

    /// Wall-timestamp string used as the JSONL/label key.
    pub fn timestamp_key(&self) -> String {
        self.wall.format("%Y-%m-%dT%H:%M:%S%.6f").to_string()
    }

    pub fn to_record(&self) -> DetectionRecord {
        DetectionRecord {
            timestamp: self.timestamp_key(),
            start_time: round(self.start_ts, 3),
            end_time: round(self.end_ts, 3),
            duration: round(self.duration(), 3),
            start_point: [self.start_point.0, self.start_point.1],
            end_point: [self.end_point.0, self.end_point.1],
            length_pixels: round(self.length(), 1),
            peak_brightness: round(self.peak_brightness, 1),
            confidence: round(self.confidence, 2),
        }
    }
}

/// One line of `detections.jsonl`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DetectionRecord {
    pub timestamp: String,
    pub start_time: f64,
    pub end_time: f64,
    pub duration: f64,
    pub start_point: [i32; 2],
    pub end_point: [i32; 2],
    pub length_pixels: f64,
    pub peak_brightness: f64,
    pub confidence: f64,
}

impl DetectionRecord {
    /// Parse the wall timestamp back out of the record.
    pub fn wall(&self) -> Option<NaiveDateTime> {
        NaiveDateTime::parse_from_str(&self.timestamp, "%Y-%m-%dT%H:%M:%S%.f").ok()
    }

    pub fn base_name(&self) -> Option<String> {
        self.wall()
            .map(|dt| format!("meteor_{}", dt.format("%Y%m%d_%H%M%S")))
    }
}

fn round(value: f64, decimals: u32) -> f64 {
    let factor = 10f64.powi(decimals as i32);
    (value * factor).round() / factor
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn sample() -> MeteorEvent {
        MeteorEvent {
            wall: NaiveDate::from_ymd_opt(2026, 2, 2)
                .unwrap()
                .and_hms_micro_opt(6, 55, 33, 411_811)
                .unwrap(),
            start_ts: 125.3401,
            end_ts: 125.7804,
            start_point: (320, 180),
            end_point: (450, 220),
            peak_brightness: 245.34,
            confidence: 0.8712,
        }
    }

    #[test]
    fn record_fields_are_rounded() {
        let record = sample().to_record();
        assert_eq!(record.timestamp, "2026-02-02T06:55:33.411811");
        assert_eq!(record.start_time, 125.34);
        assert_eq!(record.end_time, 125.78);
        assert_eq!(record.duration, 0.44);
        assert_eq!(record.peak_brightness, 245.3);
        assert_eq!(record.confidence, 0.87);
    }

    #[test]
    fn record_roundtrips_byte_identically() {
        let record = sample().to_record();
        let line = serde_json::to_string(&record).unwrap();
        let back: DetectionRecord = serde_json::from_str(&line).unwrap();
        assert_eq!(serde_json::to_string(&back).unwrap(), line);
    }

    #[test]
    fn base_name_uses_wall_time() {
        assert_eq!(sample().base_name(), "meteor_20260202_065533");
        let record = sample().to_record();
        assert_eq!(record.base_name().as_deref(), Some("meteor_20260202_065533"));
    }
}
