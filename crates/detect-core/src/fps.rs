//! Effective-FPS estimation from frame timestamps.
//!
//! Clip playback speed must come from the observed inter-frame deltas,
//! not the stream's advertised rate, which cameras frequently misreport.

use video_ingest::{Frame, sanitize_fps};

/// Median inter-frame delta of `frames`, inverted and sanitised.
/// Falls back to `fallback_fps` when there are not enough samples.
pub fn estimate_fps(frames: &[Frame], fallback_fps: f64) -> f64 {
    let fallback = sanitize_fps(fallback_fps, 30.0);
    if frames.len() < 2 {
        return fallback;
    }

    let mut deltas: Vec<f64> = frames
        .windows(2)
        .map(|pair| pair[1].ts - pair[0].ts)
        .filter(|dt| *dt > 0.0)
        .collect();
    if deltas.is_empty() {
        return fallback;
    }

    deltas.sort_by(|a, b| a.partial_cmp(b).expect("finite deltas"));
    let median = if deltas.len() % 2 == 1 {
        deltas[deltas.len() / 2]
    } else {
        let mid = deltas.len() / 2;
        (deltas[mid - 1] + deltas[mid]) / 2.0
    };
    if median <= 0.0 {
        return fallback;
    }

    sanitize_fps(1.0 / median, fallback)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use chrono::Utc;
    use opencv::core::Mat;
    use std::sync::Arc;

    fn frames(timestamps: &[f64]) -> Vec<Frame> {
        timestamps
            .iter()
            .map(|&ts| Frame {
                ts,
                wall: Utc::now(),
                mat: Arc::new(Mat::default()),
            })
            .collect()
    }

    #[test]
    fn steady_cadence_recovers_rate() {
        let frames = frames(&[0.0, 0.04, 0.08, 0.12, 0.16]);
        assert_relative_eq!(estimate_fps(&frames, 30.0), 25.0, epsilon = 1e-6);
    }

    #[test]
    fn median_ignores_one_stall() {
        // One 400 ms hiccup among 25 fps deltas must not halve the estimate.
        let frames = frames(&[0.0, 0.04, 0.08, 0.48, 0.52, 0.56, 0.60]);
        assert_relative_eq!(estimate_fps(&frames, 30.0), 25.0, epsilon = 1e-6);
    }

    #[test]
    fn too_few_samples_fall_back() {
        let frames = frames(&[1.0]);
        assert_eq!(estimate_fps(&frames, 24.0), 24.0);
        assert_eq!(estimate_fps(&[], 0.0), 30.0);
    }

    #[test]
    fn implausible_estimate_falls_back() {
        // 0.1 ms deltas imply 10 kfps; sanitisation rejects it.
        let frames = frames(&[0.0, 0.0001, 0.0002]);
        assert_eq!(estimate_fps(&frames, 25.0), 25.0);
    }
}
