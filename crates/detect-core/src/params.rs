//! Detection parameter envelope and sensitivity presets.

use serde::{Deserialize, Serialize};

/// Numeric envelope for the detector and tracker.
///
/// Immutable within one detection step; the pipeline swaps in a fresh
/// snapshot between frames when settings change.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionParams {
    /// Binary threshold applied to the frame difference.
    pub diff_threshold: i32,
    /// Minimum mean brightness for a candidate to seed a track.
    pub min_brightness: f64,
    /// Relaxed brightness gate used while a track is already being followed.
    pub min_brightness_tracking: f64,
    pub min_length: f64,
    pub max_length: f64,
    pub min_duration: f64,
    pub max_duration: f64,
    /// Minimum mean speed in px/s.
    pub min_speed: f64,
    /// Minimum PCA linearity (major eigenvalue / total variance).
    pub min_linearity: f64,
    pub min_area: f64,
    pub max_area: f64,
    /// Seconds without a match before a track closes.
    pub max_gap_time: f64,
    /// Association radius in pixels.
    pub max_distance: f64,
    pub merge_max_gap_time: f64,
    pub merge_max_distance: f64,
    /// Lower bound of the acceptable speed ratio between merged tracks.
    pub merge_max_speed_ratio: f64,
    /// Fraction of the frame height excluded at the bottom (timestamps etc).
    pub exclude_bottom_ratio: f64,
    /// Per-side exclusion band as a fraction of the smaller dimension.
    pub exclude_edge_ratio: f64,
    pub nuisance_overlap_threshold: f64,
    pub nuisance_path_overlap_threshold: f64,
    pub min_track_points: usize,
    pub max_stationary_ratio: f64,
    /// Candidates at or below this area are checked against the nuisance mask.
    pub small_area_threshold: f64,
}

impl Default for DetectionParams {
    fn default() -> Self {
        Self {
            diff_threshold: 30,
            min_brightness: 200.0,
            min_brightness_tracking: 160.0,
            min_length: 20.0,
            max_length: 5000.0,
            min_duration: 0.1,
            max_duration: 10.0,
            min_speed: 50.0,
            min_linearity: 0.7,
            min_area: 5.0,
            max_area: 10000.0,
            max_gap_time: 2.0,
            max_distance: 80.0,
            merge_max_gap_time: 1.5,
            merge_max_distance: 80.0,
            merge_max_speed_ratio: 0.5,
            exclude_bottom_ratio: 1.0 / 16.0,
            exclude_edge_ratio: 0.0,
            nuisance_overlap_threshold: 0.60,
            nuisance_path_overlap_threshold: 0.70,
            min_track_points: 4,
            max_stationary_ratio: 0.40,
            small_area_threshold: 40.0,
        }
    }
}

/// Named sensitivity presets adjusting the brightness/threshold pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sensitivity {
    Low,
    Medium,
    High,
    /// Long, bright events; relaxes speed, linearity and duration gates.
    Fireball,
}

impl Sensitivity {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            "fireball" => Some(Self::Fireball),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Fireball => "fireball",
        }
    }

    /// Apply the preset on top of `params`.
    pub fn apply(&self, params: &mut DetectionParams) {
        match self {
            Self::Low => {
                params.diff_threshold = 40;
                params.min_brightness = 220.0;
            }
            Self::Medium => {
                params.diff_threshold = 30;
                params.min_brightness = 200.0;
            }
            Self::High => {
                params.diff_threshold = 20;
                params.min_brightness = 180.0;
            }
            Self::Fireball => {
                params.diff_threshold = 15;
                params.min_brightness = 150.0;
                params.max_duration = 20.0;
                params.min_speed = 20.0;
                params.min_linearity = 0.6;
            }
        }
        params.min_brightness_tracking = (params.min_brightness - 40.0).max(0.0);
    }
}
