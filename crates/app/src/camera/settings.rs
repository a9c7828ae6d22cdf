//! Durable per-camera settings with hot-reload semantics.
//!
//! Settings form a typed schema: every key is known, validated, and
//! classified as hot-applicable or restart-requiring. Hot keys take
//! effect at the next frame boundary through a swapped snapshot;
//! restart keys are persisted first and then trigger an in-process
//! pipeline rebuild.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{
    Arc, Mutex,
    atomic::{AtomicU64, Ordering},
};

use detect_core::{DetectionParams, Sensitivity};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::camera::config::CameraConfig;

/// Full mutable settings surface of one camera.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(flatten)]
    pub params: DetectionParams,

    pub sensitivity: Sensitivity,
    pub scale: f64,
    pub buffer: f64,
    pub extract_clips: bool,
    pub fb_normalize: bool,
    pub fb_delete_mov: bool,

    pub mask_path: Option<String>,
    pub mask_dilate: i32,
    pub nuisance_mask_path: Option<String>,
    pub nuisance_dilate: i32,
    pub clip_margin_before: f64,
    pub clip_margin_after: f64,
}

impl Settings {
    /// Initial settings derived from the process configuration: the
    /// sensitivity preset first, then the explicit overrides.
    pub fn from_config(config: &CameraConfig) -> Self {
        let mut params = DetectionParams::default();
        config.sensitivity.apply(&mut params);
        params.exclude_bottom_ratio = config.exclude_bottom;
        params.exclude_edge_ratio = config.exclude_edge_ratio;

        Self {
            params,
            sensitivity: config.sensitivity,
            scale: config.process_scale,
            buffer: config.buffer_seconds,
            extract_clips: config.extract_clips,
            fb_normalize: config.fb_normalize,
            fb_delete_mov: config.fb_delete_mov,
            mask_path: config.mask_path.clone(),
            mask_dilate: config.mask_dilate,
            nuisance_mask_path: config.nuisance_mask_path.clone(),
            nuisance_dilate: config.nuisance_dilate,
            clip_margin_before: config.clip_margin_before,
            clip_margin_after: config.clip_margin_after,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct SettingError {
    pub key: String,
    pub reason: String,
}

/// Result of one `/apply_settings` request.
#[derive(Clone, Debug, Default, Serialize)]
pub struct ApplyOutcome {
    pub success: bool,
    /// Keys whose value actually changed.
    pub applied: Vec<String>,
    pub errors: Vec<SettingError>,
    pub restart_required: bool,
    pub restart_requested: bool,
    /// Restart-class keys that changed in this request.
    pub restart_triggers: Vec<String>,
}

/// Snapshot-swapped settings cell plus its backing file.
pub struct SettingsStore {
    path: PathBuf,
    state: Mutex<Arc<Settings>>,
    generation: AtomicU64,
}

impl SettingsStore {
    /// Read persisted settings, falling back to `defaults` when the file
    /// is absent or unreadable.
    pub fn load_or_init(path: PathBuf, defaults: Settings) -> Self {
        let settings = match fs::read_to_string(&path) {
            Ok(data) => match serde_json::from_str::<Settings>(&data) {
                Ok(settings) => {
                    info!(path = %path.display(), "restored runtime settings");
                    settings
                }
                Err(err) => {
                    warn!(path = %path.display(), "runtime settings unreadable, using defaults: {err}");
                    defaults
                }
            },
            Err(_) => defaults,
        };
        Self {
            path,
            state: Mutex::new(Arc::new(settings)),
            generation: AtomicU64::new(0),
        }
    }

    /// Current immutable snapshot; cheap to take every frame.
    pub fn snapshot(&self) -> Arc<Settings> {
        self.state.lock().expect("settings cell poisoned").clone()
    }

    /// Bumped on every successful apply; the detection loop watches this
    /// to pick up hot changes.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Apply a partial settings object. Valid keys apply even when other
    /// keys in the same request fail; the snapshot is only swapped (and
    /// the file only rewritten) when something actually changed.
    pub fn apply(&self, patch: &serde_json::Map<String, Value>) -> ApplyOutcome {
        let mut outcome = ApplyOutcome::default();
        let mut guard = self.state.lock().expect("settings cell poisoned");
        let mut next = (**guard).clone();

        let mut keys: Vec<&String> = patch.keys().collect();
        keys.sort();
        for key in keys {
            let value = &patch[key];
            match apply_one(&mut next, key, value) {
                Ok(Applied::Unchanged) => {}
                Ok(Applied::Hot) => outcome.applied.push(key.clone()),
                Ok(Applied::Restart) => {
                    outcome.applied.push(key.clone());
                    outcome.restart_triggers.push(key.clone());
                }
                Err(reason) => outcome.errors.push(SettingError {
                    key: key.clone(),
                    reason,
                }),
            }
        }

        outcome.success = outcome.errors.is_empty();
        outcome.restart_required = !outcome.restart_triggers.is_empty();

        if !outcome.applied.is_empty() {
            let next = Arc::new(next);
            *guard = next.clone();
            self.generation.fetch_add(1, Ordering::Release);
            // Persist outside the lock; readers never wait on the disk.
            drop(guard);
            if let Err(err) = persist(&self.path, &next) {
                warn!(path = %self.path.display(), "failed to persist settings: {err}");
            }
        }
        outcome
    }

    /// Point the exclusion mask at a newly generated file (hot path used
    /// by `/update_mask`).
    pub fn set_mask_path(&self, path: String) {
        let mut guard = self.state.lock().expect("settings cell poisoned");
        if guard.mask_path.as_deref() == Some(path.as_str()) {
            return;
        }
        let mut next = (**guard).clone();
        next.mask_path = Some(path);
        let next = Arc::new(next);
        *guard = next.clone();
        self.generation.fetch_add(1, Ordering::Release);
        drop(guard);
        if let Err(err) = persist(&self.path, &next) {
            warn!(path = %self.path.display(), "failed to persist settings: {err}");
        }
    }
}

fn persist(path: &Path, settings: &Settings) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("json.tmp");
    let mut file = File::create(&tmp)?;
    serde_json::to_writer_pretty(&mut file, settings)?;
    file.flush()?;
    fs::rename(&tmp, path)?;
    Ok(())
}

enum Applied {
    Unchanged,
    Hot,
    Restart,
}

fn f64_value(value: &Value) -> Result<f64, String> {
    value
        .as_f64()
        .ok_or_else(|| "expected a number".to_string())
}

fn bool_value(value: &Value) -> Result<bool, String> {
    value
        .as_bool()
        .ok_or_else(|| "expected a boolean".to_string())
}

fn int_value(value: &Value) -> Result<i64, String> {
    value
        .as_i64()
        .ok_or_else(|| "expected an integer".to_string())
}

fn opt_string_value(value: &Value) -> Result<Option<String>, String> {
    match value {
        Value::Null => Ok(None),
        Value::String(s) if s.is_empty() => Ok(None),
        Value::String(s) => Ok(Some(s.clone())),
        _ => Err("expected a string or null".to_string()),
    }
}

fn ranged(value: f64, min: f64, max: f64) -> Result<f64, String> {
    if !value.is_finite() || value < min || value > max {
        Err(format!("must be between {min} and {max}"))
    } else {
        Ok(value)
    }
}

fn positive(value: f64) -> Result<f64, String> {
    if !value.is_finite() || value <= 0.0 {
        Err("must be a positive number".to_string())
    } else {
        Ok(value)
    }
}

macro_rules! set_field {
    ($target:expr, $new:expr, $class:expr) => {{
        let new = $new;
        if $target == new {
            Ok(Applied::Unchanged)
        } else {
            $target = new;
            Ok($class)
        }
    }};
}

fn apply_one(settings: &mut Settings, key: &str, value: &Value) -> Result<Applied, String> {
    use Applied::{Hot, Restart};
    let p = &mut settings.params;
    match key {
        // Detector / tracker numeric envelope: all hot.
        "diff_threshold" => {
            let v = ranged(f64_value(value)?, 1.0, 255.0)? as i32;
            set_field!(p.diff_threshold, v, Hot)
        }
        "min_brightness" => set_field!(p.min_brightness, ranged(f64_value(value)?, 0.0, 255.0)?, Hot),
        "min_brightness_tracking" => set_field!(
            p.min_brightness_tracking,
            ranged(f64_value(value)?, 0.0, 255.0)?,
            Hot
        ),
        "min_length" => set_field!(p.min_length, positive(f64_value(value)?)?, Hot),
        "max_length" => set_field!(p.max_length, positive(f64_value(value)?)?, Hot),
        "min_duration" => set_field!(p.min_duration, positive(f64_value(value)?)?, Hot),
        "max_duration" => set_field!(p.max_duration, positive(f64_value(value)?)?, Hot),
        "min_speed" => set_field!(p.min_speed, positive(f64_value(value)?)?, Hot),
        "min_linearity" => set_field!(p.min_linearity, ranged(f64_value(value)?, 0.0, 1.0)?, Hot),
        "min_area" => set_field!(p.min_area, positive(f64_value(value)?)?, Hot),
        "max_area" => set_field!(p.max_area, positive(f64_value(value)?)?, Hot),
        "max_gap_time" => set_field!(p.max_gap_time, positive(f64_value(value)?)?, Hot),
        "max_distance" => set_field!(p.max_distance, positive(f64_value(value)?)?, Hot),
        "merge_max_gap_time" => set_field!(p.merge_max_gap_time, positive(f64_value(value)?)?, Hot),
        "merge_max_distance" => set_field!(p.merge_max_distance, positive(f64_value(value)?)?, Hot),
        "merge_max_speed_ratio" => set_field!(
            p.merge_max_speed_ratio,
            ranged(f64_value(value)?, 0.01, 1.0)?,
            Hot
        ),
        "exclude_bottom_ratio" => set_field!(
            p.exclude_bottom_ratio,
            ranged(f64_value(value)?, 0.0, 0.99)?,
            Hot
        ),
        "exclude_edge_ratio" => set_field!(
            p.exclude_edge_ratio,
            ranged(f64_value(value)?, 0.0, 0.49)?,
            Hot
        ),
        "nuisance_overlap_threshold" => set_field!(
            p.nuisance_overlap_threshold,
            ranged(f64_value(value)?, 0.0, 1.0)?,
            Hot
        ),
        "nuisance_path_overlap_threshold" => set_field!(
            p.nuisance_path_overlap_threshold,
            ranged(f64_value(value)?, 0.0, 1.0)?,
            Hot
        ),
        "min_track_points" => {
            let v = int_value(value)?;
            if v < 1 {
                return Err("must be at least 1".to_string());
            }
            set_field!(p.min_track_points, v as usize, Hot)
        }
        "max_stationary_ratio" => set_field!(
            p.max_stationary_ratio,
            ranged(f64_value(value)?, 0.0, 1.0)?,
            Hot
        ),
        "small_area_threshold" => set_field!(p.small_area_threshold, positive(f64_value(value)?)?, Hot),

        // Mask and clip handling: hot.
        "mask_path" => set_field!(settings.mask_path, opt_string_value(value)?, Hot),
        "mask_dilate" => {
            let v = int_value(value)?;
            if !(0..=200).contains(&v) {
                return Err("must be between 0 and 200".to_string());
            }
            set_field!(settings.mask_dilate, v as i32, Hot)
        }
        "nuisance_mask_path" => set_field!(settings.nuisance_mask_path, opt_string_value(value)?, Hot),
        "nuisance_dilate" => {
            let v = int_value(value)?;
            if !(0..=200).contains(&v) {
                return Err("must be between 0 and 200".to_string());
            }
            set_field!(settings.nuisance_dilate, v as i32, Hot)
        }
        "clip_margin_before" => set_field!(
            settings.clip_margin_before,
            ranged(f64_value(value)?, 0.0, 60.0)?,
            Hot
        ),
        "clip_margin_after" => set_field!(
            settings.clip_margin_after,
            ranged(f64_value(value)?, 0.0, 60.0)?,
            Hot
        ),

        // Pipeline-shape keys: applying them needs a rebuild.
        "sensitivity" => {
            let raw = value.as_str().ok_or_else(|| "expected a string".to_string())?;
            let preset = Sensitivity::parse(raw)
                .ok_or_else(|| "must be one of low, medium, high, fireball".to_string())?;
            if settings.sensitivity == preset {
                Ok(Applied::Unchanged)
            } else {
                settings.sensitivity = preset;
                preset.apply(&mut settings.params);
                Ok(Restart)
            }
        }
        "scale" => {
            let v = f64_value(value)?;
            if !(v > 0.0 && v <= 1.0) {
                return Err("must be in (0, 1]".to_string());
            }
            set_field!(settings.scale, v, Restart)
        }
        "buffer" => set_field!(settings.buffer, ranged(f64_value(value)?, 1.0, 600.0)?, Restart),
        "extract_clips" => set_field!(settings.extract_clips, bool_value(value)?, Restart),
        "fb_normalize" => set_field!(settings.fb_normalize, bool_value(value)?, Restart),
        "fb_delete_mov" => set_field!(settings.fb_delete_mov, bool_value(value)?, Restart),

        _ => Err("unknown setting".to_string()),
    }
}
