//! Per-camera runtime configuration.

use std::path::PathBuf;

use anyhow::{Result, bail};
use chrono_tz::Tz;
use detect_core::Sensitivity;

use crate::cli::CameraArgs;

/// Canonical configuration shared by every stage of the camera service.
#[derive(Clone, Debug)]
pub struct CameraConfig {
    pub url: String,
    pub camera_name: String,
    pub output_root: PathBuf,
    pub web_port: u16,
    pub sensitivity: Sensitivity,
    pub process_scale: f64,
    pub buffer_seconds: f64,
    pub exclude_bottom: f64,
    pub exclude_edge_ratio: f64,
    pub extract_clips: bool,
    pub fb_normalize: bool,
    pub fb_delete_mov: bool,
    pub mask_path: Option<String>,
    pub mask_dilate: i32,
    pub nuisance_mask_path: Option<String>,
    pub nuisance_dilate: i32,
    pub clip_margin_before: f64,
    pub clip_margin_after: f64,
    pub enable_time_window: bool,
    pub latitude: f64,
    pub longitude: f64,
    pub timezone: Tz,
    pub reconnect_delay: f64,
}

impl CameraConfig {
    /// Directory this camera writes detections into.
    pub fn camera_dir(&self) -> PathBuf {
        self.output_root.join(&self.camera_name)
    }

    pub fn masks_dir(&self) -> PathBuf {
        self.camera_dir().join("masks")
    }

    pub fn mask_file(&self) -> PathBuf {
        self.masks_dir()
            .join(format!("{}_mask.png", self.camera_name))
    }

    /// Last-applied settings, persisted for crash-safe restart.
    pub fn runtime_settings_path(&self) -> PathBuf {
        self.output_root
            .join("runtime_settings")
            .join(format!("{}.json", self.camera_name))
    }
}

impl TryFrom<CameraArgs> for CameraConfig {
    type Error = anyhow::Error;

    fn try_from(args: CameraArgs) -> Result<Self> {
        if !(args.url.starts_with("rtsp://") || args.url.starts_with("rtsps://")) {
            bail!("RTSP_URL must start with rtsp:// (got {:?})", args.url);
        }
        let Some(sensitivity) = Sensitivity::parse(&args.sensitivity) else {
            bail!(
                "SENSITIVITY must be one of low, medium, high, fireball (got {:?})",
                args.sensitivity
            );
        };
        if !(args.scale > 0.0 && args.scale <= 1.0) {
            bail!("SCALE must be in (0, 1] (got {})", args.scale);
        }
        if args.buffer <= 0.0 || !args.buffer.is_finite() {
            bail!("BUFFER must be a positive number of seconds (got {})", args.buffer);
        }
        if !(0.0..1.0).contains(&args.exclude_bottom) {
            bail!("EXCLUDE_BOTTOM must be in [0, 1) (got {})", args.exclude_bottom);
        }
        if !(0.0..0.5).contains(&args.exclude_edge_ratio) {
            bail!(
                "EXCLUDE_EDGE_RATIO must be in [0, 0.5) (got {})",
                args.exclude_edge_ratio
            );
        }
        if args.camera_name.is_empty()
            || !args
                .camera_name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
        {
            bail!("CAMERA_NAME must be a filesystem-safe name (got {:?})", args.camera_name);
        }
        let timezone: Tz = match args.timezone.parse() {
            Ok(tz) => tz,
            Err(_) => bail!("TIMEZONE is not a known IANA zone (got {:?})", args.timezone),
        };

        Ok(Self {
            url: args.url,
            camera_name: args.camera_name,
            output_root: PathBuf::from(args.output),
            web_port: args.web_port,
            sensitivity,
            process_scale: args.scale,
            buffer_seconds: args.buffer,
            exclude_bottom: args.exclude_bottom,
            exclude_edge_ratio: args.exclude_edge_ratio,
            extract_clips: args.extract_clips,
            fb_normalize: args.fb_normalize,
            fb_delete_mov: args.fb_delete_mov,
            mask_path: args.mask,
            mask_dilate: args.mask_dilate,
            nuisance_mask_path: args.nuisance_mask,
            nuisance_dilate: args.nuisance_dilate,
            clip_margin_before: args.clip_margin_before,
            clip_margin_after: args.clip_margin_after,
            enable_time_window: args.enable_time_window,
            latitude: args.latitude,
            longitude: args.longitude,
            timezone,
            reconnect_delay: args.reconnect_delay,
        })
    }
}
