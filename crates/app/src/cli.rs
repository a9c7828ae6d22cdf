//! CLI dispatcher for the `meteor` binary.
//!
//! Every flag doubles as an environment variable so the same binary runs
//! unchanged under docker-compose, where configuration arrives as env.

use clap::{ArgAction, Parser, Subcommand};
use thiserror::Error;

use crate::camera::{self, config::CameraConfig};
use crate::dashboard::{self, config::DashboardConfig};

#[derive(Debug, Error)]
pub enum FatalError {
    /// Bad configuration: exit code 2, the supervisor should not retry
    /// blindly.
    #[error(transparent)]
    Config(anyhow::Error),
    #[error(transparent)]
    Runtime(anyhow::Error),
}

/// Parse arguments and run the requested service.
pub fn dispatch() -> Result<(), FatalError> {
    let cli = MeteorCli::parse();
    match cli.command {
        Command::Camera(args) => {
            let config = CameraConfig::try_from(args).map_err(FatalError::Config)?;
            camera::run(config).map_err(FatalError::Runtime)
        }
        Command::Dashboard(args) => {
            let config = DashboardConfig::try_from(args).map_err(FatalError::Config)?;
            dashboard::run(config).map_err(FatalError::Runtime)
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "meteor", version, about = "Real-time meteor detection")]
struct MeteorCli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the per-camera detection service.
    Camera(CameraArgs),
    /// Run the multi-camera dashboard.
    Dashboard(DashboardArgs),
}

#[derive(Debug, Parser)]
pub struct CameraArgs {
    /// RTSP stream URL.
    #[arg(long, env = "RTSP_URL")]
    pub url: String,

    #[arg(long, env = "CAMERA_NAME", default_value = "camera")]
    pub camera_name: String,

    /// Root directory for detections; each camera writes into its own
    /// subdirectory.
    #[arg(short, long, env = "OUTPUT_DIR", default_value = "meteor_detections")]
    pub output: String,

    /// Detection sensitivity preset: low, medium, high, fireball.
    #[arg(long, env = "SENSITIVITY", default_value = "medium")]
    pub sensitivity: String,

    /// Processing resolution scale in (0, 1].
    #[arg(long, env = "SCALE", default_value_t = 0.5)]
    pub scale: f64,

    /// Ring buffer length in seconds.
    #[arg(long, env = "BUFFER", default_value_t = 15.0)]
    pub buffer: f64,

    /// Bottom fraction of the frame excluded from detection.
    #[arg(long, env = "EXCLUDE_BOTTOM", default_value_t = 1.0 / 16.0)]
    pub exclude_bottom: f64,

    /// Per-side exclusion band as a fraction of the smaller dimension.
    #[arg(long, env = "EXCLUDE_EDGE_RATIO", default_value_t = 0.0)]
    pub exclude_edge_ratio: f64,

    /// Write video clips for each detection.
    #[arg(long, env = "EXTRACT_CLIPS", default_value_t = true, action = ArgAction::Set)]
    pub extract_clips: bool,

    /// Normalise clips to H.264 baseline MP4 via ffmpeg.
    #[arg(long, env = "FB_NORMALIZE", default_value_t = false, action = ArgAction::Set)]
    pub fb_normalize: bool,

    /// Remove the original .mov after a successful normalisation.
    #[arg(long, env = "FB_DELETE_MOV", default_value_t = false, action = ArgAction::Set)]
    pub fb_delete_mov: bool,

    /// HTTP preview/control port.
    #[arg(long, env = "WEB_PORT", default_value_t = 8080)]
    pub web_port: u16,

    /// Exclusion mask image path.
    #[arg(long, env = "MASK_PATH")]
    pub mask: Option<String>,

    /// Dilation radius applied to the exclusion mask, in pixels.
    #[arg(long, env = "MASK_DILATE", default_value_t = 20)]
    pub mask_dilate: i32,

    /// Nuisance mask image path (wires, blinking antennas).
    #[arg(long, env = "NUISANCE_MASK_PATH")]
    pub nuisance_mask: Option<String>,

    /// Dilation radius applied to the nuisance mask, in pixels.
    #[arg(long, env = "NUISANCE_MASK_DILATE", default_value_t = 0)]
    pub nuisance_dilate: i32,

    /// Seconds of video kept before the event in each clip.
    #[arg(long, env = "CLIP_MARGIN_BEFORE", default_value_t = 0.5)]
    pub clip_margin_before: f64,

    /// Seconds of video kept after the event in each clip.
    #[arg(long, env = "CLIP_MARGIN_AFTER", default_value_t = 0.5)]
    pub clip_margin_after: f64,

    /// Only detect between sunset and sunrise.
    #[arg(long, env = "ENABLE_TIME_WINDOW", default_value_t = false, action = ArgAction::Set)]
    pub enable_time_window: bool,

    #[arg(long, env = "LATITUDE", default_value_t = 35.3606)]
    pub latitude: f64,

    #[arg(long, env = "LONGITUDE", default_value_t = 138.7274)]
    pub longitude: f64,

    /// IANA timezone name for the twilight window.
    #[arg(long, env = "TIMEZONE", default_value = "Asia/Tokyo")]
    pub timezone: String,

    /// Seconds between RTSP reconnect attempts.
    #[arg(long, env = "RECONNECT_DELAY", default_value_t = 5.0)]
    pub reconnect_delay: f64,
}

#[derive(Debug, Parser)]
pub struct DashboardArgs {
    #[arg(long, env = "PORT", default_value_t = 8080)]
    pub port: u16,

    /// Directory the cameras write their detections into.
    #[arg(long, env = "DETECTIONS_DIR", default_value = "meteor_detections")]
    pub detections_dir: String,

    /// Poll interval for the detection file watcher, seconds.
    #[arg(long, env = "DETECTION_MONITOR_INTERVAL", default_value_t = 2.0)]
    pub cache_interval: f64,

    /// Enable the camera liveness monitor.
    #[arg(long, env = "CAMERA_MONITOR_ENABLED", default_value_t = true, action = ArgAction::Set)]
    pub monitor_enabled: bool,

    /// Seconds between liveness polls.
    #[arg(long, env = "CAMERA_MONITOR_INTERVAL", default_value_t = 60.0)]
    pub monitor_interval: f64,

    /// Seconds without frames before a camera counts as stopped.
    #[arg(long, env = "CAMERA_MONITOR_TIMEOUT", default_value_t = 120.0)]
    pub monitor_timeout: f64,

    /// Delay between detecting an outage and issuing the restart.
    #[arg(long, env = "CAMERA_RESTART_DELAY", default_value_t = 5.0)]
    pub restart_delay: f64,

    /// Minimum seconds between automatic restarts of one camera.
    #[arg(long, env = "CAMERA_RESTART_COOLDOWN_SEC", default_value_t = 300.0)]
    pub restart_cooldown: f64,

    /// Automatic restarts allowed per camera before giving up.
    #[arg(long, env = "CAMERA_RESTART_MAX_COUNT", default_value_t = 10)]
    pub restart_max_count: u32,

    #[arg(long, env = "LATITUDE", default_value_t = 35.3606)]
    pub latitude: f64,

    #[arg(long, env = "LONGITUDE", default_value_t = 138.7274)]
    pub longitude: f64,

    #[arg(long, env = "TIMEZONE", default_value = "Asia/Tokyo")]
    pub timezone: String,

    #[arg(long, env = "ENABLE_TIME_WINDOW", default_value_t = false, action = ArgAction::Set)]
    pub enable_time_window: bool,
}
