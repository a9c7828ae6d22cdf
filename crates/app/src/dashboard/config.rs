//! Dashboard configuration: camera roster from numbered env pairs plus
//! monitor tuning.

use std::path::PathBuf;

use anyhow::{Result, bail};
use chrono_tz::Tz;

use crate::cli::DashboardArgs;

/// One camera service the dashboard talks to.
#[derive(Clone, Debug)]
pub struct CameraEndpoint {
    pub name: String,
    pub url: String,
}

#[derive(Clone, Copy, Debug)]
pub struct MonitorConfig {
    pub enabled: bool,
    pub interval: f64,
    pub timeout: f64,
    pub restart_delay: f64,
    pub restart_cooldown: f64,
    pub restart_max_count: u32,
}

#[derive(Clone, Debug)]
pub struct DashboardConfig {
    pub port: u16,
    pub detections_dir: PathBuf,
    pub cameras: Vec<CameraEndpoint>,
    pub cache_interval: f64,
    pub monitor: MonitorConfig,
    pub latitude: f64,
    pub longitude: f64,
    pub timezone: Tz,
    pub enable_time_window: bool,
}

impl DashboardConfig {
    pub fn camera_dir(&self, camera_name: &str) -> PathBuf {
        self.detections_dir.join(camera_name)
    }

    pub fn camera(&self, index: usize) -> Option<&CameraEndpoint> {
        self.cameras.get(index)
    }
}

/// `CAMERA1_NAME`/`CAMERA1_URL` .. `CAMERA9_NAME`/`CAMERA9_URL`.
fn cameras_from_env() -> Vec<CameraEndpoint> {
    let mut cameras = Vec::new();
    for i in 1..10 {
        let name = std::env::var(format!("CAMERA{i}_NAME")).ok();
        let url = std::env::var(format!("CAMERA{i}_URL")).ok();
        if let (Some(name), Some(url)) = (name, url) {
            if !name.is_empty() && !url.is_empty() {
                cameras.push(CameraEndpoint {
                    name,
                    url: url.trim_end_matches('/').to_string(),
                });
            }
        }
    }
    cameras
}

impl TryFrom<DashboardArgs> for DashboardConfig {
    type Error = anyhow::Error;

    fn try_from(args: DashboardArgs) -> Result<Self> {
        let cameras = cameras_from_env();
        if cameras.is_empty() {
            bail!("no cameras configured; set CAMERA1_NAME and CAMERA1_URL");
        }
        if args.cache_interval <= 0.0 || args.monitor_interval <= 0.0 {
            bail!("poll intervals must be positive");
        }
        let timezone: Tz = match args.timezone.parse() {
            Ok(tz) => tz,
            Err(_) => bail!("TIMEZONE is not a known IANA zone (got {:?})", args.timezone),
        };

        Ok(Self {
            port: args.port,
            detections_dir: PathBuf::from(args.detections_dir),
            cameras,
            cache_interval: args.cache_interval,
            monitor: MonitorConfig {
                enabled: args.monitor_enabled,
                interval: args.monitor_interval,
                timeout: args.monitor_timeout,
                restart_delay: args.restart_delay,
                restart_cooldown: args.restart_cooldown,
                restart_max_count: args.restart_max_count,
            },
            latitude: args.latitude,
            longitude: args.longitude,
            timezone,
            enable_time_window: args.enable_time_window,
        })
    }
}
