//! In-memory detection listing, rebuilt when the files on disk move.
//!
//! `/detections` must answer in O(1) no matter how large the archive
//! grows, so a watcher thread compares the max mtime across every
//! camera's `detections.jsonl` and label file and rebuilds the sorted
//! listing only when something changed.

use std::fs;
use std::path::Path;
use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, Ordering},
};
use std::thread::JoinHandle;
use std::time::{Duration, UNIX_EPOCH};

use serde::Serialize;
use tracing::{debug, warn};

use crate::dashboard::config::DashboardConfig;
use crate::store;

/// One row of the `/detections` listing.
#[derive(Clone, Debug, Serialize)]
pub struct DetectionEntry {
    /// Display time, `YYYY-MM-DD HH:MM:SS`.
    pub time: String,
    /// Full wall-timestamp key as written by the camera.
    pub timestamp: String,
    pub camera: String,
    pub confidence: String,
    pub image: String,
    pub mp4: String,
    pub composite_original: String,
    pub label: String,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct CacheSnapshot {
    pub mtime: f64,
    pub total: usize,
    pub recent: Vec<DetectionEntry>,
}

pub struct DetectionCache {
    config: Arc<DashboardConfig>,
    state: Mutex<CacheSnapshot>,
}

impl DetectionCache {
    pub fn new(config: Arc<DashboardConfig>) -> Self {
        let cache = Self {
            config,
            state: Mutex::new(CacheSnapshot::default()),
        };
        cache.refresh(true);
        cache
    }

    pub fn snapshot(&self) -> CacheSnapshot {
        self.state.lock().expect("detection cache poisoned").clone()
    }

    /// Rebuild when the on-disk mtime moved (or unconditionally on
    /// `force`). The rebuild happens outside the cache lock.
    pub fn refresh(&self, force: bool) {
        let latest = self.latest_mtime();
        {
            let state = self.state.lock().expect("detection cache poisoned");
            if !force && (latest - state.mtime).abs() < f64::EPSILON {
                return;
            }
        }

        let (total, recent) = self.build_listing();
        let mut state = self.state.lock().expect("detection cache poisoned");
        state.mtime = latest;
        state.total = total;
        state.recent = recent;
        debug!(total, mtime = latest, "detection cache rebuilt");
    }

    /// Max mtime across every camera's detection log and label file.
    fn latest_mtime(&self) -> f64 {
        let mut latest = 0.0f64;
        for camera in &self.config.cameras {
            let dir = self.config.camera_dir(&camera.name);
            for file in [store::DETECTIONS_FILE, store::LABELS_FILE] {
                if let Some(mtime) = file_mtime(&dir.join(file)) {
                    latest = latest.max(mtime);
                }
            }
        }
        latest
    }

    fn build_listing(&self) -> (usize, Vec<DetectionEntry>) {
        let mut entries = Vec::new();
        for camera in &self.config.cameras {
            let dir = self.config.camera_dir(&camera.name);
            if !dir.is_dir() {
                continue;
            }
            let labels = store::load_labels(&dir);
            for record in store::read_detections(&dir) {
                let Some(base) = record.base_name() else {
                    warn!(camera = %camera.name, "record with unparseable timestamp skipped");
                    continue;
                };
                let clip = ["mov", "mp4"]
                    .iter()
                    .find(|ext| dir.join(format!("{base}.{ext}")).exists())
                    .map(|ext| format!("{}/{base}.{ext}", camera.name))
                    .unwrap_or_default();

                let display_time = record.timestamp[..19.min(record.timestamp.len())]
                    .replace('T', " ");
                let label = labels
                    .get(&record.timestamp)
                    .map(|l| store::normalize_label(l).to_string())
                    .unwrap_or_default();

                entries.push(DetectionEntry {
                    time: display_time,
                    timestamp: record.timestamp.clone(),
                    camera: camera.name.clone(),
                    confidence: format!("{:.0}%", record.confidence * 100.0),
                    image: format!("{}/{base}_composite.jpg", camera.name),
                    mp4: clip,
                    composite_original: format!("{}/{base}_composite_original.jpg", camera.name),
                    label,
                });
            }
        }
        entries.sort_by(|a, b| b.time.cmp(&a.time));
        (entries.len(), entries)
    }
}

fn file_mtime(path: &Path) -> Option<f64> {
    let modified = fs::metadata(path).ok()?.modified().ok()?;
    let since_epoch = modified.duration_since(UNIX_EPOCH).ok()?;
    Some(since_epoch.as_secs_f64())
}

/// Watcher thread re-checking mtimes on a short interval.
pub fn spawn_watcher(
    cache: Arc<DetectionCache>,
    interval: f64,
    stop: Arc<AtomicBool>,
) -> JoinHandle<()> {
    crate::telemetry::spawn_thread("detections-watcher", move || {
        let step = Duration::from_secs_f64(interval.max(0.2));
        while !stop.load(Ordering::SeqCst) {
            std::thread::sleep(step);
            cache.refresh(false);
        }
    })
    .expect("failed to spawn detection watcher")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dashboard::config::{CameraEndpoint, MonitorConfig};
    use chrono::NaiveDate;
    use detect_core::MeteorEvent;
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> Arc<DashboardConfig> {
        Arc::new(DashboardConfig {
            port: 0,
            detections_dir: dir.path().to_path_buf(),
            cameras: vec![
                CameraEndpoint {
                    name: "cam1".into(),
                    url: "http://camera1:8080".into(),
                },
                CameraEndpoint {
                    name: "cam2".into(),
                    url: "http://camera2:8080".into(),
                },
            ],
            cache_interval: 2.0,
            monitor: MonitorConfig {
                enabled: false,
                interval: 60.0,
                timeout: 120.0,
                restart_delay: 5.0,
                restart_cooldown: 300.0,
                restart_max_count: 10,
            },
            latitude: 35.36,
            longitude: 138.72,
            timezone: chrono_tz::Asia::Tokyo,
            enable_time_window: false,
        })
    }

    fn record(camera_dir: &Path, hour: u32, minute: u32) -> detect_core::DetectionRecord {
        let record = MeteorEvent {
            wall: NaiveDate::from_ymd_opt(2026, 2, 2)
                .unwrap()
                .and_hms_micro_opt(hour, minute, 0, 0)
                .unwrap(),
            start_ts: 10.0,
            end_ts: 10.5,
            start_point: (1, 2),
            end_point: (30, 40),
            peak_brightness: 240.0,
            confidence: 0.9,
        }
        .to_record();
        store::append_detection(camera_dir, &record).unwrap();
        record
    }

    #[test]
    fn listing_is_newest_first_across_cameras() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        record(&config.camera_dir("cam1"), 1, 0);
        record(&config.camera_dir("cam2"), 2, 0);
        record(&config.camera_dir("cam1"), 3, 0);

        let cache = DetectionCache::new(config);
        let snapshot = cache.snapshot();
        assert_eq!(snapshot.total, 3);
        assert_eq!(snapshot.recent[0].time, "2026-02-02 03:00:00");
        assert_eq!(snapshot.recent[0].camera, "cam1");
        assert_eq!(snapshot.recent[1].camera, "cam2");
    }

    #[test]
    fn labels_appear_after_refresh() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        let rec = record(&config.camera_dir("cam1"), 1, 0);

        let cache = DetectionCache::new(config.clone());
        assert_eq!(cache.snapshot().recent[0].label, "");

        store::upsert_label(&config.camera_dir("cam1"), &rec.timestamp, "non-meteor").unwrap();
        cache.refresh(true);
        assert_eq!(cache.snapshot().recent[0].label, "non-meteor");
    }

    #[test]
    fn mtime_is_monotone_under_appends() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        record(&config.camera_dir("cam1"), 1, 0);

        let cache = DetectionCache::new(config.clone());
        let first = cache.snapshot().mtime;
        assert!(first > 0.0);

        std::thread::sleep(Duration::from_millis(30));
        record(&config.camera_dir("cam1"), 2, 0);
        cache.refresh(false);
        let second = cache.snapshot().mtime;
        assert!(second >= first);
        assert_eq!(cache.snapshot().total, 2);
    }

    #[test]
    fn refresh_without_change_is_a_noop() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        record(&config.camera_dir("cam1"), 1, 0);
        let cache = DetectionCache::new(config);
        let before = cache.snapshot();
        cache.refresh(false);
        let after = cache.snapshot();
        assert_eq!(before.mtime, after.mtime);
        assert_eq!(before.total, after.total);
    }
}
