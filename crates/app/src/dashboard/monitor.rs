//! Camera liveness monitor with cooldown/budget-limited auto-restart.
//!
//! A background thread polls every camera's `/stats`. A camera counts as
//! stopped when the poll fails or when its `time_since_last_frame`
//! exceeds the timeout; each detected outage earns at most one restart,
//! rate-limited by a per-camera cooldown and a lifetime budget.

use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, Ordering},
};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use serde_json::{Value, json};
use tracing::{info, warn};

use crate::dashboard::config::{DashboardConfig, MonitorConfig};

/// The one reason surfaced for any liveness failure.
const STOP_REASON: &str = "no_frame";

/// What one `/stats` poll told us.
pub enum Poll {
    Healthy(Value),
    /// Stats answered but the camera has not produced frames recently.
    Stale(Value),
    Failed,
}

/// Per-camera monitor state.
#[derive(Default)]
pub struct CameraMonitor {
    pub stats: Option<Value>,
    pub stop_reason: Option<&'static str>,
    pub restart_count: u32,
    pub last_restart_at: Option<Instant>,
    pub auto_restart_disabled: bool,
    /// One restart per detected outage; reset on recovery.
    outage_handled: bool,
}

/// Advance one camera's state with a poll result. Returns `true` when a
/// restart should be issued now.
pub fn step(
    state: &mut CameraMonitor,
    poll: Poll,
    config: &MonitorConfig,
    now: Instant,
) -> bool {
    match poll {
        Poll::Healthy(stats) => {
            state.stats = Some(stats);
            state.stop_reason = None;
            state.outage_handled = false;
            false
        }
        Poll::Stale(stats) => {
            state.stats = Some(stats);
            decide_restart(state, config, now)
        }
        Poll::Failed => decide_restart(state, config, now),
    }
}

fn decide_restart(state: &mut CameraMonitor, config: &MonitorConfig, now: Instant) -> bool {
    state.stop_reason = Some(STOP_REASON);
    if !config.enabled || state.auto_restart_disabled || state.outage_handled {
        return false;
    }
    if state.restart_count >= config.restart_max_count {
        state.auto_restart_disabled = true;
        warn!(
            budget = config.restart_max_count,
            "restart budget exhausted; auto-restart disabled for camera"
        );
        return false;
    }
    if let Some(last) = state.last_restart_at {
        if now.duration_since(last).as_secs_f64() < config.restart_cooldown {
            // Still cooling down; re-evaluate on the next poll.
            return false;
        }
    }
    state.restart_count += 1;
    state.last_restart_at = Some(now);
    state.outage_handled = true;
    true
}

pub struct MonitorState {
    config: Arc<DashboardConfig>,
    cameras: Mutex<Vec<CameraMonitor>>,
}

impl MonitorState {
    pub fn new(config: Arc<DashboardConfig>) -> Self {
        let cameras = (0..config.cameras.len())
            .map(|_| CameraMonitor::default())
            .collect();
        Self {
            config,
            cameras: Mutex::new(cameras),
        }
    }

    /// Cached monitor view served by `/camera_stats/{i}`.
    pub fn snapshot(&self, index: usize) -> Option<Value> {
        let cameras = self.cameras.lock().expect("monitor state poisoned");
        let state = cameras.get(index)?;
        Some(json!({
            "stats": state.stats,
            "monitor_stop_reason": state.stop_reason,
            "monitor_restart_count": state.restart_count,
            "monitor_last_restart_ago": state
                .last_restart_at
                .map(|at| (at.elapsed().as_secs_f64() * 10.0).round() / 10.0),
            "monitor_auto_restart_disabled": state.auto_restart_disabled,
        }))
    }

    fn poll_camera(&self, client: &reqwest::blocking::Client, index: usize) -> Poll {
        let camera = &self.config.cameras[index];
        let url = format!("{}/stats", camera.url);
        let response = match client.get(&url).send().and_then(|r| r.error_for_status()) {
            Ok(response) => response,
            Err(err) => {
                warn!(camera = %camera.name, "stats poll failed: {err}");
                return Poll::Failed;
            }
        };
        let stats: Value = match response.json() {
            Ok(stats) => stats,
            Err(err) => {
                warn!(camera = %camera.name, "stats unparseable: {err}");
                return Poll::Failed;
            }
        };

        let timeout = self.config.monitor.timeout;
        let stale = match stats.get("time_since_last_frame").and_then(Value::as_f64) {
            Some(age) => age > timeout,
            // Never produced a frame: stale once it has been up long enough.
            None => stats
                .get("elapsed")
                .and_then(Value::as_f64)
                .is_some_and(|elapsed| elapsed > timeout),
        };
        if stale {
            Poll::Stale(stats)
        } else {
            Poll::Healthy(stats)
        }
    }

    fn run_once(&self, client: &reqwest::blocking::Client) {
        for index in 0..self.config.cameras.len() {
            let poll = self.poll_camera(client, index);
            let restart = {
                let mut cameras = self.cameras.lock().expect("monitor state poisoned");
                step(&mut cameras[index], poll, &self.config.monitor, Instant::now())
            };
            if restart {
                self.issue_restart(client, index);
            }
        }
    }

    fn issue_restart(&self, client: &reqwest::blocking::Client, index: usize) {
        let camera = &self.config.cameras[index];
        let delay = self.config.monitor.restart_delay;
        info!(camera = %camera.name, delay, "camera stopped; issuing restart");
        std::thread::sleep(Duration::from_secs_f64(delay.max(0.0)));

        let url = format!("{}/restart", camera.url);
        match client
            .post(&url)
            .timeout(Duration::from_secs(10))
            .send()
        {
            Ok(response) => {
                info!(camera = %camera.name, status = %response.status(), "restart requested");
                metrics::counter!("dashboard_camera_restarts_total").increment(1);
            }
            Err(err) => warn!(camera = %camera.name, "restart request failed: {err}"),
        }
    }
}

/// Spawn the polling thread.
pub fn spawn_monitor(state: Arc<MonitorState>, stop: Arc<AtomicBool>) -> JoinHandle<()> {
    crate::telemetry::spawn_thread("camera-monitor", move || {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .expect("failed to build monitor HTTP client");
        let interval = Duration::from_secs_f64(state.config.monitor.interval.max(1.0));
        while !stop.load(Ordering::SeqCst) {
            state.run_once(&client);
            let deadline = Instant::now() + interval;
            while Instant::now() < deadline && !stop.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(200));
            }
        }
    })
    .expect("failed to spawn camera monitor")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(cooldown: f64, max_count: u32) -> MonitorConfig {
        MonitorConfig {
            enabled: true,
            interval: 1.0,
            timeout: 5.0,
            restart_delay: 0.0,
            restart_cooldown: cooldown,
            restart_max_count: max_count,
        }
    }

    fn stale() -> Poll {
        Poll::Stale(json!({"time_since_last_frame": 100.0}))
    }

    #[test]
    fn one_restart_per_outage() {
        let mut state = CameraMonitor::default();
        let cfg = config(0.0, 10);
        let t0 = Instant::now();

        assert!(step(&mut state, stale(), &cfg, t0));
        // Same outage keeps reporting stale: no second restart.
        assert!(!step(&mut state, stale(), &cfg, t0));
        assert_eq!(state.restart_count, 1);
        assert_eq!(state.stop_reason, Some("no_frame"));

        // Recovery clears the outage; the next one restarts again.
        assert!(!step(&mut state, Poll::Healthy(json!({})), &cfg, t0));
        assert_eq!(state.stop_reason, None);
        assert!(step(&mut state, stale(), &cfg, t0));
        assert_eq!(state.restart_count, 2);
    }

    #[test]
    fn budget_disables_auto_restart() {
        let mut state = CameraMonitor::default();
        let cfg = config(0.0, 2);
        let t = Instant::now();

        // Three separate outages; only two restarts fit the budget.
        assert!(step(&mut state, stale(), &cfg, t));
        step(&mut state, Poll::Healthy(json!({})), &cfg, t);
        assert!(step(&mut state, stale(), &cfg, t));
        step(&mut state, Poll::Healthy(json!({})), &cfg, t);
        assert!(!step(&mut state, stale(), &cfg, t));

        assert_eq!(state.restart_count, 2);
        assert!(state.auto_restart_disabled);
        assert_eq!(state.stop_reason, Some("no_frame"));

        // Even a new outage stays dark now.
        step(&mut state, Poll::Healthy(json!({})), &cfg, t);
        assert!(!step(&mut state, stale(), &cfg, t));
    }

    #[test]
    fn cooldown_defers_the_restart() {
        let mut state = CameraMonitor::default();
        let cfg = config(300.0, 10);
        let t0 = Instant::now();

        assert!(step(&mut state, stale(), &cfg, t0));
        step(&mut state, Poll::Healthy(json!({})), &cfg, t0);

        // New outage within the cooldown: deferred, not consumed.
        assert!(!step(&mut state, stale(), &cfg, t0 + Duration::from_secs(10)));
        assert_eq!(state.restart_count, 1);

        // After the cooldown the same outage finally restarts.
        assert!(step(&mut state, stale(), &cfg, t0 + Duration::from_secs(301)));
        assert_eq!(state.restart_count, 2);
    }

    #[test]
    fn failed_polls_count_as_outage() {
        let mut state = CameraMonitor::default();
        let cfg = config(0.0, 10);
        assert!(step(&mut state, Poll::Failed, &cfg, Instant::now()));
        assert_eq!(state.stop_reason, Some("no_frame"));
    }

    #[test]
    fn disabled_monitor_never_restarts() {
        let mut state = CameraMonitor::default();
        let mut cfg = config(0.0, 10);
        cfg.enabled = false;
        assert!(!step(&mut state, stale(), &cfg, Instant::now()));
        assert_eq!(state.restart_count, 0);
        // The reason is still surfaced for the UI.
        assert_eq!(state.stop_reason, Some("no_frame"));
    }
}
