//! Tracing and Prometheus metrics plumbing shared by both services.

use std::io;
use std::sync::OnceLock;
use std::thread;
use std::time::Duration;

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing_subscriber::{EnvFilter, fmt};

static PROM_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the tracing subscriber and the global metrics recorder.
/// Idempotent so tests can call it freely.
pub fn init() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .with_target(false)
        .with_timer(fmt::time::uptime())
        .with_env_filter(env_filter)
        .try_init();

    PROM_HANDLE.get_or_init(|| {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        if metrics::set_global_recorder(recorder).is_err() {
            tracing::debug!("metrics recorder already installed");
        }

        let upkeep = handle.clone();
        let _ = spawn_thread("prometheus-upkeep", move || {
            loop {
                thread::sleep(Duration::from_secs(5));
                upkeep.run_upkeep();
            }
        });

        handle
    });
}

/// Render the current metrics in Prometheus text format.
pub fn render_metrics() -> String {
    PROM_HANDLE
        .get()
        .map(|handle| handle.render())
        .unwrap_or_default()
}

/// Spawn a named worker thread.
pub fn spawn_thread<F, T>(name: impl Into<String>, f: F) -> io::Result<thread::JoinHandle<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    thread::Builder::new().name(name.into()).spawn(f)
}
