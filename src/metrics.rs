//! Service metrics
//!
//! Thin helpers over the `metrics` facade so call sites stay one line. Nothing
//! is recorded until a recorder is installed, see [`install_prometheus`].

use metrics::{counter, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;
use tracing::info;

pub const JOBS_PUBLISHED: &str = "screenshot_jobs_published_total";
pub const REPLIES_RECEIVED: &str = "screenshot_replies_received_total";
pub const DISPATCH_FAILURES: &str = "screenshot_dispatch_failures_total";
pub const DISPATCH_DURATION: &str = "screenshot_dispatch_duration_seconds";
pub const JOBS_HANDLED: &str = "screenshot_jobs_handled_total";
pub const JOBS_FAILED: &str = "screenshot_jobs_failed_total";
pub const REPLY_FAILURES: &str = "screenshot_reply_failures_total";
pub const VERSIONS_SAVED: &str = "screenshot_versions_saved_total";
pub const CAPTURE_DURATION: &str = "screenshot_capture_duration_seconds";

pub fn record_job_published() {
    counter!(JOBS_PUBLISHED).increment(1);
}

pub fn record_reply_received(duration: Duration) {
    counter!(REPLIES_RECEIVED).increment(1);
    histogram!(DISPATCH_DURATION).record(duration.as_secs_f64());
}

/// `kind` is the lowercase failure name, e.g. `timeout`.
pub fn record_dispatch_failure(kind: &'static str) {
    counter!(DISPATCH_FAILURES, "kind" => kind).increment(1);
}

pub fn record_job_handled(success: bool) {
    if success {
        counter!(JOBS_HANDLED).increment(1);
    } else {
        counter!(JOBS_FAILED).increment(1);
    }
}

pub fn record_reply_failure() {
    counter!(REPLY_FAILURES).increment(1);
}

pub fn record_version_saved(duration: Duration) {
    counter!(VERSIONS_SAVED).increment(1);
    histogram!(CAPTURE_DURATION).record(duration.as_secs_f64());
}

/// Install the global Prometheus recorder and serve `/metrics` on `port`.
///
/// Must be called from within a tokio runtime.
pub fn install_prometheus(port: u16) -> anyhow::Result<()> {
    let address = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    PrometheusBuilder::new()
        .with_http_listener(address)
        .install()?;
    info!("Prometheus metrics exporter listening on {}", address);
    Ok(())
}
