//! Prometheus metrics recorder and metric name constants.

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the Prometheus metrics recorder (global).
///
/// Returns the handle used to render the `/metrics` endpoint. Call once at
/// startup, before any metrics are recorded.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// Render Prometheus text format from a recorder handle.
pub fn render(handle: &PrometheusHandle) -> String {
    handle.render()
}

/// WebSocket connections accepted (counter).
pub const WS_CONNECTIONS_TOTAL: &str = "ws_connections_total";
/// WebSocket disconnections (counter).
pub const WS_DISCONNECTIONS_TOTAL: &str = "ws_disconnections_total";
/// Currently open WebSocket connections (gauge).
pub const WS_CONNECTIONS_ACTIVE: &str = "ws_connections_active";
/// Inbound frames by kind (counter, labels: kind).
pub const WS_FRAMES_TOTAL: &str = "ws_frames_total";
/// Protocol errors reported to senders (counter, labels: reason).
pub const WS_PROTOCOL_ERRORS_TOTAL: &str = "ws_protocol_errors_total";
/// Broadcast deliveries that failed (counter).
pub const WS_BROADCAST_DROPS_TOTAL: &str = "ws_broadcast_drops_total";
/// Backend requests issued (counter, labels: kind).
pub const BACKEND_REQUESTS_TOTAL: &str = "backend_requests_total";
/// Backend request failures (counter, labels: `error_type`).
pub const BACKEND_ERRORS_TOTAL: &str = "backend_errors_total";
/// Backend bridges opened (counter).
pub const BACKEND_CONNECTS_TOTAL: &str = "backend_connects_total";
/// Backend request/reply duration in seconds (histogram).
pub const BACKEND_REQUEST_DURATION_SECONDS: &str = "backend_request_duration_seconds";
