//! Prometheus metrics recorder and `/metrics` rendering.

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the Prometheus metrics recorder (global).
///
/// Returns the `PrometheusHandle` used to render the `/metrics` endpoint.
/// Fails if another recorder is already installed.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// Render Prometheus text format from the installed recorder.
pub fn render(handle: &PrometheusHandle) -> String {
    handle.render()
}

// Metric name constants to avoid typos across modules.

/// WebSocket connections accepted (counter).
pub const WS_CONNECTIONS_TOTAL: &str = "ws_connections_total";
/// WebSocket disconnections (counter, labels: reason).
pub const WS_DISCONNECTIONS_TOTAL: &str = "ws_disconnections_total";
/// Active WebSocket connections (gauge).
pub const WS_CONNECTIONS_ACTIVE: &str = "ws_connections_active";
/// Upgrades refused because the connection limit was reached (counter).
pub const WS_CONNECTIONS_REJECTED_TOTAL: &str = "ws_connections_rejected_total";
/// WebSocket connection lifetime (histogram).
pub const WS_CONNECTION_DURATION_SECONDS: &str = "ws_connection_duration_seconds";
/// Control messages applied (counter, labels: type).
pub const CONTROL_MESSAGES_TOTAL: &str = "control_messages_total";
/// Control messages ignored as malformed (counter).
pub const CONTROL_MESSAGES_IGNORED_TOTAL: &str = "control_messages_ignored_total";
/// Stream pumps started (counter).
pub const PUMPS_STARTED_TOTAL: &str = "pumps_started_total";
/// Stream pumps stopped by cancellation (counter).
pub const PUMPS_CANCELLED_TOTAL: &str = "pumps_cancelled_total";
/// Running stream pumps (gauge).
pub const PUMPS_ACTIVE: &str = "pumps_active";
/// Upstream open or read failures (counter, labels: kind).
pub const UPSTREAM_ERRORS_TOTAL: &str = "upstream_errors_total";
/// Envelopes queued for clients (counter).
pub const ENVELOPES_EMITTED_TOTAL: &str = "envelopes_emitted_total";
/// Envelopes evicted from a full outbox (counter).
pub const ENVELOPES_DROPPED_TOTAL: &str = "envelopes_dropped_total";
/// Envelopes written to client sockets (counter).
pub const ENVELOPES_SENT_TOTAL: &str = "envelopes_sent_total";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_from_local_recorder() {
        // Local recorder; installing globally would conflict across tests.
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        metrics::with_local_recorder(&recorder, || {
            metrics::counter!(PUMPS_STARTED_TOTAL).increment(3);
        });
        let output = render(&handle);
        assert!(output.contains("pumps_started_total 3"));
    }

    #[test]
    fn metric_constants_are_snake_case() {
        let names = [
            WS_CONNECTIONS_TOTAL,
            WS_DISCONNECTIONS_TOTAL,
            WS_CONNECTIONS_ACTIVE,
            WS_CONNECTIONS_REJECTED_TOTAL,
            WS_CONNECTION_DURATION_SECONDS,
            CONTROL_MESSAGES_TOTAL,
            CONTROL_MESSAGES_IGNORED_TOTAL,
            PUMPS_STARTED_TOTAL,
            PUMPS_CANCELLED_TOTAL,
            PUMPS_ACTIVE,
            UPSTREAM_ERRORS_TOTAL,
            ENVELOPES_EMITTED_TOTAL,
            ENVELOPES_DROPPED_TOTAL,
            ENVELOPES_SENT_TOTAL,
        ];
        for name in names {
            assert!(
                name.chars().all(|c| c.is_ascii_lowercase() || c == '_'),
                "metric name '{name}' must be snake_case"
            );
        }
    }
}
