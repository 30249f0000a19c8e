// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Telemetry export.
//!
//! All components register into the Prometheus default registry through
//! `metrics_utils`; this module renders it for a scrape endpoint. The
//! render path is read-only and independent of control-plane
//! correctness: a failure here produces an empty exposition, never an
//! engine error.

use prometheus::{Encoder, TextEncoder};
use tracing::warn;

/// Render the default registry in Prometheus text exposition format.
#[must_use]
pub fn render_metrics() -> String {
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        warn!(error = %e, "Metrics encoding failed");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_includes_registered_metrics() {
        let counter = crate::metrics_utils::counter(
            "mlxserve_telemetry_render_test_total",
            "render test counter",
        );
        counter.inc();
        let text = render_metrics();
        assert!(text.contains("mlxserve_telemetry_render_test_total"));
    }

    #[test]
    fn test_render_is_parseable_exposition() {
        let text = render_metrics();
        for line in text.lines().filter(|l| !l.is_empty()) {
            assert!(
                line.starts_with('#') || line.contains(' '),
                "malformed exposition line: {line}"
            );
        }
    }
}
