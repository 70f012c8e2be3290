//! Prometheus recorder for the admin `/metrics` endpoint
//!
//! The rotation metrics themselves are emitted by `pgtoken_rotation::metrics`.

use anyhow::Context;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Install the global Prometheus recorder and return a handle for rendering.
///
/// Must run before the engine starts so no early samples are lost.
pub fn install_recorder() -> anyhow::Result<PrometheusHandle> {
    PrometheusBuilder::new()
        .install_recorder()
        .context("failed to install Prometheus recorder")
}
