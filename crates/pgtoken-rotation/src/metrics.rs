//! Rotation metrics
//!
//! - `pgtoken_rotations_total` (counter): label `outcome`
//! - `pgtoken_consecutive_failures` (gauge)
//! - `pgtoken_token_expires_in_seconds` (gauge): negative once expired
//! - `pgtoken_engine_status` (gauge): 1 for the current `status` label, else 0
//!
//! Without an installed recorder these calls are no-ops.

use crate::state::{EngineStatus, StatusSnapshot};

/// Record the outcome of one rotation attempt.
pub fn record_attempt(outcome: &'static str) {
    ::metrics::counter!("pgtoken_rotations_total", "outcome" => outcome).increment(1);
}

/// Publish gauges derived from a snapshot.
pub fn record_snapshot(snapshot: &StatusSnapshot, now_ms: u64) {
    ::metrics::gauge!("pgtoken_consecutive_failures").set(snapshot.consecutive_failures as f64);

    if let Some(expires_at) = snapshot.expires_at_ms {
        let remaining_ms = expires_at as i64 - now_ms as i64;
        ::metrics::gauge!("pgtoken_token_expires_in_seconds").set(remaining_ms as f64 / 1000.0);
    }

    for status in EngineStatus::ALL {
        let value = if status == snapshot.status { 1.0 } else { 0.0 };
        ::metrics::gauge!("pgtoken_engine_status", "status" => status.label()).set(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics_exporter_prometheus::PrometheusBuilder;

    fn snapshot(status: EngineStatus) -> StatusSnapshot {
        StatusSnapshot {
            status,
            consecutive_failures: 2,
            last_success_ms: Some(1_000),
            expires_at_ms: Some(61_000),
            next_attempt_at_ms: Some(11_000),
            last_error: Some("timeout".into()),
            artifact_written: true,
            rotations: 1,
        }
    }

    #[test]
    fn calls_without_recorder_do_not_panic() {
        record_attempt("success");
        record_snapshot(&snapshot(EngineStatus::Healthy), 0);
    }

    #[test]
    fn renders_counters_and_gauges() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        let _guard = ::metrics::set_default_local_recorder(&recorder);

        record_attempt("success");
        record_attempt("transient_failure");
        record_snapshot(&snapshot(EngineStatus::Degraded), 1_000);

        let output = handle.render();
        assert!(output.contains("pgtoken_rotations_total{outcome=\"success\"} 1"));
        assert!(output.contains("pgtoken_rotations_total{outcome=\"transient_failure\"} 1"));
        assert!(output.contains("pgtoken_consecutive_failures 2"));
        assert!(output.contains("pgtoken_token_expires_in_seconds 60"));
        assert!(output.contains("pgtoken_engine_status{status=\"degraded\"} 1"));
        assert!(output.contains("pgtoken_engine_status{status=\"healthy\"} 0"));
    }
}
