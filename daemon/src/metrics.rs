/// Metrics collection and exposure

use crate::errors::{DaemonError, DaemonResult};
use prometheus::{Encoder, IntCounter, IntGauge, Registry};

fn counter(registry: &Registry, name: &str, help: &str) -> DaemonResult<IntCounter> {
    let counter =
        IntCounter::new(name, help).map_err(|e| DaemonError::MetricsError(e.to_string()))?;
    registry
        .register(Box::new(counter.clone()))
        .map_err(|e| DaemonError::MetricsError(e.to_string()))?;
    Ok(counter)
}

fn gauge(registry: &Registry, name: &str, help: &str) -> DaemonResult<IntGauge> {
    let gauge = IntGauge::new(name, help).map_err(|e| DaemonError::MetricsError(e.to_string()))?;
    registry
        .register(Box::new(gauge.clone()))
        .map_err(|e| DaemonError::MetricsError(e.to_string()))?;
    Ok(gauge)
}

/// Metrics collector
pub struct DelegateMetrics {
    registry: Registry,

    // Task metrics
    pub tasks_acquired: IntCounter,
    pub tasks_completed: IntCounter,
    pub tasks_failed: IntCounter,
    pub tasks_timed_out: IntCounter,
    pub tasks_aborted: IntCounter,
    pub tasks_rejected: IntCounter,
    pub tasks_executing: IntGauge,
    pub tasks_validating: IntGauge,

    // Connection metrics
    pub heartbeats_sent: IntCounter,
    pub socket_reconnects: IntCounter,
    pub connected: IntGauge,
}

impl DelegateMetrics {
    /// Create a new metrics collector
    pub fn new() -> DaemonResult<Self> {
        let registry = Registry::new();

        Ok(DelegateMetrics {
            tasks_acquired: counter(&registry, "delegate_tasks_acquired_total", "Tasks acquired")?,
            tasks_completed: counter(
                &registry,
                "delegate_tasks_completed_total",
                "Tasks completed successfully",
            )?,
            tasks_failed: counter(&registry, "delegate_tasks_failed_total", "Tasks that failed")?,
            tasks_timed_out: counter(
                &registry,
                "delegate_tasks_timed_out_total",
                "Tasks cancelled by timeout enforcement",
            )?,
            tasks_aborted: counter(&registry, "delegate_tasks_aborted_total", "Tasks aborted")?,
            tasks_rejected: counter(
                &registry,
                "delegate_tasks_rejected_total",
                "Task events refused before acquisition",
            )?,
            tasks_executing: gauge(&registry, "delegate_tasks_executing", "Tasks executing")?,
            tasks_validating: gauge(&registry, "delegate_tasks_validating", "Tasks validating")?,
            heartbeats_sent: counter(&registry, "delegate_heartbeats_sent_total", "Heartbeats sent")?,
            socket_reconnects: counter(
                &registry,
                "delegate_socket_reconnects_total",
                "Stream socket reconnects",
            )?,
            connected: gauge(&registry, "delegate_connected", "Stream socket connected (0/1)")?,
            registry,
        })
    }

    /// Record a finished task
    pub fn record_completion(&self, success: bool) {
        if success {
            self.tasks_completed.inc();
        } else {
            self.tasks_failed.inc();
        }
    }

    /// Get all metrics in Prometheus format
    pub fn gather(&self) -> DaemonResult<String> {
        let mut buffer = Vec::new();
        prometheus::TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| DaemonError::MetricsError(e.to_string()))?;
        String::from_utf8(buffer).map_err(|e| DaemonError::MetricsError(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = DelegateMetrics::new();
        assert!(metrics.is_ok());
    }

    #[test]
    fn test_record_completion() {
        let metrics = DelegateMetrics::new().unwrap();
        metrics.record_completion(true);
        metrics.record_completion(false);
        metrics.record_completion(false);
        assert_eq!(metrics.tasks_completed.get(), 1);
        assert_eq!(metrics.tasks_failed.get(), 2);
    }

    #[test]
    fn test_gather_contains_prefix() {
        let metrics = DelegateMetrics::new().unwrap();
        metrics.heartbeats_sent.inc();
        let text = metrics.gather().unwrap();
        assert!(text.contains("delegate_heartbeats_sent_total 1"));
    }
}
