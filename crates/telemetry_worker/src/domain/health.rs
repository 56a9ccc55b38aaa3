use crate::domain::{MetricsSnapshot, ProcessingMetrics};
use common::domain::{Metric, Sink, Trace};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub fn from_dependencies(metric_sink: bool, trace_sink: bool) -> Self {
        match (metric_sink, trace_sink) {
            (true, true) => HealthStatus::Healthy,
            (false, false) => HealthStatus::Unhealthy,
            _ => HealthStatus::Degraded,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DependencyHealth {
    pub metric_sink: bool,
    pub trace_sink: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub dependencies: DependencyHealth,
    pub metrics: MetricsSnapshot,
}

/// Probes both sinks and folds the answers into a tri-state status
pub struct HealthReporter {
    metric_sink: Arc<dyn Sink<Metric>>,
    trace_sink: Arc<dyn Sink<Trace>>,
    metrics: Arc<ProcessingMetrics>,
    probe_timeout: Duration,
}

impl HealthReporter {
    pub fn new(
        metric_sink: Arc<dyn Sink<Metric>>,
        trace_sink: Arc<dyn Sink<Trace>>,
        metrics: Arc<ProcessingMetrics>,
        probe_timeout: Duration,
    ) -> Self {
        Self {
            metric_sink,
            trace_sink,
            metrics,
            probe_timeout,
        }
    }

    /// Never fails; a probe that hangs past the timeout counts as unhealthy
    pub async fn check(&self) -> HealthReport {
        let (metric_sink, trace_sink) = tokio::join!(
            probe("metric_sink", self.probe_timeout, self.metric_sink.health_check()),
            probe("trace_sink", self.probe_timeout, self.trace_sink.health_check()),
        );

        HealthReport {
            status: HealthStatus::from_dependencies(metric_sink, trace_sink),
            dependencies: DependencyHealth {
                metric_sink,
                trace_sink,
            },
            metrics: self.metrics.snapshot(),
        }
    }
}

async fn probe(
    name: &str,
    timeout: Duration,
    check: impl std::future::Future<Output = bool>,
) -> bool {
    match tokio::time::timeout(timeout, check).await {
        Ok(healthy) => healthy,
        Err(_) => {
            warn!(dependency = name, timeout_ms = timeout.as_millis() as u64, "health probe timed out");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::domain::{MockMetricSink, MockTraceSink};

    fn reporter(metric_ok: bool, trace_ok: bool) -> HealthReporter {
        let mut metric_sink = MockMetricSink::new();
        metric_sink
            .expect_health_check()
            .times(1)
            .returning(move || metric_ok);

        let mut trace_sink = MockTraceSink::new();
        trace_sink
            .expect_health_check()
            .times(1)
            .returning(move || trace_ok);

        HealthReporter::new(
            Arc::new(metric_sink),
            Arc::new(trace_sink),
            Arc::new(ProcessingMetrics::new()),
            Duration::from_secs(1),
        )
    }

    #[test]
    fn test_status_derivation() {
        assert_eq!(HealthStatus::from_dependencies(true, true), HealthStatus::Healthy);
        assert_eq!(HealthStatus::from_dependencies(true, false), HealthStatus::Degraded);
        assert_eq!(HealthStatus::from_dependencies(false, true), HealthStatus::Degraded);
        assert_eq!(HealthStatus::from_dependencies(false, false), HealthStatus::Unhealthy);
    }

    #[tokio::test]
    async fn test_healthy() {
        let report = reporter(true, true).check().await;
        assert_eq!(report.status, HealthStatus::Healthy);
        assert!(report.dependencies.metric_sink);
        assert!(report.dependencies.trace_sink);
    }

    #[tokio::test]
    async fn test_degraded_when_one_sink_down() {
        let report = reporter(true, false).check().await;
        assert_eq!(report.status, HealthStatus::Degraded);
        assert!(!report.dependencies.trace_sink);

        let report = reporter(false, true).check().await;
        assert_eq!(report.status, HealthStatus::Degraded);
    }

    #[tokio::test]
    async fn test_unhealthy_when_both_down() {
        let report = reporter(false, false).check().await;
        assert_eq!(report.status, HealthStatus::Unhealthy);
    }

    #[tokio::test]
    async fn test_report_serialization() {
        let report = reporter(true, false).check().await;
        let value = serde_json::to_value(&report).unwrap();

        assert_eq!(value["status"], "degraded");
        assert_eq!(value["dependencies"]["metricSink"], true);
        assert_eq!(value["dependencies"]["traceSink"], false);
        assert_eq!(value["metrics"]["successRate"], 0.0);
    }
}
