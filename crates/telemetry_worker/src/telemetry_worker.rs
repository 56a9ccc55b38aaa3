use crate::domain::{HealthStatus, TelemetryProcessor};
use crate::nats::{create_telemetry_batch_processor, RedeliveryPolicy};
use common::nats::{NatsClient, NatsConsumer, NatsConsumerConfig};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub type WorkerFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;
pub type WorkerProcess = Box<dyn FnOnce(CancellationToken) -> WorkerFuture + Send>;

#[derive(Debug, Clone)]
pub struct TelemetryWorkerConfig {
    pub stream: String,
    pub subject: String,
    pub consumer_name: String,
    pub batch_size: usize,
    pub batch_wait: Duration,
    pub ack_wait: Duration,
    pub redelivery_policy: RedeliveryPolicy,
    pub health_interval: Duration,
}

pub struct TelemetryWorker {
    consumer: NatsConsumer,
    processor: Arc<TelemetryProcessor>,
    health_interval: Duration,
}

impl TelemetryWorker {
    pub async fn new(
        processor: Arc<TelemetryProcessor>,
        nats_client: &NatsClient,
        config: TelemetryWorkerConfig,
    ) -> anyhow::Result<Self> {
        info!(
            stream = %config.stream,
            consumer = %config.consumer_name,
            redelivery_policy = ?config.redelivery_policy,
            "Initializing telemetry worker"
        );

        let batch_processor =
            create_telemetry_batch_processor(processor.clone(), config.redelivery_policy);

        let consumer = NatsConsumer::new(
            nats_client.jetstream(),
            NatsConsumerConfig {
                stream_name: config.stream,
                consumer_name: config.consumer_name,
                subject_filter: config.subject,
                batch_size: config.batch_size,
                max_wait: config.batch_wait,
                ack_wait: config.ack_wait,
            },
            batch_processor,
        )
        .await?;

        info!("Telemetry worker initialized");

        Ok(Self {
            consumer,
            processor,
            health_interval: config.health_interval,
        })
    }

    pub fn into_runner_processes(self) -> Vec<(&'static str, WorkerProcess)> {
        let consumer = self.consumer;
        let consumer_process: WorkerProcess =
            Box::new(move |ctx: CancellationToken| -> WorkerFuture {
                Box::pin(async move { consumer.run(ctx).await })
            });

        let processor = self.processor;
        let interval = self.health_interval;
        let health_process: WorkerProcess =
            Box::new(move |ctx: CancellationToken| -> WorkerFuture {
                Box::pin(report_health(processor, interval, ctx))
            });

        vec![
            ("telemetry-consumer", consumer_process),
            ("health-reporter", health_process),
        ]
    }
}

/// Log a health report and the processing counters on every tick
pub async fn report_health(
    processor: Arc<TelemetryProcessor>,
    every: Duration,
    ctx: CancellationToken,
) -> anyhow::Result<()> {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ctx.cancelled() => {
                info!("Stopping health reporter");
                return Ok(());
            }
            _ = ticker.tick() => {
                let report = processor.health_check().await;
                let metrics = &report.metrics;

                if report.status == HealthStatus::Healthy {
                    info!(
                        status = %report.status,
                        records_processed = metrics.records_processed,
                        records_failed = metrics.records_failed,
                        success_rate = metrics.success_rate,
                        avg_batch_size = metrics.avg_batch_size,
                        avg_processing_time_ms = metrics.avg_processing_time_ms,
                        "health report"
                    );
                } else {
                    warn!(
                        status = %report.status,
                        metric_sink = report.dependencies.metric_sink,
                        trace_sink = report.dependencies.trace_sink,
                        records_processed = metrics.records_processed,
                        records_failed = metrics.records_failed,
                        "health report"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ProcessorConfig;
    use common::domain::{MockMetricSink, MockTraceSink};

    #[tokio::test]
    async fn test_health_reporter_stops_on_cancel() {
        let mut metric_sink = MockMetricSink::new();
        metric_sink.expect_health_check().returning(|| true);
        let mut trace_sink = MockTraceSink::new();
        trace_sink.expect_health_check().returning(|| false);

        let processor = Arc::new(TelemetryProcessor::new(
            Arc::new(metric_sink),
            Arc::new(trace_sink),
            ProcessorConfig::default(),
        ));

        let ctx = CancellationToken::new();
        let handle = tokio::spawn(report_health(
            processor,
            Duration::from_millis(10),
            ctx.clone(),
        ));

        tokio::time::sleep(Duration::from_millis(35)).await;
        ctx.cancel();

        let result = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }
}
