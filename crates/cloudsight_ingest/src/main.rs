mod config;

use cloudsight_runner::Runner;
use common::clickhouse::ClickHouseClient;
use common::elasticsearch::ElasticsearchClient;
use common::nats::NatsClient;
use common::telemetry::{init_telemetry, TelemetryConfig};
use crate::config::ServiceConfig;
use std::sync::Arc;
use std::time::Duration;
use telemetry_worker::clickhouse::ClickHouseMetricSink;
use telemetry_worker::domain::{ProcessorConfig, RetryPolicy, TelemetryProcessor};
use telemetry_worker::elasticsearch::ElasticsearchTraceSink;
use telemetry_worker::telemetry_worker::{TelemetryWorker, TelemetryWorkerConfig};
use tracing::{debug, error, info};

#[tokio::main]
async fn main() {
    let config = match ServiceConfig::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = init_telemetry(&TelemetryConfig {
        service_name: "cloudsight-ingest".to_string(),
        log_level: config.log_level.clone(),
    }) {
        eprintln!("Failed to initialize logging: {}", e);
        std::process::exit(1);
    }

    info!(
        nats_url = %config.nats_url,
        stream = %config.nats_stream,
        redelivery_policy = ?config.redelivery_policy,
        "Starting cloudsight-ingest service"
    );
    debug!("Configuration: {:?}", config);

    let nats_client = match connect_nats(&config).await {
        Ok(client) => Arc::new(client),
        Err(e) => {
            error!("Failed to initialize NATS: {:#}", e);
            std::process::exit(1);
        }
    };

    let processor = match build_processor(&config) {
        Ok(processor) => Arc::new(processor),
        Err(e) => {
            error!("Failed to initialize sinks: {:#}", e);
            std::process::exit(1);
        }
    };

    let worker = match TelemetryWorker::new(
        processor.clone(),
        &nats_client,
        TelemetryWorkerConfig {
            stream: config.nats_stream.clone(),
            subject: config.nats_subject.clone(),
            consumer_name: config.nats_consumer_name.clone(),
            batch_size: config.nats_batch_size,
            batch_wait: Duration::from_secs(config.nats_batch_wait_secs),
            ack_wait: Duration::from_secs(config.nats_ack_wait_secs),
            redelivery_policy: config.redelivery_policy,
            health_interval: Duration::from_secs(config.health_interval_secs),
        },
    )
    .await
    {
        Ok(worker) => worker,
        Err(e) => {
            error!("Failed to initialize telemetry worker: {:#}", e);
            std::process::exit(1);
        }
    };

    let mut runner = Runner::new();
    for (name, process) in worker.into_runner_processes() {
        runner = runner.with_app_process(name, process);
    }

    let runner = runner
        .with_closer("sinks", move || async move {
            processor.close().await?;
            let metrics = processor.get_metrics();
            info!(
                records_processed = metrics.records_processed,
                records_failed = metrics.records_failed,
                total_batches = metrics.total_batches,
                "Sinks closed"
            );
            Ok(())
        })
        .with_closer("nats", move || async move { nats_client.close().await })
        .with_closer_timeout(Duration::from_secs(10));

    if let Err(e) = runner.run().await {
        error!("Service stopped with error: {:#}", e);
        std::process::exit(1);
    }
}

async fn connect_nats(config: &ServiceConfig) -> anyhow::Result<NatsClient> {
    let client = NatsClient::connect(
        &config.nats_url,
        Duration::from_secs(config.startup_timeout_secs),
    )
    .await?;
    client
        .ensure_stream(&config.nats_stream, &config.nats_subject)
        .await?;
    Ok(client)
}

/// Sinks are created without touching the network; schemas are applied
/// lazily by the first batch.
fn build_processor(config: &ServiceConfig) -> anyhow::Result<TelemetryProcessor> {
    let request_timeout = Duration::from_millis(config.request_timeout_ms);

    let clickhouse_client = ClickHouseClient::new(
        &config.clickhouse_url,
        &config.clickhouse_database,
        &config.clickhouse_username,
        &config.clickhouse_password,
    );
    let metric_sink = ClickHouseMetricSink::new(clickhouse_client, config.clickhouse_table.clone());

    let elasticsearch_client = ElasticsearchClient::new(
        &config.elasticsearch_node,
        &config.elasticsearch_username,
        &config.elasticsearch_password,
        request_timeout,
    )?;
    let trace_sink = ElasticsearchTraceSink::new(
        elasticsearch_client,
        config.elasticsearch_index.clone(),
        request_timeout,
    );

    Ok(TelemetryProcessor::new(
        Arc::new(metric_sink),
        Arc::new(trace_sink),
        processor_config(config),
    ))
}

fn processor_config(config: &ServiceConfig) -> ProcessorConfig {
    ProcessorConfig {
        retry: RetryPolicy {
            max_attempts: config.max_retries.max(1),
            base_delay: Duration::from_millis(config.retry_base_delay_ms),
            max_delay: Duration::from_millis(config.retry_max_delay_ms),
            request_timeout: Duration::from_millis(config.request_timeout_ms),
        },
        min_remaining_time: Duration::from_millis(config.min_remaining_time_ms),
        time_check_interval: config.time_check_interval.max(1),
        ..ProcessorConfig::default()
    }
}
