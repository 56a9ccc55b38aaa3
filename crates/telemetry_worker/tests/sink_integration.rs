#![cfg(feature = "integration-tests")]

use common::clickhouse::ClickHouseClient;
use common::domain::{InvocationContext, Metric, RawRecord, Sink, Trace, TraceError};
use common::elasticsearch::ElasticsearchClient;
use reqwest::Method;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use telemetry_worker::clickhouse::ClickHouseMetricSink;
use telemetry_worker::domain::{ProcessorConfig, TelemetryProcessor};
use telemetry_worker::elasticsearch::ElasticsearchTraceSink;
use testcontainers::runners::AsyncRunner;
use testcontainers::ContainerAsync;
use testcontainers_modules::clickhouse::ClickHouse;
use testcontainers_modules::elastic_search::ElasticSearch;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

fn metric(name: &str, value: f64, unit: &str) -> Metric {
    let dimensions: BTreeMap<String, String> = [
        ("function_name", "checkout"),
        ("region", "eu-west-1"),
        ("cold_start", "true"),
        ("memory_size", "512"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();

    Metric {
        name: name.to_string(),
        value,
        unit: unit.to_string(),
        timestamp: "2024-03-01T12:30:45.123Z".to_string(),
        dimensions,
    }
}

fn trace(span_id: &str, error: Option<TraceError>) -> Trace {
    Trace {
        trace_id: "trace-1".to_string(),
        span_id: span_id.to_string(),
        start_time: "2024-03-01T12:30:45.000Z".to_string(),
        end_time: Some("2024-03-01T12:30:45.245Z".to_string()),
        duration: Some(245.0),
        invocation_context: InvocationContext {
            function_name: "checkout".to_string(),
            request_id: "req-1".to_string(),
            cold_start: false,
            memory_limit_mb: 512,
        },
        error,
    }
}

async fn start_clickhouse() -> (ContainerAsync<ClickHouse>, ClickHouseClient) {
    let container = ClickHouse::default().start().await.unwrap();
    let host = container.get_host().await.unwrap();
    let port = container.get_host_port_ipv4(8123).await.unwrap();

    let client = ClickHouseClient::new(
        &format!("http://{}:{}", host, port),
        "cloudsight",
        "default",
        "",
    );
    (container, client)
}

async fn start_elasticsearch() -> (ContainerAsync<ElasticSearch>, ElasticsearchClient) {
    let container = ElasticSearch::default().start().await.unwrap();
    let host = container.get_host().await.unwrap();
    let port = container.get_host_port_ipv4(9200).await.unwrap();

    let client = ElasticsearchClient::new(
        &format!("http://{}:{}", host, port),
        "",
        "",
        REQUEST_TIMEOUT,
    )
    .unwrap();
    (container, client)
}

async fn count_documents(client: &ElasticsearchClient, index: &str) -> u64 {
    client
        .request(Method::POST, &format!("/{}/_refresh", index))
        .send()
        .await
        .unwrap()
        .error_for_status()
        .unwrap();

    let body: serde_json::Value = client
        .request(Method::GET, &format!("/{}/_count", index))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    body["count"].as_u64().unwrap()
}

#[tokio::test]
async fn test_metric_sink_schema_and_insert() {
    let (_container, client) = start_clickhouse().await;
    let sink = ClickHouseMetricSink::new(client.clone(), "metrics".to_string());

    assert!(sink.health_check().await);

    sink.initialize().await.unwrap();
    // Schema statements are idempotent
    sink.initialize().await.unwrap();

    sink.insert_batch(&[
        metric("invocation_duration", 245.0, "Milliseconds"),
        metric("cold_start", 1.0, "Count"),
    ])
    .await
    .unwrap();

    let rows = client
        .get_client()
        .query("SELECT count() FROM cloudsight.metrics")
        .fetch_one::<u64>()
        .await
        .unwrap();
    assert_eq!(rows, 2);

    let cold_starts = client
        .get_client()
        .query("SELECT count() FROM cloudsight.metrics WHERE cold_start AND memory_size = 512")
        .fetch_one::<u64>()
        .await
        .unwrap();
    assert_eq!(cold_starts, 2);
}

#[tokio::test]
async fn test_metric_sink_schema_survives_new_sink_instance() {
    let (_container, client) = start_clickhouse().await;

    ClickHouseMetricSink::new(client.clone(), "metrics".to_string())
        .initialize()
        .await
        .unwrap();

    // A restarted process applies the same DDL against an existing schema
    ClickHouseMetricSink::new(client, "metrics".to_string())
        .initialize()
        .await
        .unwrap();
}

#[tokio::test]
async fn test_trace_sink_index_and_bulk_insert() {
    let (_container, client) = start_elasticsearch().await;
    let sink = ElasticsearchTraceSink::new(
        client.clone(),
        "cloudsight-traces".to_string(),
        REQUEST_TIMEOUT,
    );

    assert!(sink.health_check().await);

    sink.initialize().await.unwrap();
    ElasticsearchTraceSink::new(client.clone(), "cloudsight-traces".to_string(), REQUEST_TIMEOUT)
        .initialize()
        .await
        .unwrap();

    let failed = trace(
        "span-2",
        Some(TraceError {
            message: "boom".to_string(),
            stack: "at handler".to_string(),
            error_type: "Error".to_string(),
        }),
    );
    sink.insert_batch(&[trace("span-1", None), failed.clone()])
        .await
        .unwrap();
    assert_eq!(count_documents(&client, "cloudsight-traces").await, 2);

    // Same trace and span ids overwrite instead of duplicating
    sink.insert_batch(&[failed]).await.unwrap();
    assert_eq!(count_documents(&client, "cloudsight-traces").await, 2);

    let document: serde_json::Value = client
        .request(Method::GET, "/cloudsight-traces/_doc/trace-1:span-2")
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(document["_source"]["status"], "error");
    assert_eq!(document["_source"]["memoryLimitMB"], 512);
}

#[tokio::test]
async fn test_processor_against_both_sinks() {
    let (_clickhouse, clickhouse_client) = start_clickhouse().await;
    let (_elasticsearch, es_client) = start_elasticsearch().await;

    let processor = TelemetryProcessor::new(
        Arc::new(ClickHouseMetricSink::new(
            clickhouse_client.clone(),
            "metrics".to_string(),
        )),
        Arc::new(ElasticsearchTraceSink::new(
            es_client.clone(),
            "cloudsight-traces".to_string(),
            REQUEST_TIMEOUT,
        )),
        ProcessorConfig::default(),
    );

    let records = vec![
        RawRecord::new(
            "1",
            r#"{"_cloudsight":"metric","name":"invocation_duration","value":245,"unit":"Milliseconds","timestamp":"2024-03-01T12:30:45.123Z","dimensions":{"function_name":"checkout"}}"#,
        ),
        RawRecord::new(
            "2",
            r#"{"_cloudsight":"trace","traceId":"t-1","spanId":"s-1","startTime":"2024-03-01T12:30:45.000Z","invocationContext":{"functionName":"checkout","awsRequestId":"req-9","coldStart":true,"memoryLimitInMB":"256"}}"#,
        ),
        RawRecord::new("3", "not json"),
    ];

    let result = processor.process_batch(&records, None).await;
    assert_eq!(result.successful_records, 2);
    assert_eq!(result.failed_records, 1);
    assert_eq!(result.processing_errors[0].record_id, "3");

    let rows = clickhouse_client
        .get_client()
        .query("SELECT count() FROM cloudsight.metrics")
        .fetch_one::<u64>()
        .await
        .unwrap();
    assert_eq!(rows, 1);
    assert_eq!(count_documents(&es_client, "cloudsight-traces").await, 1);

    let report = processor.health_check().await;
    assert!(report.dependencies.metric_sink);
    assert!(report.dependencies.trace_sink);

    processor.close().await.unwrap();
}
