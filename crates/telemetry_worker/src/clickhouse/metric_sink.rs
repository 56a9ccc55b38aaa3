use async_trait::async_trait;
use chrono::{DateTime, Utc};
use clickhouse::Row;
use common::clickhouse::ClickHouseClient;
use common::domain::{Metric, Sink, SinkError, SinkResult};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, error, info, instrument, warn};

const UNKNOWN: &str = "unknown";

/// One row of the metrics table.
///
/// Context that producers attach as dimensions is lifted into typed columns.
#[derive(Debug, Clone, PartialEq, Row, Serialize, Deserialize)]
pub struct MetricRow {
    #[serde(with = "clickhouse::serde::chrono::datetime64::millis")]
    pub timestamp: DateTime<Utc>,
    pub name: String,
    pub value: f64,
    pub unit: String,
    pub function_name: String,
    pub region: String,
    pub status: String,
    pub cold_start: bool,
    pub request_id: String,
    pub memory_size: u32,
    pub environment: String,
    pub version: String,
}

impl TryFrom<&Metric> for MetricRow {
    type Error = SinkError;

    fn try_from(metric: &Metric) -> Result<Self, Self::Error> {
        let timestamp = metric.occurred_at().ok_or_else(|| {
            SinkError::Request(format!(
                "metric '{}' has unparseable timestamp '{}'",
                metric.name, metric.timestamp
            ))
        })?;

        let text = |key: &str, default: &str| {
            metric.dimension(key).unwrap_or(default).to_string()
        };

        Ok(MetricRow {
            timestamp,
            name: metric.name.clone(),
            value: metric.value,
            unit: metric.unit.clone(),
            function_name: text("function_name", UNKNOWN),
            region: text("region", UNKNOWN),
            status: text("status", ""),
            cold_start: metric.dimension("cold_start") == Some("true"),
            request_id: metric
                .dimension("request_id")
                .or_else(|| metric.dimension("aws_request_id"))
                .unwrap_or_default()
                .to_string(),
            memory_size: metric
                .dimension("memory_size")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(0),
            environment: text("environment", UNKNOWN),
            version: text("version", UNKNOWN),
        })
    }
}

/// DDL for the metrics table and its rollup views; every statement is a
/// no-op when the object already exists.
pub fn schema_statements(database: &str, table: &str) -> Vec<String> {
    vec![
        format!("CREATE DATABASE IF NOT EXISTS {database}"),
        format!(
            "CREATE TABLE IF NOT EXISTS {database}.{table}
            (
                timestamp DateTime64(3, 'UTC'),
                name String,
                value Float64,
                unit LowCardinality(String),
                function_name String,
                region LowCardinality(String),
                status LowCardinality(String),
                cold_start Bool,
                request_id String,
                memory_size UInt32,
                environment LowCardinality(String),
                version LowCardinality(String),
                date Date DEFAULT toDate(timestamp)
            )
            ENGINE = MergeTree()
            PARTITION BY toYYYYMM(date)
            ORDER BY (function_name, name, timestamp)"
        ),
        format!(
            "CREATE MATERIALIZED VIEW IF NOT EXISTS {database}.{table}_1m_aggregations
            ENGINE = AggregatingMergeTree()
            PARTITION BY toYYYYMM(date)
            ORDER BY (function_name, name, minute)
            AS SELECT
                function_name,
                name,
                toStartOfMinute(timestamp) AS minute,
                date,
                countState() AS count,
                avgState(value) AS avg_value,
                maxState(value) AS max_value,
                minState(value) AS min_value,
                quantileState(0.95)(value) AS p95_value,
                quantileState(0.99)(value) AS p99_value
            FROM {database}.{table}
            GROUP BY function_name, name, minute, date"
        ),
        format!(
            "CREATE MATERIALIZED VIEW IF NOT EXISTS {database}.cold_start_analysis
            ENGINE = SummingMergeTree()
            PARTITION BY toYYYYMM(date)
            ORDER BY (function_name, date)
            AS SELECT
                function_name,
                date,
                countIf(name = 'cold_start') AS cold_starts,
                countIf(name IN ('invocation_success', 'invocation_error')) AS total_invocations
            FROM {database}.{table}
            WHERE name IN ('cold_start', 'invocation_success', 'invocation_error')
            GROUP BY function_name, date"
        ),
    ]
}

fn map_clickhouse_error(e: clickhouse::error::Error) -> SinkError {
    match e {
        clickhouse::error::Error::Network(_) => SinkError::Network(e.to_string()),
        _ => SinkError::Query(e.to_string()),
    }
}

/// Metric sink backed by a ClickHouse MergeTree table
pub struct ClickHouseMetricSink {
    client: ClickHouseClient,
    table: String,
    initialized: AtomicBool,
    closed: AtomicBool,
}

impl ClickHouseMetricSink {
    pub fn new(client: ClickHouseClient, table: String) -> Self {
        Self {
            client,
            table,
            initialized: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    fn ensure_open(&self) -> SinkResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SinkError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl Sink<Metric> for ClickHouseMetricSink {
    async fn initialize(&self) -> SinkResult<()> {
        self.ensure_open()?;
        if self.initialized.load(Ordering::Acquire) {
            return Ok(());
        }

        for statement in schema_statements(self.client.database(), &self.table) {
            self.client.execute(&statement).await.map_err(|e| {
                error!(error = %e, "failed to apply ClickHouse schema");
                map_clickhouse_error(e)
            })?;
        }

        self.initialized.store(true, Ordering::Release);
        info!(
            database = %self.client.database(),
            table = %self.table,
            "ClickHouse schema ready"
        );
        Ok(())
    }

    #[instrument(skip(self, records), fields(record_count = records.len(), table = %self.table))]
    async fn insert_batch(&self, records: &[Metric]) -> SinkResult<()> {
        self.ensure_open()?;
        if records.is_empty() {
            debug!("no metrics to store, skipping");
            return Ok(());
        }

        let rows = records
            .iter()
            .map(MetricRow::try_from)
            .collect::<SinkResult<Vec<_>>>()?;

        let mut insert = self
            .client
            .get_client()
            .insert::<MetricRow>(&self.table)
            .await
            .map_err(|e| {
                warn!(error = %e, "failed to create ClickHouse inserter");
                map_clickhouse_error(e)
            })?;

        for row in &rows {
            insert.write(row).await.map_err(|e| {
                warn!(error = %e, "failed to write row to ClickHouse");
                map_clickhouse_error(e)
            })?;
        }

        insert.end().await.map_err(|e| {
            warn!(error = %e, "failed to finalize ClickHouse insert");
            map_clickhouse_error(e)
        })?;

        debug!(rows_inserted = rows.len(), "stored metric batch");
        Ok(())
    }

    async fn health_check(&self) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }

        match self.client.ping().await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "ClickHouse health check failed");
                false
            }
        }
    }

    async fn close(&self) -> SinkResult<()> {
        // The HTTP client has no explicit shutdown; refuse further writes
        self.closed.store(true, Ordering::Release);
        info!("ClickHouse metric sink closed");
        Ok(())
    }
}
