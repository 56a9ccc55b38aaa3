use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use common::domain::{Sink, SinkError, SinkResult, Trace, TraceError};
use common::elasticsearch::ElasticsearchClient;
use reqwest::{Method, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

const ALREADY_EXISTS: &str = "resource_already_exists_exception";

/// Indexed form of a trace
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceDocument {
    pub trace_id: String,
    pub span_id: String,
    pub start_time: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    pub function_name: String,
    pub request_id: String,
    pub cold_start: bool,
    #[serde(rename = "memoryLimitMB")]
    pub memory_limit_mb: u32,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<TraceError>,
    #[serde(rename = "@timestamp")]
    pub indexed_at: String,
}

impl TraceDocument {
    pub fn from_trace(trace: &Trace, indexed_at: DateTime<Utc>) -> Self {
        let context = &trace.invocation_context;
        Self {
            trace_id: trace.trace_id.clone(),
            span_id: trace.span_id.clone(),
            start_time: trace.start_time.clone(),
            end_time: trace.end_time.clone(),
            duration: trace.duration,
            function_name: context.function_name.clone(),
            request_id: context.request_id.clone(),
            cold_start: context.cold_start,
            memory_limit_mb: context.memory_limit_mb,
            status: if trace.is_error() { "error" } else { "success" }.to_string(),
            error: trace.error.clone(),
            indexed_at: indexed_at.to_rfc3339_opts(SecondsFormat::Millis, true),
        }
    }

    /// Stable id so a retried bulk request overwrites instead of duplicating
    pub fn document_id(&self) -> String {
        format!("{}:{}", self.trace_id, self.span_id)
    }
}

/// Index settings and strict mapping for trace documents
pub fn index_definition() -> Value {
    json!({
        "settings": {
            "number_of_shards": 2,
            "number_of_replicas": 1,
            "index.mapping.ignore_malformed": true
        },
        "mappings": {
            "dynamic": "strict",
            "properties": {
                "traceId": { "type": "keyword" },
                "spanId": { "type": "keyword" },
                "startTime": { "type": "date" },
                "endTime": { "type": "date" },
                "duration": { "type": "float" },
                "functionName": { "type": "keyword" },
                "requestId": { "type": "keyword" },
                "coldStart": { "type": "boolean" },
                "memoryLimitMB": { "type": "integer" },
                "status": { "type": "keyword" },
                "error": {
                    "properties": {
                        "message": { "type": "text" },
                        "stack": { "type": "text" },
                        "type": { "type": "keyword" }
                    }
                },
                "@timestamp": { "type": "date" }
            }
        }
    })
}

/// NDJSON body for `POST /_bulk`, one `index` action per document
pub fn bulk_body(index: &str, documents: &[TraceDocument]) -> Result<String, serde_json::Error> {
    let mut body = String::new();
    for document in documents {
        let action = json!({ "index": { "_index": index, "_id": document.document_id() } });
        body.push_str(&serde_json::to_string(&action)?);
        body.push('\n');
        body.push_str(&serde_json::to_string(document)?);
        body.push('\n');
    }
    Ok(body)
}

#[derive(Debug, Deserialize)]
pub struct BulkResponse {
    pub errors: bool,
    #[serde(default)]
    pub items: Vec<HashMap<String, BulkItem>>,
}

#[derive(Debug, Deserialize)]
pub struct BulkItem {
    #[serde(default)]
    pub status: u16,
    #[serde(default)]
    pub error: Option<Value>,
}

impl BulkResponse {
    /// Fail the whole call when any item was rejected
    pub fn into_result(self, total: usize) -> SinkResult<()> {
        if !self.errors {
            return Ok(());
        }

        let failed: Vec<&BulkItem> = self
            .items
            .iter()
            .flat_map(|item| item.values())
            .filter(|item| item.error.is_some())
            .collect();

        let reason = failed
            .first()
            .and_then(|item| item.error.as_ref())
            .map(describe_es_error)
            .unwrap_or_else(|| "bulk request reported errors".to_string());

        Err(SinkError::Rejected {
            rejected: failed.len(),
            total,
            reason,
        })
    }
}

fn describe_es_error(error: &Value) -> String {
    let kind = error.get("type").and_then(Value::as_str);
    let reason = error.get("reason").and_then(Value::as_str);
    match (kind, reason) {
        (Some(kind), Some(reason)) => format!("{}: {}", kind, reason),
        (Some(kind), None) => kind.to_string(),
        (None, Some(reason)) => reason.to_string(),
        (None, None) => error.to_string(),
    }
}

/// Trace sink backed by an Elasticsearch index
pub struct ElasticsearchTraceSink {
    client: ElasticsearchClient,
    index: String,
    request_timeout: Duration,
    initialized: AtomicBool,
    closed: AtomicBool,
}

impl ElasticsearchTraceSink {
    pub fn new(client: ElasticsearchClient, index: String, request_timeout: Duration) -> Self {
        Self {
            client,
            index,
            request_timeout,
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

    fn transport_error(&self, e: reqwest::Error) -> SinkError {
        if e.is_timeout() {
            SinkError::Timeout(self.request_timeout)
        } else if e.is_connect() {
            SinkError::Connection(e.to_string())
        } else {
            SinkError::Network(e.to_string())
        }
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> SinkResult<Response> {
        request.send().await.map_err(|e| self.transport_error(e))
    }

    async fn index_exists(&self) -> SinkResult<bool> {
        let response = self
            .send(self.client.request(Method::HEAD, &self.index))
            .await?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(false),
            status if status.is_success() => Ok(true),
            status => Err(status_error(status, "index lookup failed")),
        }
    }

    async fn create_index(&self) -> SinkResult<()> {
        let response = self
            .send(
                self.client
                    .request(Method::PUT, &self.index)
                    .json(&index_definition()),
            )
            .await?;

        let status = response.status();
        if status.is_success() {
            info!(index = %self.index, "created trace index");
            return Ok(());
        }

        let body: Value = response.json().await.unwrap_or(Value::Null);
        let error_type = body
            .pointer("/error/type")
            .and_then(Value::as_str)
            .unwrap_or_default();

        if error_type == ALREADY_EXISTS {
            debug!(index = %self.index, "trace index created concurrently");
            return Ok(());
        }

        let detail = body
            .get("error")
            .map(describe_es_error)
            .unwrap_or_else(|| "index creation failed".to_string());
        Err(status_error(status, &detail))
    }
}

/// Throttling and server faults are worth retrying, other client errors are not
fn status_error(status: StatusCode, detail: &str) -> SinkError {
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        SinkError::Network(format!("{} ({})", detail, status))
    } else {
        SinkError::Request(format!("{} ({})", detail, status))
    }
}

#[async_trait]
impl Sink<Trace> for ElasticsearchTraceSink {
    async fn initialize(&self) -> SinkResult<()> {
        self.ensure_open()?;
        if self.initialized.load(Ordering::Acquire) {
            return Ok(());
        }

        if !self.index_exists().await? {
            self.create_index().await.inspect_err(|e| {
                error!(index = %self.index, error = %e, "failed to create trace index");
            })?;
        }

        self.initialized.store(true, Ordering::Release);
        info!(node = %self.client.node(), index = %self.index, "Elasticsearch index ready");
        Ok(())
    }

    #[instrument(skip(self, records), fields(record_count = records.len(), index = %self.index))]
    async fn insert_batch(&self, records: &[Trace]) -> SinkResult<()> {
        self.ensure_open()?;
        if records.is_empty() {
            debug!("no traces to index, skipping");
            return Ok(());
        }

        let indexed_at = Utc::now();
        let documents: Vec<TraceDocument> = records
            .iter()
            .map(|trace| TraceDocument::from_trace(trace, indexed_at))
            .collect();
        let body = bulk_body(&self.index, &documents)
            .map_err(|e| SinkError::Request(format!("failed to encode bulk body: {}", e)))?;

        let response = self
            .send(
                self.client
                    .request(Method::POST, "/_bulk")
                    .header(reqwest::header::CONTENT_TYPE, "application/x-ndjson")
                    .body(body),
            )
            .await?;

        let status = response.status();
        if !status.is_success() {
            warn!(status = %status, "bulk request failed");
            return Err(status_error(status, "bulk request failed"));
        }

        let bulk: BulkResponse = response
            .json()
            .await
            .map_err(|e| SinkError::Network(format!("unreadable bulk response: {}", e)))?;

        bulk.into_result(documents.len()).inspect_err(|e| {
            warn!(error = %e, "bulk request rejected documents");
        })?;

        debug!(documents_indexed = documents.len(), "indexed trace batch");
        Ok(())
    }

    async fn health_check(&self) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }

        let response = match self
            .send(self.client.request(Method::GET, "/_cluster/health"))
            .await
        {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "Elasticsearch health check failed");
                return false;
            }
        };

        match response.json::<Value>().await {
            Ok(body) => {
                let status = body.get("status").and_then(Value::as_str);
                if status == Some("red") {
                    warn!("Elasticsearch cluster status is red");
                }
                matches!(status, Some(s) if s != "red")
            }
            Err(e) => {
                warn!(error = %e, "Elasticsearch health response unreadable");
                false
            }
        }
    }

    async fn close(&self) -> SinkResult<()> {
        self.closed.store(true, Ordering::Release);
        info!("Elasticsearch trace sink closed");
        Ok(())
    }
}
