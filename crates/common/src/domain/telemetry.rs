use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Field every telemetry payload carries to identify its shape
pub const DISCRIMINATOR_FIELD: &str = "_cloudsight";

/// The two record shapes an instrumented function can emit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TelemetryKind {
    Metric,
    Trace,
}

impl TelemetryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TelemetryKind::Metric => "metric",
            TelemetryKind::Trace => "trace",
        }
    }

    /// Resolve a discriminator value; anything other than the two literals is unknown
    pub fn from_discriminator(value: &str) -> Option<Self> {
        match value {
            "metric" => Some(TelemetryKind::Metric),
            "trace" => Some(TelemetryKind::Trace),
            _ => None,
        }
    }
}

impl fmt::Display for TelemetryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque queue message as delivered, before JSON parsing
#[derive(Debug, Clone, PartialEq)]
pub struct RawRecord {
    pub id: String,
    pub body: Vec<u8>,
}

impl RawRecord {
    pub fn new(id: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            id: id.into(),
            body: body.into(),
        }
    }
}

/// Validated numeric metric
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub name: String,
    pub value: f64,
    pub unit: String,
    /// ISO-8601 timestamp exactly as emitted by the producer
    pub timestamp: String,
    pub dimensions: BTreeMap<String, String>,
}

impl Metric {
    /// Timestamp as UTC; `None` only for records that bypassed validation
    pub fn occurred_at(&self) -> Option<DateTime<Utc>> {
        parse_timestamp(&self.timestamp)
    }

    pub fn dimension(&self, key: &str) -> Option<&str> {
        self.dimensions.get(key).map(String::as_str)
    }
}

/// Validated execution trace
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trace {
    pub trace_id: String,
    pub span_id: String,
    pub start_time: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    pub invocation_context: InvocationContext,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TraceError>,
}

impl Trace {
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Runtime context of the invocation that produced a trace.
///
/// Producers on different platforms disagree on field names, so the
/// AWS-flavoured spellings are accepted as aliases.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationContext {
    #[serde(rename = "functionName")]
    pub function_name: String,
    #[serde(rename = "requestId", alias = "awsRequestId", default)]
    pub request_id: String,
    #[serde(rename = "coldStart", default)]
    pub cold_start: bool,
    #[serde(
        rename = "memoryLimitMB",
        alias = "memoryLimitInMB",
        default,
        deserialize_with = "deserialize_memory_limit"
    )]
    pub memory_limit_mb: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceError {
    pub message: String,
    #[serde(default)]
    pub stack: String,
    #[serde(rename = "type", alias = "name", default)]
    pub error_type: String,
}

/// A record that passed validation, tagged by destination
#[derive(Debug, Clone, PartialEq)]
pub enum Telemetry {
    Metric(Metric),
    Trace(Trace),
}

impl Telemetry {
    pub fn kind(&self) -> TelemetryKind {
        match self {
            Telemetry::Metric(_) => TelemetryKind::Metric,
            Telemetry::Trace(_) => TelemetryKind::Trace,
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum MemoryLimit {
    Number(u32),
    Text(String),
}

fn deserialize_memory_limit<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    match MemoryLimit::deserialize(deserializer)? {
        MemoryLimit::Number(value) => Ok(value),
        MemoryLimit::Text(text) => text.trim().parse().map_err(|_| {
            serde::de::Error::custom(format!("memory limit '{}' is not a whole number", text))
        }),
    }
}

/// Parse the date-time formats producers emit.
///
/// Accepts RFC 3339, offset-less ISO date-times (read as UTC) and bare dates.
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }

    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Some(parsed.with_timezone(&Utc));
    }

    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(value, format) {
            return Some(naive.and_utc());
        }
    }

    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}
