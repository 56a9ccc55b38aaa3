use common::domain::{
    parse_timestamp, Metric, ProcessingError, Telemetry, TelemetryKind, Trace,
    DISCRIMINATOR_FIELD,
};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

const REQUIRED_METRIC_FIELDS: [&str; 5] = ["name", "value", "unit", "timestamp", "dimensions"];
const REQUIRED_TRACE_FIELDS: [&str; 4] = ["traceId", "spanId", "startTime", "invocationContext"];

/// Longest invocation a duration metric may report (15 minutes)
pub const MAX_DURATION_MS: f64 = 900_000.0;

/// Structural and semantic checks for incoming telemetry.
///
/// Checks run in a fixed order (required fields, field types, discriminator,
/// semantic rules) and the first violation is the one reported.
#[derive(Debug, Clone, Copy, Default)]
pub struct TelemetryValidator;

impl TelemetryValidator {
    pub fn new() -> Self {
        Self
    }

    /// Parse a raw queue body into a JSON value
    pub fn parse(&self, body: &[u8]) -> Result<Value, ProcessingError> {
        serde_json::from_slice(body).map_err(|e| {
            ProcessingError::validation("Invalid JSON payload").with_context("parse_error", e.to_string())
        })
    }

    pub fn is_valid_json(&self, payload: &str) -> bool {
        serde_json::from_str::<Value>(payload).is_ok()
    }

    /// Dispatch on the discriminator and run the matching validator
    pub fn validate(&self, envelope: &Value) -> Result<Telemetry, ProcessingError> {
        let discriminator = envelope.get(DISCRIMINATOR_FIELD);
        let kind = discriminator
            .and_then(Value::as_str)
            .and_then(TelemetryKind::from_discriminator);

        match kind {
            Some(TelemetryKind::Metric) => self.validate_metric(envelope).map(Telemetry::Metric),
            Some(TelemetryKind::Trace) => self.validate_trace(envelope).map(Telemetry::Trace),
            None => {
                let shown = match discriminator {
                    Some(Value::String(s)) => s.clone(),
                    Some(other) => other.to_string(),
                    None => "missing".to_string(),
                };
                Err(
                    ProcessingError::validation(format!("Unknown telemetry type: {}", shown))
                        .with_context("field", DISCRIMINATOR_FIELD),
                )
            }
        }
    }

    /// Numeric and boolean dimension values are accepted and stored as
    /// their string form.
    pub fn validate_metric(&self, metric: &Value) -> Result<Metric, ProcessingError> {
        let object = as_object(metric)?;

        for field in REQUIRED_METRIC_FIELDS {
            if is_missing(object, field) {
                return Err(invalid(format!("Missing required field: {}", field), field));
            }
        }

        let name = object["name"]
            .as_str()
            .ok_or_else(|| invalid("Metric name must be a string", "name"))?;

        let value = object["value"]
            .as_f64()
            .filter(|v| v.is_finite())
            .ok_or_else(|| invalid("Metric value must be a finite number", "value"))?;

        let unit = object["unit"]
            .as_str()
            .ok_or_else(|| invalid("Metric unit must be a string", "unit"))?;

        let timestamp = object["timestamp"]
            .as_str()
            .filter(|ts| parse_timestamp(ts).is_some())
            .ok_or_else(|| invalid("Metric timestamp must be a valid ISO string", "timestamp"))?;

        let dimensions = object["dimensions"]
            .as_object()
            .ok_or_else(|| invalid("Metric dimensions must be an object", "dimensions"))
            .and_then(dimensions_to_strings)?;

        expect_discriminator(object, TelemetryKind::Metric)?;

        let metric = Metric {
            name: name.to_string(),
            value,
            unit: unit.to_string(),
            timestamp: timestamp.to_string(),
            dimensions,
        };

        check_metric_semantics(&metric)?;

        Ok(metric)
    }

    pub fn validate_trace(&self, trace: &Value) -> Result<Trace, ProcessingError> {
        let object = as_object(trace)?;

        for field in REQUIRED_TRACE_FIELDS {
            if is_missing(object, field) {
                return Err(invalid(
                    format!("Missing required trace field: {}", field),
                    field,
                ));
            }
        }

        if !object["traceId"].is_string() {
            return Err(invalid("Trace ID must be a string", "traceId"));
        }

        if !object["spanId"].is_string() {
            return Err(invalid("Span ID must be a string", "spanId"));
        }

        let start_valid = object["startTime"]
            .as_str()
            .is_some_and(|ts| parse_timestamp(ts).is_some());
        if !start_valid {
            return Err(invalid(
                "Trace startTime must be a valid ISO string",
                "startTime",
            ));
        }

        if !object["invocationContext"].is_object() {
            return Err(invalid(
                "Trace invocationContext must be an object",
                "invocationContext",
            ));
        }

        if let Some(end_time) = object.get("endTime").filter(|v| !v.is_null()) {
            let end_valid = end_time
                .as_str()
                .is_some_and(|ts| parse_timestamp(ts).is_some());
            if !end_valid {
                return Err(invalid("Trace endTime must be a valid ISO string", "endTime"));
            }
        }

        if let Some(duration) = object.get("duration").filter(|v| !v.is_null()) {
            if !duration.as_f64().is_some_and(|d| d.is_finite() && d >= 0.0) {
                return Err(invalid(
                    "Trace duration must be a non-negative number",
                    "duration",
                ));
            }
        }

        expect_discriminator(object, TelemetryKind::Trace)?;

        serde_json::from_value(trace.clone()).map_err(|e| {
            ProcessingError::validation(format!("Invalid trace payload: {}", e))
        })
    }
}

fn as_object(value: &Value) -> Result<&Map<String, Value>, ProcessingError> {
    value
        .as_object()
        .ok_or_else(|| ProcessingError::validation("Telemetry record must be a JSON object"))
}

/// Absent and explicit `null` both count as missing
fn is_missing(object: &Map<String, Value>, field: &str) -> bool {
    object.get(field).map_or(true, Value::is_null)
}

fn invalid(message: impl Into<String>, field: &str) -> ProcessingError {
    ProcessingError::validation(message).with_context("field", field)
}

fn expect_discriminator(
    object: &Map<String, Value>,
    expected: TelemetryKind,
) -> Result<(), ProcessingError> {
    match object.get(DISCRIMINATOR_FIELD).and_then(Value::as_str) {
        Some(value) if value == expected.as_str() => Ok(()),
        _ => Err(invalid(
            format!("Invalid CloudSight {} identifier", expected),
            DISCRIMINATOR_FIELD,
        )),
    }
}

/// Dimension values are stored as strings; scalars are stringified
fn dimensions_to_strings(
    dimensions: &Map<String, Value>,
) -> Result<BTreeMap<String, String>, ProcessingError> {
    dimensions
        .iter()
        .map(|(key, value)| {
            let text = match value {
                Value::String(s) => s.clone(),
                Value::Number(n) => n.to_string(),
                Value::Bool(b) => b.to_string(),
                _ => {
                    return Err(invalid(
                        format!("Metric dimension '{}' must be a string", key),
                        "dimensions",
                    ))
                }
            };
            Ok((key.clone(), text))
        })
        .collect()
}

fn is_count_metric(name: &str) -> bool {
    name.contains("success") || name.contains("error") || name.contains("cold_start")
}

fn check_metric_semantics(metric: &Metric) -> Result<(), ProcessingError> {
    let name = metric.name.as_str();
    let semantic = |message: &str| {
        ProcessingError::validation(message)
            .with_context("metric", name)
            .with_context("value", metric.value.to_string())
            .with_context("unit", metric.unit.as_str())
    };

    if name == "cold_start" && metric.value != 1.0 {
        return Err(semantic("Cold start metric value must be 1"));
    }

    if name.contains("duration") && metric.unit != "Milliseconds" {
        return Err(semantic("Duration metrics must use Milliseconds unit"));
    }

    if is_count_metric(name) && metric.unit != "Count" {
        return Err(semantic("Count metrics must use Count unit"));
    }

    if name.contains("duration") && !(0.0..=MAX_DURATION_MS).contains(&metric.value) {
        return Err(semantic("Duration metric value out of valid range"));
    }

    if (name.contains("success") || name.contains("error")) && metric.value != 1.0 {
        return Err(semantic("Success/error metric value must be 1"));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::domain::ErrorKind;
    use serde_json::json;

    fn metric(name: &str, value: Value, unit: &str) -> Value {
        json!({
            "name": name,
            "value": value,
            "unit": unit,
            "timestamp": "2024-03-01T12:00:00.000Z",
            "dimensions": {
                "function_name": "test-function",
                "region": "us-east-1"
            },
            "_cloudsight": "metric"
        })
    }

    fn trace() -> Value {
        json!({
            "traceId": "trace-123",
            "spanId": "span-456",
            "startTime": "2024-03-01T12:00:00.000Z",
            "invocationContext": {
                "functionName": "test-function",
                "coldStart": false
            },
            "_cloudsight": "trace"
        })
    }

    fn message_of(result: Result<Metric, ProcessingError>) -> String {
        let error = result.unwrap_err();
        assert_eq!(error.kind, ErrorKind::Validation);
        assert!(!error.retryable());
        error.message
    }

    #[test]
    fn test_valid_metric_is_returned_unchanged() {
        let validator = TelemetryValidator::new();
        let metric = validator
            .validate_metric(&metric("invocation_success", json!(1), "Count"))
            .unwrap();

        assert_eq!(metric.name, "invocation_success");
        assert_eq!(metric.value, 1.0);
        assert_eq!(metric.unit, "Count");
        assert_eq!(metric.timestamp, "2024-03-01T12:00:00.000Z");
        assert_eq!(metric.dimension("function_name"), Some("test-function"));
        assert_eq!(metric.dimension("region"), Some("us-east-1"));
        assert_eq!(metric.dimensions.len(), 2);
    }

    #[test]
    fn test_valid_cold_start_and_duration() {
        let validator = TelemetryValidator::new();
        assert!(validator
            .validate_metric(&metric("cold_start", json!(1), "Count"))
            .is_ok());
        assert!(validator
            .validate_metric(&metric("invocation_duration", json!(0), "Milliseconds"))
            .is_ok());
        assert!(validator
            .validate_metric(&metric("invocation_duration", json!(900000), "Milliseconds"))
            .is_ok());
    }

    #[test]
    fn test_missing_field_reported_first() {
        let validator = TelemetryValidator::new();
        // value has the wrong type too, but the missing unit wins
        let record = json!({
            "name": "test_metric",
            "value": "not-a-number",
            "_cloudsight": "metric"
        });

        assert_eq!(
            message_of(validator.validate_metric(&record)),
            "Missing required field: unit"
        );
    }

    #[test]
    fn test_null_counts_as_missing_but_zero_does_not() {
        let validator = TelemetryValidator::new();

        let mut record = metric("memory_used", json!(0), "Megabytes");
        assert!(validator.validate_metric(&record).is_ok());

        record["value"] = Value::Null;
        assert_eq!(
            message_of(validator.validate_metric(&record)),
            "Missing required field: value"
        );
    }

    #[test]
    fn test_type_checks() {
        let validator = TelemetryValidator::new();

        let mut record = metric("test_metric", json!("not-a-number"), "Count");
        assert_eq!(
            message_of(validator.validate_metric(&record)),
            "Metric value must be a finite number"
        );

        record = metric("test_metric", json!(1), "Count");
        record["name"] = json!(42);
        assert_eq!(
            message_of(validator.validate_metric(&record)),
            "Metric name must be a string"
        );

        record = metric("test_metric", json!(1), "Count");
        record["timestamp"] = json!("invalid-date");
        assert_eq!(
            message_of(validator.validate_metric(&record)),
            "Metric timestamp must be a valid ISO string"
        );
    }

    #[test]
    fn test_dimensions_must_be_object() {
        let validator = TelemetryValidator::new();

        for bad in [json!("not-an-object"), json!(["a", "b"]), json!(7)] {
            let mut record = metric("test_metric", json!(1), "Count");
            record["dimensions"] = bad;
            assert_eq!(
                message_of(validator.validate_metric(&record)),
                "Metric dimensions must be an object"
            );
        }
    }

    #[test]
    fn test_dimension_scalars_are_stringified() {
        let validator = TelemetryValidator::new();
        let mut record = metric("memory_used", json!(128), "Megabytes");
        record["dimensions"] = json!({ "memory_size": 512, "cold_start": true });

        let metric = validator.validate_metric(&record).unwrap();
        assert_eq!(metric.dimension("memory_size"), Some("512"));
        assert_eq!(metric.dimension("cold_start"), Some("true"));

        record["dimensions"] = json!({ "nested": { "a": 1 } });
        assert!(validator.validate_metric(&record).is_err());
    }

    #[test]
    fn test_discriminator_checked_before_semantics() {
        let validator = TelemetryValidator::new();
        let mut record = metric("cold_start", json!(2), "Count");
        record["_cloudsight"] = json!("wrong-type");

        assert_eq!(
            message_of(validator.validate_metric(&record)),
            "Invalid CloudSight metric identifier"
        );
    }

    #[test]
    fn test_duration_requires_milliseconds() {
        let validator = TelemetryValidator::new();
        for unit in ["Count", "Seconds", "milliseconds"] {
            assert_eq!(
                message_of(validator.validate_metric(&metric("invocation_duration", json!(100), unit))),
                "Duration metrics must use Milliseconds unit"
            );
        }
    }

    #[test]
    fn test_duration_range() {
        let validator = TelemetryValidator::new();
        for value in [json!(-1), json!(900001), json!(1000000)] {
            assert_eq!(
                message_of(validator.validate_metric(&metric(
                    "invocation_duration",
                    value,
                    "Milliseconds"
                ))),
                "Duration metric value out of valid range"
            );
        }
    }

    #[test]
    fn test_count_metrics_require_value_one() {
        let validator = TelemetryValidator::new();

        assert_eq!(
            message_of(validator.validate_metric(&metric("cold_start", json!(2), "Count"))),
            "Cold start metric value must be 1"
        );

        for name in ["invocation_success", "invocation_error", "error"] {
            for value in [json!(0), json!(2), json!(1.5)] {
                assert_eq!(
                    message_of(validator.validate_metric(&metric(name, value, "Count"))),
                    "Success/error metric value must be 1"
                );
            }
        }
    }

    #[test]
    fn test_count_metrics_require_count_unit() {
        let validator = TelemetryValidator::new();
        for name in ["invocation_success", "invocation_error", "cold_start"] {
            assert_eq!(
                message_of(validator.validate_metric(&metric(name, json!(1), "None"))),
                "Count metrics must use Count unit"
            );
        }
    }

    #[test]
    fn test_valid_trace() {
        let validator = TelemetryValidator::new();
        let trace = validator.validate_trace(&trace()).unwrap();

        assert_eq!(trace.trace_id, "trace-123");
        assert_eq!(trace.span_id, "span-456");
        assert_eq!(trace.invocation_context.function_name, "test-function");
        assert!(!trace.invocation_context.cold_start);
        assert!(!trace.is_error());
    }

    #[test]
    fn test_trace_with_error_and_aws_context() {
        let validator = TelemetryValidator::new();
        let mut record = trace();
        record["endTime"] = json!("2024-03-01T12:00:01.250Z");
        record["duration"] = json!(1250.5);
        record["invocationContext"] = json!({
            "functionName": "payment-processor",
            "awsRequestId": "req-9",
            "coldStart": true,
            "memoryLimitInMB": "256"
        });
        record["error"] = json!({ "message": "boom", "stack": "at x", "type": "TypeError" });

        let trace = validator.validate_trace(&record).unwrap();
        assert_eq!(trace.duration, Some(1250.5));
        assert_eq!(trace.invocation_context.request_id, "req-9");
        assert_eq!(trace.invocation_context.memory_limit_mb, 256);
        assert!(trace.is_error());
    }

    #[test]
    fn test_trace_structural_failures() {
        let validator = TelemetryValidator::new();

        let record = json!({ "traceId": "trace-123", "_cloudsight": "trace" });
        assert_eq!(
            validator.validate_trace(&record).unwrap_err().message,
            "Missing required trace field: spanId"
        );

        let mut record = trace();
        record["traceId"] = json!(123);
        assert_eq!(
            validator.validate_trace(&record).unwrap_err().message,
            "Trace ID must be a string"
        );

        let mut record = trace();
        record["startTime"] = json!("invalid-date");
        assert_eq!(
            validator.validate_trace(&record).unwrap_err().message,
            "Trace startTime must be a valid ISO string"
        );

        let mut record = trace();
        record["_cloudsight"] = json!("metric");
        assert_eq!(
            validator.validate_trace(&record).unwrap_err().message,
            "Invalid CloudSight trace identifier"
        );

        let mut record = trace();
        record["invocationContext"] = json!({ "coldStart": true });
        let error = validator.validate_trace(&record).unwrap_err();
        assert_eq!(error.kind, ErrorKind::Validation);
        assert!(error.message.starts_with("Invalid trace payload"));
    }

    #[test]
    fn test_validate_dispatches_on_discriminator() {
        let validator = TelemetryValidator::new();

        assert!(matches!(
            validator.validate(&metric("cold_start", json!(1), "Count")),
            Ok(Telemetry::Metric(_))
        ));
        assert!(matches!(validator.validate(&trace()), Ok(Telemetry::Trace(_))));

        let unknown = validator
            .validate(&json!({ "_cloudsight": "log", "message": "hi" }))
            .unwrap_err();
        assert!(unknown.message.contains("Unknown telemetry type"));
        assert_eq!(unknown.kind, ErrorKind::Validation);

        let missing = validator.validate(&json!({ "name": "x" })).unwrap_err();
        assert!(missing.message.contains("Unknown telemetry type"));

        let not_object = validator.validate(&json!([1, 2, 3])).unwrap_err();
        assert!(not_object.message.contains("Unknown telemetry type"));
    }

    #[test]
    fn test_parse_and_is_valid_json() {
        let validator = TelemetryValidator::new();

        assert!(validator.is_valid_json(r#"{"a":1}"#));
        assert!(validator.is_valid_json("42"));
        assert!(!validator.is_valid_json("{not json"));
        assert!(!validator.is_valid_json(""));

        let error = validator.parse(b"{\"_cloudsight\":").unwrap_err();
        assert_eq!(error.message, "Invalid JSON payload");
        assert_eq!(error.kind, ErrorKind::Validation);
    }
}
