use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Closed set of failure classes; retryability is fixed per kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ErrorKind {
    #[serde(rename = "VALIDATION_ERROR")]
    Validation,
    #[serde(rename = "DATABASE_ERROR")]
    Database,
    #[serde(rename = "RETRYABLE_ERROR")]
    Retryable,
    #[serde(rename = "UNKNOWN_ERROR")]
    Unknown,
}

impl ErrorKind {
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::Database | ErrorKind::Retryable)
    }

    pub fn code(self) -> &'static str {
        match self {
            ErrorKind::Validation => "VALIDATION_ERROR",
            ErrorKind::Database => "DATABASE_ERROR",
            ErrorKind::Retryable => "RETRYABLE_ERROR",
            ErrorKind::Unknown => "UNKNOWN_ERROR",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// A classified failure attributed to one record.
///
/// Created where a record or a sink write fails, collected into the batch
/// result and never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Error)]
#[serde(rename_all = "camelCase")]
#[error("{kind}: {message}")]
pub struct ProcessingError {
    pub record_id: String,
    #[serde(rename = "errorKind")]
    pub kind: ErrorKind,
    pub message: String,
    retryable: bool,
    pub context: BTreeMap<String, String>,
}

impl ProcessingError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            record_id: String::new(),
            kind,
            message: message.into(),
            retryable: kind.is_retryable(),
            context: BTreeMap::new(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn database(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Database, message)
    }

    pub fn retryable_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Retryable, message)
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unknown, message)
    }

    pub fn with_record_id(mut self, record_id: impl Into<String>) -> Self {
        self.record_id = record_id.into();
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    pub fn retryable(&self) -> bool {
        self.retryable
    }
}

/// Errors surfaced by sink implementations
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("query error: {0}")]
    Query(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("request timeout after {0:?}")]
    Timeout(Duration),

    #[error("{rejected} of {total} records rejected: {reason}")]
    Rejected {
        rejected: usize,
        total: usize,
        reason: String,
    },

    #[error("request failed: {0}")]
    Request(String),

    #[error("sink is closed")]
    Closed,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SinkError {
    /// Kind for the typed variants; `None` when only the message can tell
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            SinkError::Network(_) | SinkError::Timeout(_) => Some(ErrorKind::Retryable),
            SinkError::Connection(_)
            | SinkError::Query(_)
            | SinkError::Rejected { .. }
            | SinkError::Closed => Some(ErrorKind::Database),
            SinkError::Request(_) => Some(ErrorKind::Unknown),
            SinkError::Other(_) => None,
        }
    }
}

/// Errors returned to callers that want a hard failure signal
#[derive(Debug, Error)]
pub enum BatchError {
    #[error("All records failed processing ({failed} of {total})")]
    AllRecordsFailed { failed: usize, total: usize },
}

const RETRYABLE_MARKERS: [&str; 3] = ["timeout", "network", "econnrefused"];
const DATABASE_MARKERS: [&str; 3] = ["database", "connection", "query"];

/// Classify any failure into the taxonomy.
///
/// Already-classified errors pass through untouched, typed sink errors map by
/// variant, and anything else falls back to message inspection.
pub fn classify(error: &anyhow::Error) -> ProcessingError {
    if let Some(processing) = error.downcast_ref::<ProcessingError>() {
        return processing.clone();
    }

    if let Some(sink) = error.downcast_ref::<SinkError>() {
        return classify_sink_error(sink);
    }

    classify_message(&format!("{:#}", error))
}

pub fn classify_sink_error(error: &SinkError) -> ProcessingError {
    match (error, error.kind()) {
        (SinkError::Other(inner), _) => classify(inner),
        (_, Some(kind)) => ProcessingError::new(kind, error.to_string()),
        (_, None) => classify_message(&error.to_string()),
    }
}

/// Coarse substring classification for opaque error messages
pub fn classify_message(message: &str) -> ProcessingError {
    let lowered = message.to_lowercase();

    if RETRYABLE_MARKERS.iter().any(|marker| lowered.contains(marker)) {
        return ProcessingError::retryable_error(message);
    }

    if DATABASE_MARKERS.iter().any(|marker| lowered.contains(marker)) {
        return ProcessingError::database(message);
    }

    ProcessingError::unknown(format!("Unknown processing error: {}", message))
        .with_context("original_error", message)
}
