use crate::domain::TelemetryProcessor;
use anyhow::Result;
use async_nats::jetstream::Message;
use common::domain::{BatchError, BatchProcessingResult, RawRecord};
use common::nats::{BatchProcessor, ProcessingResult};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, warn};

/// How failed records are handed back to JetStream
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RedeliveryPolicy {
    /// Redeliver the whole batch only when every record failed; partial
    /// failures are acknowledged and not retried.
    #[default]
    AllFailed,
    /// Redeliver exactly the records whose failure is retryable
    PerRecord,
}

/// Queue message to pipeline record; the id is the stream sequence
pub fn to_raw_record(index: usize, message: &Message) -> RawRecord {
    let id = match message.info() {
        Ok(info) => info.stream_sequence.to_string(),
        Err(_) => format!("batch-{}", index),
    };
    RawRecord::new(id, message.payload.to_vec())
}

/// Turn a batch outcome into per-message ack/nak decisions
pub fn resolve_acknowledgements(
    policy: RedeliveryPolicy,
    result: &BatchProcessingResult,
    records: &[RawRecord],
) -> Result<ProcessingResult, BatchError> {
    match policy {
        RedeliveryPolicy::AllFailed => {
            if result.all_failed() {
                return Err(BatchError::AllRecordsFailed {
                    failed: result.failed_records,
                    total: result.total_records(),
                });
            }
            if result.has_failures() {
                warn!(
                    failed_records = result.failed_records,
                    "acknowledging batch with partial failures"
                );
            }
            Ok(ProcessingResult::ack_all(records.len()))
        }
        RedeliveryPolicy::PerRecord => {
            let positions: HashMap<&str, usize> = records
                .iter()
                .enumerate()
                .map(|(index, record)| (record.id.as_str(), index))
                .collect();

            let mut nak = Vec::new();
            for error in result.processing_errors.iter().filter(|e| e.retryable()) {
                match positions.get(error.record_id.as_str()) {
                    Some(&index) => nak.push((index, Some(error.message.clone()))),
                    None => warn!(record_id = %error.record_id, "failed record not found in batch"),
                }
            }
            nak.sort_by_key(|(index, _)| *index);
            nak.dedup_by_key(|(index, _)| *index);

            let ack = (0..records.len())
                .filter(|index| nak.binary_search_by_key(index, |(i, _)| *i).is_err())
                .collect();

            Ok(ProcessingResult::new(ack, nak))
        }
    }
}

/// Batch processor that runs JetStream deliveries through the telemetry pipeline
pub fn create_telemetry_batch_processor(
    processor: Arc<TelemetryProcessor>,
    policy: RedeliveryPolicy,
) -> BatchProcessor {
    Box::new(move |messages: &[Message], deadline: Instant| {
        let processor = processor.clone();

        // Copy payloads out while the slice is still borrowed
        let records: Vec<RawRecord> = messages
            .iter()
            .enumerate()
            .map(|(index, message)| to_raw_record(index, message))
            .collect();

        Box::pin(async move {
            let result = processor.process_batch(&records, Some(deadline)).await;
            let decisions = resolve_acknowledgements(policy, &result, &records)?;

            debug!(
                ack_count = decisions.ack.len(),
                nak_count = decisions.nak.len(),
                "resolved acknowledgements"
            );
            Ok(decisions)
        }) as BoxFuture<'static, Result<ProcessingResult>>
    })
}
