use crate::domain::{
    HealthReport, HealthReporter, MetricsSnapshot, ProcessingMetrics, RetryPolicy, TimeBudget,
    TelemetryValidator,
};
use common::domain::{
    BatchError, BatchProcessingResult, Metric, ProcessingError, RawRecord, Sink, SinkError,
    SinkResult, Telemetry, Trace,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    pub retry: RetryPolicy,
    /// Stop starting new work once less than this is left before the deadline
    pub min_remaining_time: Duration,
    /// Records validated between two time-budget checks
    pub time_check_interval: usize,
    pub health_timeout: Duration,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            min_remaining_time: Duration::from_millis(10_000),
            time_check_interval: 100,
            health_timeout: Duration::from_secs(5),
        }
    }
}

/// Records bound for one sink, with their positions in the incoming batch
struct SinkGroup<R> {
    indices: Vec<usize>,
    records: Vec<R>,
}

impl<R> SinkGroup<R> {
    fn new() -> Self {
        Self {
            indices: Vec::new(),
            records: Vec::new(),
        }
    }

    fn push(&mut self, index: usize, record: R) {
        self.indices.push(index);
        self.records.push(record);
    }
}

/// Validates a batch of raw records and persists metrics and traces into
/// their sinks, reporting every failed record individually.
pub struct TelemetryProcessor {
    metric_sink: Arc<dyn Sink<Metric>>,
    trace_sink: Arc<dyn Sink<Trace>>,
    validator: TelemetryValidator,
    metrics: Arc<ProcessingMetrics>,
    health: HealthReporter,
    config: ProcessorConfig,
    initialized: OnceCell<()>,
}

impl TelemetryProcessor {
    pub fn new(
        metric_sink: Arc<dyn Sink<Metric>>,
        trace_sink: Arc<dyn Sink<Trace>>,
        config: ProcessorConfig,
    ) -> Self {
        let metrics = Arc::new(ProcessingMetrics::new());
        let health = HealthReporter::new(
            metric_sink.clone(),
            trace_sink.clone(),
            metrics.clone(),
            config.health_timeout,
        );

        Self {
            metric_sink,
            trace_sink,
            validator: TelemetryValidator::new(),
            metrics,
            health,
            config,
            initialized: OnceCell::new(),
        }
    }

    /// Initialize both sinks once; concurrent callers wait on the same attempt
    /// and a failed attempt is retried by the next batch.
    async fn ensure_initialized(&self) -> SinkResult<()> {
        self.initialized
            .get_or_try_init(|| async {
                info!("initializing sinks");
                tokio::try_join!(self.metric_sink.initialize(), self.trace_sink.initialize())?;
                info!("sinks initialized");
                Ok::<(), SinkError>(())
            })
            .await
            .map(|_| ())
    }

    /// Process one delivery. Never fails: every failed record is listed in
    /// the returned result.
    #[instrument(skip(self, records), fields(batch_size = records.len()))]
    pub async fn process_batch(
        &self,
        records: &[RawRecord],
        deadline: Option<Instant>,
    ) -> BatchProcessingResult {
        if records.is_empty() {
            debug!("empty batch, nothing to do");
            return BatchProcessingResult::default();
        }

        let started = Instant::now();

        if let Err(e) = self.ensure_initialized().await {
            error!(error = %e, "sink initialization failed, failing whole batch");
            let failure = ProcessingError::database(format!("Sink initialization failed: {}", e));
            let processing_errors = records
                .iter()
                .map(|record| failure.clone().with_record_id(record.id.clone()))
                .collect();
            return self.finish(records.len(), started, processing_errors);
        }

        let budget = TimeBudget::new(deadline, self.config.min_remaining_time);
        let check_interval = self.config.time_check_interval.max(1);

        let mut failures: Vec<(usize, ProcessingError)> = Vec::new();
        let mut metric_group = SinkGroup::new();
        let mut trace_group = SinkGroup::new();

        for (index, record) in records.iter().enumerate() {
            if index % check_interval == 0 {
                if budget.is_exhausted() {
                    warn!(
                        processed = index,
                        skipped = records.len() - index,
                        "time budget exhausted, skipping remaining records"
                    );
                    for (skipped, record) in records.iter().enumerate().skip(index) {
                        failures.push((skipped, budget.exhausted_error().with_record_id(record.id.clone())));
                    }
                    break;
                }

                // Validation does no I/O; give other tasks a turn
                tokio::task::yield_now().await;
            }

            let validated = self
                .validator
                .parse(&record.body)
                .and_then(|envelope| self.validator.validate(&envelope));

            match validated {
                Ok(Telemetry::Metric(metric)) => metric_group.push(index, metric),
                Ok(Telemetry::Trace(trace)) => trace_group.push(index, trace),
                Err(e) => {
                    warn!(record_id = %record.id, error = %e.message, "record failed validation");
                    failures.push((index, e.with_record_id(record.id.clone())));
                }
            }
        }

        let (metric_outcome, trace_outcome) = tokio::join!(
            self.write_group("metric_sink", self.metric_sink.as_ref(), &metric_group, &budget),
            self.write_group("trace_sink", self.trace_sink.as_ref(), &trace_group, &budget),
        );

        for (indices, outcome) in [
            (&metric_group.indices, metric_outcome),
            (&trace_group.indices, trace_outcome),
        ] {
            if let Err(e) = outcome {
                failures.extend(indices.iter().map(|&index| {
                    (index, e.clone().with_record_id(records[index].id.clone()))
                }));
            }
        }

        failures.sort_by_key(|(index, _)| *index);
        let processing_errors = failures.into_iter().map(|(_, error)| error).collect();

        self.finish(records.len(), started, processing_errors)
    }

    /// Write one sink group with retry; empty groups never touch the sink
    async fn write_group<R>(
        &self,
        sink_name: &str,
        sink: &dyn Sink<R>,
        group: &SinkGroup<R>,
        budget: &TimeBudget,
    ) -> Result<(), ProcessingError>
    where
        R: Send + Sync,
    {
        if group.records.is_empty() {
            return Ok(());
        }

        // Records that made it through validation are still written inside
        // the reserve; only a passed deadline stops them
        if budget.is_expired() {
            warn!(sink = sink_name, records = group.records.len(), "no time left to write group");
            return Err(budget.exhausted_error());
        }

        debug!(sink = sink_name, records = group.records.len(), "writing group");

        let records = group.records.as_slice();
        self.config
            .retry
            .execute(sink_name, budget, || sink.insert_batch(records))
            .await
            .map_err(|e| e.with_context("sink", sink_name))
    }

    fn finish(
        &self,
        total: usize,
        started: Instant,
        processing_errors: Vec<ProcessingError>,
    ) -> BatchProcessingResult {
        let failed_records = processing_errors.len();
        let result = BatchProcessingResult {
            successful_records: total - failed_records,
            failed_records,
            processing_errors,
        };

        let elapsed = started.elapsed();
        self.metrics.record_batch_processing(
            total,
            elapsed,
            result.successful_records,
            result.failed_records,
            &result.processing_errors,
        );

        info!(
            total_records = total,
            successful_records = result.successful_records,
            failed_records = result.failed_records,
            elapsed_ms = elapsed.as_millis() as u64,
            "batch processed"
        );

        result
    }

    /// Like [`process_batch`](Self::process_batch), but a batch in which
    /// every record failed is returned as an error so the caller can force
    /// redelivery.
    pub async fn process_batch_or_raise(
        &self,
        records: &[RawRecord],
        deadline: Option<Instant>,
    ) -> Result<BatchProcessingResult, BatchError> {
        let result = self.process_batch(records, deadline).await;
        if result.all_failed() {
            return Err(BatchError::AllRecordsFailed {
                failed: result.failed_records,
                total: result.total_records(),
            });
        }
        Ok(result)
    }

    pub async fn health_check(&self) -> HealthReport {
        self.health.check().await
    }

    pub fn get_metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn reset_metrics(&self) {
        self.metrics.reset();
    }

    /// Close both sinks; both are attempted even if one fails
    pub async fn close(&self) -> SinkResult<()> {
        let (metric_closed, trace_closed) =
            tokio::join!(self.metric_sink.close(), self.trace_sink.close());

        if let Err(e) = &metric_closed {
            error!(error = %e, "failed to close metric sink");
        }
        if let Err(e) = &trace_closed {
            error!(error = %e, "failed to close trace sink");
        }

        metric_closed.and(trace_closed)
    }
}
