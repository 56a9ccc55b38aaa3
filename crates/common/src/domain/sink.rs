use crate::domain::error::SinkError;
use async_trait::async_trait;

pub type SinkResult<T> = Result<T, SinkError>;

/// Storage back-end the pipeline writes validated records into.
///
/// Infrastructure crates implement this once per storage technology; the
/// batch processor only ever sees the trait.
#[async_trait]
pub trait Sink<R>: Send + Sync
where
    R: Send + Sync,
{
    /// Create schema / indices when absent. Must be safe to call repeatedly.
    async fn initialize(&self) -> SinkResult<()>;

    /// Write all records or none of them
    async fn insert_batch(&self, records: &[R]) -> SinkResult<()>;

    /// Liveness probe. Failures are reported as `false`, never raised.
    async fn health_check(&self) -> bool;

    /// Release underlying connections
    async fn close(&self) -> SinkResult<()>;
}

#[cfg(any(test, feature = "testing"))]
mod mocks {
    use super::{Sink, SinkResult};
    use crate::domain::{Metric, Trace};
    use async_trait::async_trait;

    mockall::mock! {
        pub MetricSink {}

        #[async_trait]
        impl Sink<Metric> for MetricSink {
            async fn initialize(&self) -> SinkResult<()>;
            async fn insert_batch(&self, records: &[Metric]) -> SinkResult<()>;
            async fn health_check(&self) -> bool;
            async fn close(&self) -> SinkResult<()>;
        }
    }

    mockall::mock! {
        pub TraceSink {}

        #[async_trait]
        impl Sink<Trace> for TraceSink {
            async fn initialize(&self) -> SinkResult<()>;
            async fn insert_batch(&self, records: &[Trace]) -> SinkResult<()>;
            async fn health_check(&self) -> bool;
            async fn close(&self) -> SinkResult<()>;
        }
    }
}

#[cfg(any(test, feature = "testing"))]
pub use mocks::{MockMetricSink, MockTraceSink};
