use common::domain::ProcessingError;
use std::time::Duration;
use tokio::time::Instant;

pub const TIME_BUDGET_MESSAGE: &str = "Insufficient time remaining to process record";

/// Remaining wall-clock allowance for one batch.
///
/// Work is only started while strictly more than `reserve` is left before
/// the deadline. A budget without a deadline never runs out.
#[derive(Debug, Clone, Copy)]
pub struct TimeBudget {
    deadline: Option<Instant>,
    reserve: Duration,
}

impl TimeBudget {
    pub fn new(deadline: Option<Instant>, reserve: Duration) -> Self {
        Self { deadline, reserve }
    }

    pub fn unlimited() -> Self {
        Self::new(None, Duration::ZERO)
    }

    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    pub fn is_exhausted(&self) -> bool {
        !self.allows(Duration::ZERO)
    }

    /// Whether `extra` can still be spent without eating into the reserve
    pub fn allows(&self, extra: Duration) -> bool {
        match self.remaining() {
            Some(remaining) => remaining > self.reserve.saturating_add(extra),
            None => true,
        }
    }

    /// The deadline itself has passed
    pub fn is_expired(&self) -> bool {
        self.remaining() == Some(Duration::ZERO)
    }

    /// Timeout for a single sink attempt: `limit`, shortened so the attempt
    /// ends by the deadline. Writes of records that were already accepted may
    /// run into the reserve, but never past the deadline.
    pub fn attempt_timeout(&self, limit: Duration) -> Duration {
        match self.remaining() {
            Some(remaining) => limit.min(remaining),
            None => limit,
        }
    }

    pub fn exhausted_error(&self) -> ProcessingError {
        let remaining_ms = self.remaining().unwrap_or_default().as_millis();
        ProcessingError::retryable_error(TIME_BUDGET_MESSAGE)
            .with_context("remaining_ms", remaining_ms.to_string())
            .with_context("reserve_ms", self.reserve.as_millis().to_string())
    }
}
