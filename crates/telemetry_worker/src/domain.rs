mod batch_processor;
mod health;
mod processing_metrics;
mod retry;
mod time_budget;
mod validator;

pub use batch_processor::*;
pub use health::*;
pub use processing_metrics::*;
pub use retry::*;
pub use time_budget::*;
pub use validator::*;
