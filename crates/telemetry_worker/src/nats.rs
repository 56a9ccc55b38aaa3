mod telemetry_batch_processor;

pub use telemetry_batch_processor::*;
