mod error;
mod result;
mod sink;
mod telemetry;

pub use error::*;
pub use result::*;
pub use sink::*;
pub use telemetry::*;
