mod trace_sink;

pub use trace_sink::*;
