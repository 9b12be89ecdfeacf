pub mod signal;
pub mod tracer;
