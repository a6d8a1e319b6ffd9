//! Run tracers
//!
//! Tracers are callback handlers that persist completed [`crate::run::Run`]
//! records instead of reacting to individual events. They register like any
//! other handler and opt into dispatch regardless of manager verbosity.

pub mod base;
pub mod run_collector;

pub use base::BaseTracer;
pub use run_collector::RunCollectorCallbackHandler;
