//! Tracer interface

use crate::error::Result;
use crate::handler::CallbackHandler;
use crate::run::Run;

/// A callback handler that persists run records.
///
/// Implementors decide where a finished run goes: memory, a file, a tracing
/// backend. The manager hands every tracer the full [`Run`] on each terminal
/// event, so no tracer needs to reconstruct run state from event fragments.
pub trait BaseTracer: CallbackHandler {
    /// Persist one run record.
    ///
    /// Called with finished runs on end and error events. Implementations may
    /// also persist in-flight runs from start events if they want to observe
    /// partial state.
    fn persist_run(&self, run: &Run) -> Result<()>;

    /// Session this tracer groups runs under, if any.
    fn session_name(&self) -> Option<&str> {
        None
    }
}
