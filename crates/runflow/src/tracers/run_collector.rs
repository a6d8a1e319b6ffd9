//! In-memory run collection

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::Result;
use crate::events::LlmResult;
use crate::handler::CallbackHandler;
use crate::run::Run;
use crate::tracers::base::BaseTracer;

/// Tracer that collects finished runs in memory.
///
/// Clones share the same backing store, so one collector can be registered on
/// several managers and inspected from the caller afterwards. Fires on every
/// terminal event regardless of manager verbosity.
#[derive(Debug, Clone, Default)]
pub struct RunCollectorCallbackHandler {
    traced_runs: Arc<Mutex<Vec<Run>>>,
}

impl RunCollectorCallbackHandler {
    /// Create an empty collector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the collected runs, in persistence order.
    #[must_use]
    pub fn get_traced_runs(&self) -> Vec<Run> {
        self.traced_runs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Discard all collected runs.
    pub fn clear(&self) {
        self.traced_runs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    /// Number of collected runs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.traced_runs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Whether no runs have been collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl BaseTracer for RunCollectorCallbackHandler {
    fn persist_run(&self, run: &Run) -> Result<()> {
        self.traced_runs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(run.clone());
        Ok(())
    }
}

impl CallbackHandler for RunCollectorCallbackHandler {
    fn always_verbose(&self) -> bool {
        true
    }

    fn on_llm_end(&self, run: &Run, _result: &LlmResult) -> Result<()> {
        self.persist_run(run)
    }

    fn on_llm_error(&self, run: &Run, _error: &str) -> Result<()> {
        self.persist_run(run)
    }

    fn on_chain_end(&self, run: &Run, _outputs: &HashMap<String, serde_json::Value>) -> Result<()> {
        self.persist_run(run)
    }

    fn on_chain_error(&self, run: &Run, _error: &str) -> Result<()> {
        self.persist_run(run)
    }

    fn on_tool_end(&self, run: &Run, _output: &str) -> Result<()> {
        self.persist_run(run)
    }

    fn on_tool_error(&self, run: &Run, _error: &str) -> Result<()> {
        self.persist_run(run)
    }

    fn on_retriever_end(&self, run: &Run, _documents: &[serde_json::Value]) -> Result<()> {
        self.persist_run(run)
    }

    fn on_retriever_error(&self, run: &Run, _error: &str) -> Result<()> {
        self.persist_run(run)
    }

    fn on_embedding_end(&self, run: &Run, _embeddings: &[Vec<f32>]) -> Result<()> {
        self.persist_run(run)
    }

    fn on_embedding_error(&self, run: &Run, _error: &str) -> Result<()> {
        self.persist_run(run)
    }
}
