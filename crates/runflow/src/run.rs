//! Run records and execution-order accounting
//!
//! A [`Run`] is the unit of tracing: one LLM call, chain invocation, tool
//! call, retrieval, or embedding request. Runs form a forest: every run
//! started through a root manager is a root of its own tree, and runs started
//! through a `get_child` manager hang off their parent's `id`.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Type of run being traced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunType {
    /// LLM completion
    Llm,
    /// Chat-model completion
    ChatModel,
    /// Chain execution
    Chain,
    /// Tool execution
    Tool,
    /// Document retrieval
    Retriever,
    /// Embedding generation
    Embedding,
}

impl RunType {
    /// Wire label for the run type, used as the default run name.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Llm => "llm",
            Self::ChatModel => "chat_model",
            Self::Chain => "chain",
            Self::Tool => "tool",
            Self::Retriever => "retriever",
            Self::Embedding => "embedding",
        }
    }
}

impl fmt::Display for RunType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A single run in the execution trace forest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    /// Unique run identifier
    pub id: Uuid,

    /// Name of the component being run
    pub name: String,

    /// Type of run
    pub run_type: RunType,

    /// When the run started
    pub start_time: DateTime<Utc>,

    /// When the run ended (if completed)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,

    /// Parent run ID (if this is a child run)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_run_id: Option<Uuid>,

    /// Position of this run within its run forest; monotonically increasing
    /// across a root manager and every child manager derived from it
    pub execution_order: u32,

    /// High-water mark for the run's subtree. Starts equal to
    /// `execution_order`; tracing handlers may advance it as children finish.
    pub child_execution_order: u32,

    /// Serialized representation of the component (opaque to the core)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub serialized: Option<serde_json::Value>,

    /// Inputs to the run
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inputs: Option<serde_json::Value>,

    /// Outputs from the run
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outputs: Option<serde_json::Value>,

    /// Error if the run failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Tags for categorization
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,

    /// Additional metadata
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl Run {
    /// Create a new run
    pub fn new(id: Uuid, name: impl Into<String>, run_type: RunType) -> Self {
        Self {
            id,
            name: name.into(),
            run_type,
            start_time: Utc::now(),
            end_time: None,
            parent_run_id: None,
            execution_order: 1,
            child_execution_order: 1,
            serialized: None,
            inputs: None,
            outputs: None,
            error: None,
            tags: Vec::new(),
            metadata: HashMap::new(),
        }
    }

    /// Set the parent run ID
    #[must_use]
    pub fn with_parent(mut self, parent_run_id: Uuid) -> Self {
        self.parent_run_id = Some(parent_run_id);
        self
    }

    /// Set the inputs
    #[must_use]
    pub fn with_inputs(mut self, inputs: serde_json::Value) -> Self {
        self.inputs = Some(inputs);
        self
    }

    /// Set the serialized component description
    #[must_use]
    pub fn with_serialized(mut self, serialized: serde_json::Value) -> Self {
        self.serialized = Some(serialized);
        self
    }

    /// Set the tags
    #[must_use]
    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    /// Set metadata
    #[must_use]
    pub fn with_metadata(mut self, metadata: HashMap<String, serde_json::Value>) -> Self {
        self.metadata = metadata;
        self
    }

    /// Set the execution order (also resets the subtree high-water mark)
    #[must_use]
    pub fn with_execution_order(mut self, execution_order: u32) -> Self {
        self.execution_order = execution_order;
        self.child_execution_order = execution_order;
        self
    }

    /// Mark the run as ended with outputs
    #[must_use]
    pub fn end(mut self, outputs: serde_json::Value) -> Self {
        if self.end_time.is_none() {
            self.end_time = Some(Utc::now());
        }
        self.outputs = Some(outputs);
        self
    }

    /// Mark the run as failed with an error
    #[must_use]
    pub fn fail(mut self, error: impl Into<String>) -> Self {
        if self.end_time.is_none() {
            self.end_time = Some(Utc::now());
        }
        self.error = Some(error.into());
        self
    }

    /// Whether the run has reached its terminal state
    #[must_use]
    pub const fn is_finished(&self) -> bool {
        self.end_time.is_some()
    }
}

/// Monotonic execution-order source for one run forest.
///
/// A fresh counter is created per resolved root manager and shared (by
/// reference) with every child manager derived from it, so sibling and nested
/// runs within one forest order deterministically. Counters from independent
/// top-level invocations are unrelated.
#[derive(Debug, Clone, Default)]
pub(crate) struct ExecutionCounter(Arc<AtomicU32>);

impl ExecutionCounter {
    /// Allocate the next execution order. The first run in a forest gets 1.
    pub(crate) fn next(&self) -> u32 {
        self.0.fetch_add(1, Ordering::Relaxed) + 1
    }
}
