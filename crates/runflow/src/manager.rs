//! Synchronous callback dispatch and run scoping
//!
//! # Overview
//!
//! - [`CallbackManager`] - Entry point that opens runs and fans events out to
//!   registered handlers
//! - [`CallbackManagerForLlmRun`] and friends - Run-scoped managers returned
//!   by the start methods, each exposing only the events valid for its stage
//!
//! Dispatch is sequential in registration order. Handler failures and panics
//! are contained per handler and logged once per (event, error kind) pair, so
//! one misbehaving observer cannot break the instrumented computation or its
//! sibling handlers.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use futures::FutureExt;
use uuid::Uuid;

use crate::error::Result;
use crate::events::{AgentAction, AgentFinish, LlmResult};
use crate::handler::{AsyncCallbackHandler, CallbackHandler, Handler};
use crate::run::{ExecutionCounter, Run, RunType};

/// Dedup set for handler failure logging.
///
/// Shared across a whole run forest so that a handler failing the same way on
/// every token produces one log line, not thousands.
#[derive(Debug, Default)]
pub(crate) struct ErrorLog {
    seen: Mutex<HashSet<(&'static str, &'static str)>>,
}

impl ErrorLog {
    /// Returns true the first time this (event, kind) pair is recorded.
    pub(crate) fn first(&self, event: &'static str, kind: &'static str) -> bool {
        self.seen
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert((event, kind))
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.seen.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// Which ignore flag an event category is gated by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EventGate {
    /// Never skipped by an ignore flag (text, retriever, embedding events)
    None,
    /// Skipped when `ignore_llm` is set (LLM and chat-model events)
    Llm,
    /// Skipped when `ignore_chain` is set
    Chain,
    /// Skipped when `ignore_agent` is set (tool and agent events)
    Agent,
}

impl EventGate {
    pub(crate) fn ignores(self, handler: &Handler) -> bool {
        match self {
            Self::None => false,
            Self::Llm => handler.ignore_llm(),
            Self::Chain => handler.ignore_chain(),
            Self::Agent => handler.ignore_agent(),
        }
    }
}

/// Shared manager internals.
///
/// Cloning copies the handler list (the handlers themselves are shared `Arc`s)
/// and shares the execution counter and error log, so every manager derived
/// from one root participates in the same run forest.
#[derive(Clone, Debug, Default)]
pub(crate) struct ManagerState {
    pub(crate) handlers: Vec<Handler>,
    pub(crate) verbose: bool,
    pub(crate) parent_run_id: Option<Uuid>,
    pub(crate) tags: Vec<String>,
    pub(crate) inheritable_tags: Vec<String>,
    pub(crate) metadata: HashMap<String, serde_json::Value>,
    pub(crate) inheritable_metadata: HashMap<String, serde_json::Value>,
    pub(crate) counter: ExecutionCounter,
    pub(crate) errors: Arc<ErrorLog>,
}

impl ManagerState {
    pub(crate) fn with_handlers(handlers: Vec<Handler>) -> Self {
        Self {
            handlers,
            ..Self::default()
        }
    }

    /// Whether an event reaches this handler: ignore flags first, then
    /// verbosity.
    pub(crate) fn should_fire(&self, handler: &Handler, gate: EventGate) -> bool {
        !gate.ignores(handler) && (self.verbose || handler.always_verbose())
    }

    /// Open a new run under this manager's parent, stamped with the next
    /// execution order in the forest.
    pub(crate) fn start_run(
        &self,
        run_type: RunType,
        serialized: serde_json::Value,
        inputs: serde_json::Value,
    ) -> Run {
        let name = serialized
            .get("name")
            .and_then(|v| v.as_str())
            .unwrap_or(run_type.label())
            .to_string();
        let mut run = Run::new(Uuid::new_v4(), name, run_type)
            .with_serialized(serialized)
            .with_inputs(inputs)
            .with_tags(self.tags.clone())
            .with_metadata(self.metadata.clone())
            .with_execution_order(self.counter.next());
        if let Some(parent) = self.parent_run_id {
            run = run.with_parent(parent);
        }
        run
    }

    /// State for a manager nested under `run`. Only inheritable tags and
    /// metadata flow down; `tag` is applied locally to the child.
    pub(crate) fn child(&self, run: &Run, tag: Option<&str>) -> Self {
        let mut tags = self.inheritable_tags.clone();
        if let Some(tag) = tag {
            tags.push(tag.to_string());
        }
        Self {
            handlers: self.handlers.clone(),
            verbose: self.verbose,
            parent_run_id: Some(run.id),
            tags,
            inheritable_tags: self.inheritable_tags.clone(),
            metadata: self.inheritable_metadata.clone(),
            inheritable_metadata: self.inheritable_metadata.clone(),
            counter: self.counter.clone(),
            errors: Arc::clone(&self.errors),
        }
    }

    /// Fan one event out to every eligible handler, in registration order.
    ///
    /// Sync handlers are invoked inline; async handlers are driven to
    /// completion on the calling thread. Panics are caught per handler.
    pub(crate) fn dispatch<S, A>(
        &self,
        event: &'static str,
        gate: EventGate,
        sync_call: S,
        async_call: A,
    ) where
        S: Fn(&dyn CallbackHandler) -> Result<()>,
        A: Fn(Arc<dyn AsyncCallbackHandler>) -> BoxFuture<'static, Result<()>>,
    {
        for handler in &self.handlers {
            if !self.should_fire(handler, gate) {
                continue;
            }
            let outcome = match handler {
                Handler::Sync(h) => {
                    std::panic::catch_unwind(AssertUnwindSafe(|| sync_call(h.as_ref())))
                }
                Handler::Async(h) => {
                    let fut = async_call(Arc::clone(h));
                    std::panic::catch_unwind(AssertUnwindSafe(|| futures::executor::block_on(fut)))
                }
            };
            self.settle(event, outcome);
        }
    }

    /// Record one handler outcome, logging the first occurrence of each
    /// (event, error kind) pair.
    pub(crate) fn settle(&self, event: &'static str, outcome: std::thread::Result<Result<()>>) {
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                if self.errors.first(event, e.kind()) {
                    tracing::warn!(event, error = %e, "callback handler failed");
                }
            }
            Err(payload) => {
                if self.errors.first(event, "panic") {
                    tracing::warn!(
                        event,
                        panic = panic_message(payload.as_ref()),
                        "callback handler panicked"
                    );
                }
            }
        }
    }

    pub(crate) fn emit_text(&self, run: &Run, text: &str) {
        let run = Arc::new(run.clone());
        let text: Arc<str> = Arc::from(text);
        self.dispatch(
            "on_text",
            EventGate::None,
            |h| h.on_text(&run, &text),
            |h| {
                let run = Arc::clone(&run);
                let text = Arc::clone(&text);
                async move { h.on_text(&run, &text).await }.boxed()
            },
        );
    }
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "non-string panic payload"
    }
}

/// Callback manager that coordinates multiple callback handlers.
///
/// Start methods open a run, dispatch the matching start event, and return a
/// run-scoped manager for the rest of that run's lifecycle. A manager with no
/// handlers is a valid no-op sink.
#[derive(Clone)]
pub struct CallbackManager {
    pub(crate) state: ManagerState,
}

impl CallbackManager {
    /// Create a manager with no handlers.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: ManagerState::default(),
        }
    }

    /// Create a manager with the given handlers.
    #[must_use]
    pub fn with_handlers(handlers: Vec<Handler>) -> Self {
        Self {
            state: ManagerState::with_handlers(handlers),
        }
    }

    /// Set the verbosity flag. Non-verbose managers only fire handlers that
    /// opt in via `always_verbose`.
    #[must_use]
    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.state.verbose = verbose;
        self
    }

    pub(crate) fn from_state(state: ManagerState) -> Self {
        Self { state }
    }

    /// Add a handler. Takes effect for subsequent dispatches.
    pub fn add_handler(&mut self, handler: Handler) {
        self.state.handlers.push(handler);
    }

    /// Remove every registration of this handler instance.
    pub fn remove_handler(&mut self, handler: &Handler) {
        self.state.handlers.retain(|h| !h.same_handler(handler));
    }

    /// Replace the handler list.
    pub fn set_handlers(&mut self, handlers: Vec<Handler>) {
        self.state.handlers = handlers;
    }

    /// The registered handlers, in dispatch order.
    #[must_use]
    pub fn handlers(&self) -> &[Handler] {
        &self.state.handlers
    }

    /// Number of registered handlers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.handlers.len()
    }

    /// Whether no handlers are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.handlers.is_empty()
    }

    /// Whether this manager dispatches to non-`always_verbose` handlers.
    #[must_use]
    pub fn verbose(&self) -> bool {
        self.state.verbose
    }

    /// Tags applied to runs opened by this manager.
    #[must_use]
    pub fn tags(&self) -> &[String] {
        &self.state.tags
    }

    /// The run new runs will be parented under, if any.
    #[must_use]
    pub fn parent_run_id(&self) -> Option<Uuid> {
        self.state.parent_run_id
    }

    /// Dispatch `on_llm_start` and scope a manager to the new LLM run.
    #[must_use]
    pub fn on_llm_start(
        &self,
        serialized: serde_json::Value,
        prompts: Vec<String>,
    ) -> CallbackManagerForLlmRun {
        let inputs = serde_json::json!({ "prompts": prompts });
        let run = self.state.start_run(RunType::Llm, serialized, inputs);
        let shared = Arc::new(run.clone());
        let prompts = Arc::new(prompts);
        self.state.dispatch(
            "on_llm_start",
            EventGate::Llm,
            |h| h.on_llm_start(&shared, &prompts),
            |h| {
                let run = Arc::clone(&shared);
                let prompts = Arc::clone(&prompts);
                async move { h.on_llm_start(&run, &prompts).await }.boxed()
            },
        );
        CallbackManagerForLlmRun {
            state: self.state.clone(),
            run,
        }
    }

    /// Dispatch `on_chat_model_start` and scope a manager to the new run.
    ///
    /// Handlers that do not override the chat-model event receive a plain
    /// `on_llm_start` instead.
    #[must_use]
    pub fn on_chat_model_start(
        &self,
        serialized: serde_json::Value,
        messages: serde_json::Value,
    ) -> CallbackManagerForLlmRun {
        let inputs = serde_json::json!({ "messages": messages });
        let run = self.state.start_run(RunType::ChatModel, serialized, inputs);
        let shared = Arc::new(run.clone());
        let messages = Arc::new(messages);
        self.state.dispatch(
            "on_chat_model_start",
            EventGate::Llm,
            |h| h.on_chat_model_start(&shared, &messages),
            |h| {
                let run = Arc::clone(&shared);
                let messages = Arc::clone(&messages);
                async move { h.on_chat_model_start(&run, &messages).await }.boxed()
            },
        );
        CallbackManagerForLlmRun {
            state: self.state.clone(),
            run,
        }
    }

    /// Dispatch `on_chain_start` and scope a manager to the new chain run.
    #[must_use]
    pub fn on_chain_start(
        &self,
        serialized: serde_json::Value,
        inputs: HashMap<String, serde_json::Value>,
    ) -> CallbackManagerForChainRun {
        let inputs_value = serde_json::to_value(&inputs).unwrap_or(serde_json::Value::Null);
        let run = self.state.start_run(RunType::Chain, serialized, inputs_value);
        let shared = Arc::new(run.clone());
        let inputs = Arc::new(inputs);
        self.state.dispatch(
            "on_chain_start",
            EventGate::Chain,
            |h| h.on_chain_start(&shared, &inputs),
            |h| {
                let run = Arc::clone(&shared);
                let inputs = Arc::clone(&inputs);
                async move { h.on_chain_start(&run, &inputs).await }.boxed()
            },
        );
        CallbackManagerForChainRun {
            state: self.state.clone(),
            run,
        }
    }

    /// Dispatch `on_tool_start` and scope a manager to the new tool run.
    #[must_use]
    pub fn on_tool_start(
        &self,
        serialized: serde_json::Value,
        input_str: String,
    ) -> CallbackManagerForToolRun {
        let inputs = serde_json::json!({ "input": input_str });
        let run = self.state.start_run(RunType::Tool, serialized, inputs);
        let shared = Arc::new(run.clone());
        let input_str: Arc<str> = Arc::from(input_str);
        self.state.dispatch(
            "on_tool_start",
            EventGate::Agent,
            |h| h.on_tool_start(&shared, &input_str),
            |h| {
                let run = Arc::clone(&shared);
                let input = Arc::clone(&input_str);
                async move { h.on_tool_start(&run, &input).await }.boxed()
            },
        );
        CallbackManagerForToolRun {
            state: self.state.clone(),
            run,
        }
    }

    /// Dispatch `on_retriever_start` and scope a manager to the new run.
    #[must_use]
    pub fn on_retriever_start(
        &self,
        serialized: serde_json::Value,
        query: String,
    ) -> CallbackManagerForRetrieverRun {
        let inputs = serde_json::json!({ "query": query });
        let run = self.state.start_run(RunType::Retriever, serialized, inputs);
        let shared = Arc::new(run.clone());
        let query: Arc<str> = Arc::from(query);
        self.state.dispatch(
            "on_retriever_start",
            EventGate::None,
            |h| h.on_retriever_start(&shared, &query),
            |h| {
                let run = Arc::clone(&shared);
                let query = Arc::clone(&query);
                async move { h.on_retriever_start(&run, &query).await }.boxed()
            },
        );
        CallbackManagerForRetrieverRun {
            state: self.state.clone(),
            run,
        }
    }

    /// Dispatch `on_embedding_start` and scope a manager to the new run.
    #[must_use]
    pub fn on_embedding_start(
        &self,
        serialized: serde_json::Value,
        texts: Vec<String>,
    ) -> CallbackManagerForEmbeddingRun {
        let inputs = serde_json::json!({ "texts": texts });
        let run = self.state.start_run(RunType::Embedding, serialized, inputs);
        let shared = Arc::new(run.clone());
        let texts = Arc::new(texts);
        self.state.dispatch(
            "on_embedding_start",
            EventGate::None,
            |h| h.on_embedding_start(&shared, &texts),
            |h| {
                let run = Arc::clone(&shared);
                let texts = Arc::clone(&texts);
                async move { h.on_embedding_start(&run, &texts).await }.boxed()
            },
        );
        CallbackManagerForEmbeddingRun {
            state: self.state.clone(),
            run,
        }
    }
}

impl Default for CallbackManager {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CallbackManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackManager")
            .field("handlers", &self.state.handlers.len())
            .field("verbose", &self.state.verbose)
            .field("parent_run_id", &self.state.parent_run_id)
            .finish()
    }
}

macro_rules! scoped_manager_common {
    ($run_type:expr) => {
        /// Scoped manager with no handlers, for call sites without callbacks.
        #[must_use]
        pub fn noop() -> Self {
            Self {
                state: ManagerState::default(),
                run: Run::new(Uuid::new_v4(), $run_type.label(), $run_type),
            }
        }

        /// The run this manager is scoped to.
        #[must_use]
        pub fn run(&self) -> &Run {
            &self.run
        }

        /// ID of the scoped run.
        #[must_use]
        pub fn run_id(&self) -> Uuid {
            self.run.id
        }

        /// ID of the scoped run's parent, if any.
        #[must_use]
        pub fn parent_run_id(&self) -> Option<Uuid> {
            self.run.parent_run_id
        }

        /// Derive a manager for work nested under this run.
        ///
        /// The child inherits handlers, verbosity, inheritable tags and
        /// metadata, and the execution counter; `tag` is applied to the
        /// child's own runs only.
        #[must_use]
        pub fn get_child(&self, tag: Option<&str>) -> CallbackManager {
            CallbackManager::from_state(self.state.child(&self.run, tag))
        }

        /// Dispatch `on_text` for this run.
        pub fn on_text(&self, text: &str) {
            self.state.emit_text(&self.run, text);
        }
    };
}

/// Callback manager scoped to an LLM or chat-model run.
#[derive(Clone, Debug)]
pub struct CallbackManagerForLlmRun {
    state: ManagerState,
    run: Run,
}

impl CallbackManagerForLlmRun {
    scoped_manager_common!(RunType::Llm);

    /// Dispatch `on_llm_new_token` for a streamed token.
    pub fn on_llm_new_token(&self, token: &str) {
        let run = Arc::new(self.run.clone());
        let token: Arc<str> = Arc::from(token);
        self.state.dispatch(
            "on_llm_new_token",
            EventGate::Llm,
            |h| h.on_llm_new_token(&run, &token),
            |h| {
                let run = Arc::clone(&run);
                let token = Arc::clone(&token);
                async move { h.on_llm_new_token(&run, &token).await }.boxed()
            },
        );
    }

    /// Finish the run with a result. Consumes the manager; a run ends at most
    /// once.
    pub fn on_llm_end(self, result: LlmResult) -> Run {
        let Self { state, run } = self;
        let outputs = serde_json::to_value(&result).unwrap_or(serde_json::Value::Null);
        let run = run.end(outputs);
        let shared = Arc::new(run.clone());
        let result = Arc::new(result);
        state.dispatch(
            "on_llm_end",
            EventGate::Llm,
            |h| h.on_llm_end(&shared, &result),
            |h| {
                let run = Arc::clone(&shared);
                let result = Arc::clone(&result);
                async move { h.on_llm_end(&run, &result).await }.boxed()
            },
        );
        run
    }

    /// Fail the run with an error. Consumes the manager.
    pub fn on_llm_error(self, error: &str) -> Run {
        let Self { state, run } = self;
        let run = run.fail(error);
        let shared = Arc::new(run.clone());
        let error: Arc<str> = Arc::from(error);
        state.dispatch(
            "on_llm_error",
            EventGate::Llm,
            |h| h.on_llm_error(&shared, &error),
            |h| {
                let run = Arc::clone(&shared);
                let error = Arc::clone(&error);
                async move { h.on_llm_error(&run, &error).await }.boxed()
            },
        );
        run
    }
}

/// Callback manager scoped to a chain run.
#[derive(Clone, Debug)]
pub struct CallbackManagerForChainRun {
    state: ManagerState,
    run: Run,
}

impl CallbackManagerForChainRun {
    scoped_manager_common!(RunType::Chain);

    /// Dispatch `on_agent_action` for an agent tool decision.
    pub fn on_agent_action(&self, action: &AgentAction) {
        let run = Arc::new(self.run.clone());
        let action = Arc::new(action.clone());
        self.state.dispatch(
            "on_agent_action",
            EventGate::Agent,
            |h| h.on_agent_action(&run, &action),
            |h| {
                let run = Arc::clone(&run);
                let action = Arc::clone(&action);
                async move { h.on_agent_action(&run, &action).await }.boxed()
            },
        );
    }

    /// Dispatch `on_agent_finish` when an agent loop completes.
    pub fn on_agent_finish(&self, finish: &AgentFinish) {
        let run = Arc::new(self.run.clone());
        let finish = Arc::new(finish.clone());
        self.state.dispatch(
            "on_agent_finish",
            EventGate::Agent,
            |h| h.on_agent_finish(&run, &finish),
            |h| {
                let run = Arc::clone(&run);
                let finish = Arc::clone(&finish);
                async move { h.on_agent_finish(&run, &finish).await }.boxed()
            },
        );
    }

    /// Finish the run with outputs. Consumes the manager.
    pub fn on_chain_end(self, outputs: HashMap<String, serde_json::Value>) -> Run {
        let Self { state, run } = self;
        let outputs_value = serde_json::to_value(&outputs).unwrap_or(serde_json::Value::Null);
        let run = run.end(outputs_value);
        let shared = Arc::new(run.clone());
        let outputs = Arc::new(outputs);
        state.dispatch(
            "on_chain_end",
            EventGate::Chain,
            |h| h.on_chain_end(&shared, &outputs),
            |h| {
                let run = Arc::clone(&shared);
                let outputs = Arc::clone(&outputs);
                async move { h.on_chain_end(&run, &outputs).await }.boxed()
            },
        );
        run
    }

    /// Fail the run with an error. Consumes the manager.
    pub fn on_chain_error(self, error: &str) -> Run {
        let Self { state, run } = self;
        let run = run.fail(error);
        let shared = Arc::new(run.clone());
        let error: Arc<str> = Arc::from(error);
        state.dispatch(
            "on_chain_error",
            EventGate::Chain,
            |h| h.on_chain_error(&shared, &error),
            |h| {
                let run = Arc::clone(&shared);
                let error = Arc::clone(&error);
                async move { h.on_chain_error(&run, &error).await }.boxed()
            },
        );
        run
    }
}

/// Callback manager scoped to a tool run.
#[derive(Clone, Debug)]
pub struct CallbackManagerForToolRun {
    state: ManagerState,
    run: Run,
}

impl CallbackManagerForToolRun {
    scoped_manager_common!(RunType::Tool);

    /// Finish the run with the tool output. Consumes the manager.
    pub fn on_tool_end(self, output: &str) -> Run {
        let Self { state, run } = self;
        let run = run.end(serde_json::json!({ "output": output }));
        let shared = Arc::new(run.clone());
        let output: Arc<str> = Arc::from(output);
        state.dispatch(
            "on_tool_end",
            EventGate::Agent,
            |h| h.on_tool_end(&shared, &output),
            |h| {
                let run = Arc::clone(&shared);
                let output = Arc::clone(&output);
                async move { h.on_tool_end(&run, &output).await }.boxed()
            },
        );
        run
    }

    /// Fail the run with an error. Consumes the manager.
    pub fn on_tool_error(self, error: &str) -> Run {
        let Self { state, run } = self;
        let run = run.fail(error);
        let shared = Arc::new(run.clone());
        let error: Arc<str> = Arc::from(error);
        state.dispatch(
            "on_tool_error",
            EventGate::Agent,
            |h| h.on_tool_error(&shared, &error),
            |h| {
                let run = Arc::clone(&shared);
                let error = Arc::clone(&error);
                async move { h.on_tool_error(&run, &error).await }.boxed()
            },
        );
        run
    }
}

/// Callback manager scoped to a retriever run.
#[derive(Clone, Debug)]
pub struct CallbackManagerForRetrieverRun {
    state: ManagerState,
    run: Run,
}

impl CallbackManagerForRetrieverRun {
    scoped_manager_common!(RunType::Retriever);

    /// Finish the run with the retrieved documents. Consumes the manager.
    pub fn on_retriever_end(self, documents: Vec<serde_json::Value>) -> Run {
        let Self { state, run } = self;
        let run = run.end(serde_json::json!({ "documents": documents }));
        let shared = Arc::new(run.clone());
        let documents = Arc::new(documents);
        state.dispatch(
            "on_retriever_end",
            EventGate::None,
            |h| h.on_retriever_end(&shared, &documents),
            |h| {
                let run = Arc::clone(&shared);
                let documents = Arc::clone(&documents);
                async move { h.on_retriever_end(&run, &documents).await }.boxed()
            },
        );
        run
    }

    /// Fail the run with an error. Consumes the manager.
    pub fn on_retriever_error(self, error: &str) -> Run {
        let Self { state, run } = self;
        let run = run.fail(error);
        let shared = Arc::new(run.clone());
        let error: Arc<str> = Arc::from(error);
        state.dispatch(
            "on_retriever_error",
            EventGate::None,
            |h| h.on_retriever_error(&shared, &error),
            |h| {
                let run = Arc::clone(&shared);
                let error = Arc::clone(&error);
                async move { h.on_retriever_error(&run, &error).await }.boxed()
            },
        );
        run
    }
}

/// Callback manager scoped to an embedding run.
#[derive(Clone, Debug)]
pub struct CallbackManagerForEmbeddingRun {
    state: ManagerState,
    run: Run,
}

impl CallbackManagerForEmbeddingRun {
    scoped_manager_common!(RunType::Embedding);

    /// Finish the run with the generated embeddings. Consumes the manager.
    ///
    /// Recorded outputs keep the shape (count, dimensions) rather than the
    /// vectors themselves.
    pub fn on_embedding_end(self, embeddings: Vec<Vec<f32>>) -> Run {
        let Self { state, run } = self;
        let outputs = serde_json::json!({
            "embedding_count": embeddings.len(),
            "dimensions": embeddings.first().map_or(0, Vec::len),
        });
        let run = run.end(outputs);
        let shared = Arc::new(run.clone());
        let embeddings = Arc::new(embeddings);
        state.dispatch(
            "on_embedding_end",
            EventGate::None,
            |h| h.on_embedding_end(&shared, &embeddings),
            |h| {
                let run = Arc::clone(&shared);
                let embeddings = Arc::clone(&embeddings);
                async move { h.on_embedding_end(&run, &embeddings).await }.boxed()
            },
        );
        run
    }

    /// Fail the run with an error. Consumes the manager.
    pub fn on_embedding_error(self, error: &str) -> Run {
        let Self { state, run } = self;
        let run = run.fail(error);
        let shared = Arc::new(run.clone());
        let error: Arc<str> = Arc::from(error);
        state.dispatch(
            "on_embedding_error",
            EventGate::None,
            |h| h.on_embedding_error(&shared, &error),
            |h| {
                let run = Arc::clone(&shared);
                let error = Arc::clone(&error);
                async move { h.on_embedding_error(&run, &error).await }.boxed()
            },
        );
        run
    }
}

#[cfg(test)]
mod tests {
    use crate::test_prelude::*;

    use crate::handler::NullCallbackHandler;
    use crate::manager::{CallbackManager, ErrorLog, EventGate, ManagerState};

    struct CountingHandler {
        starts: AtomicUsize,
        ends: AtomicUsize,
        tokens: AtomicUsize,
        verbose_override: bool,
        skip_llm: bool,
    }

    impl CountingHandler {
        fn new() -> Self {
            Self {
                starts: AtomicUsize::new(0),
                ends: AtomicUsize::new(0),
                tokens: AtomicUsize::new(0),
                verbose_override: false,
                skip_llm: false,
            }
        }

        fn always_verbose() -> Self {
            Self {
                verbose_override: true,
                ..Self::new()
            }
        }

        fn ignoring_llm() -> Self {
            Self {
                skip_llm: true,
                ..Self::new()
            }
        }
    }

    impl CallbackHandler for CountingHandler {
        fn ignore_llm(&self) -> bool {
            self.skip_llm
        }

        fn always_verbose(&self) -> bool {
            self.verbose_override
        }

        fn on_llm_start(&self, _run: &Run, _prompts: &[String]) -> Result<()> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn on_llm_new_token(&self, _run: &Run, _token: &str) -> Result<()> {
            self.tokens.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn on_llm_end(&self, _run: &Run, _result: &LlmResult) -> Result<()> {
            self.ends.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn manager_with(handler: Arc<CountingHandler>, verbose: bool) -> CallbackManager {
        CallbackManager::with_handlers(vec![Handler::Sync(handler)]).with_verbose(verbose)
    }

    #[test]
    fn error_log_dedups_by_event_and_kind() {
        let log = ErrorLog::default();
        assert!(log.first("on_llm_end", "handler"));
        assert!(!log.first("on_llm_end", "handler"));
        assert!(log.first("on_llm_end", "io"));
        assert!(log.first("on_chain_end", "handler"));
        assert_eq!(log.len(), 3);
    }

    #[test]
    fn gating_respects_ignore_flags_and_verbosity() {
        let state = ManagerState::default();
        let plain = Handler::sync(NullCallbackHandler);
        // Non-verbose manager skips handlers without always_verbose.
        assert!(!state.should_fire(&plain, EventGate::None));

        let verbose_state = ManagerState {
            verbose: true,
            ..ManagerState::default()
        };
        assert!(verbose_state.should_fire(&plain, EventGate::None));

        let ignoring = Handler::sync(CountingHandler::ignoring_llm());
        assert!(!verbose_state.should_fire(&ignoring, EventGate::Llm));
        assert!(verbose_state.should_fire(&ignoring, EventGate::Chain));
        assert!(verbose_state.should_fire(&ignoring, EventGate::None));

        let eager = Handler::sync(CountingHandler::always_verbose());
        assert!(state.should_fire(&eager, EventGate::Llm));
    }

    #[test]
    fn non_verbose_manager_still_fires_always_verbose_handlers() {
        let quiet = Arc::new(CountingHandler::new());
        let eager = Arc::new(CountingHandler::always_verbose());
        let mut manager = manager_with(Arc::clone(&quiet), false);
        manager.add_handler(Handler::Sync(Arc::clone(&eager) as Arc<dyn CallbackHandler>));

        let scoped = manager.on_llm_start(json!({"name": "model"}), vec!["hi".into()]);
        scoped.on_llm_end(LlmResult::from_generations(vec!["ok".into()]));

        assert_eq!(quiet.starts.load(Ordering::SeqCst), 0);
        assert_eq!(eager.starts.load(Ordering::SeqCst), 1);
        assert_eq!(eager.ends.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn start_run_names_from_serialized_with_type_fallback() {
        let state = ManagerState::default();
        let named = state.start_run(RunType::Llm, json!({"name": "gpt-x"}), json!({}));
        assert_eq!(named.name, "gpt-x");

        let unnamed = state.start_run(RunType::Tool, json!({}), json!({}));
        assert_eq!(unnamed.name, "tool");
    }

    #[test]
    fn execution_order_is_shared_across_derived_managers() {
        let handler = Arc::new(CountingHandler::new());
        let manager = manager_with(Arc::clone(&handler), true);

        let chain = manager.on_chain_start(json!({"name": "outer"}), HashMap::new());
        assert_eq!(chain.run().execution_order, 1);

        let child = chain.get_child(None);
        let llm = child.on_llm_start(json!({"name": "inner"}), vec![]);
        assert_eq!(llm.run().execution_order, 2);
        assert_eq!(llm.parent_run_id(), Some(chain.run_id()));

        let sibling = child.on_llm_start(json!({"name": "inner2"}), vec![]);
        assert_eq!(sibling.run().execution_order, 3);
    }

    #[test]
    fn child_inherits_only_inheritable_tags() {
        let state = ManagerState {
            tags: vec!["local".into()],
            inheritable_tags: vec!["family".into()],
            ..ManagerState::default()
        };
        let run = Run::new(Uuid::new_v4(), "chain", RunType::Chain);
        let child = state.child(&run, Some("step"));

        assert_eq!(child.tags, vec!["family".to_string(), "step".to_string()]);
        assert_eq!(child.inheritable_tags, vec!["family".to_string()]);
        assert_eq!(child.parent_run_id, Some(run.id));
    }

    #[test]
    fn failing_handler_does_not_stop_dispatch() {
        struct Failing;
        impl CallbackHandler for Failing {
            fn on_llm_start(&self, _run: &Run, _prompts: &[String]) -> Result<()> {
                Err(crate::error::Error::handler("broken sink"))
            }
        }

        let counting = Arc::new(CountingHandler::new());
        let manager = CallbackManager::with_handlers(vec![
            Handler::sync(Failing),
            Handler::Sync(Arc::clone(&counting) as Arc<dyn CallbackHandler>),
        ])
        .with_verbose(true);

        let scoped = manager.on_llm_start(json!({"name": "m"}), vec![]);
        assert_eq!(counting.starts.load(Ordering::SeqCst), 1);
        // Same failure again is deduped in the error log.
        drop(manager.on_llm_start(json!({"name": "m"}), vec![]));
        assert_eq!(scoped.run().run_type, RunType::Llm);
    }

    #[test]
    fn panicking_handler_is_contained_and_logged_once() {
        // Exercises the warn path; a second init attempt elsewhere is fine.
        tracing_subscriber::fmt().with_test_writer().try_init().ok();

        struct Panicking;
        impl CallbackHandler for Panicking {
            fn on_llm_new_token(&self, _run: &Run, _token: &str) -> Result<()> {
                panic!("token overflow")
            }
        }

        let counting = Arc::new(CountingHandler::new());
        let manager = CallbackManager::with_handlers(vec![
            Handler::sync(Panicking),
            Handler::Sync(Arc::clone(&counting) as Arc<dyn CallbackHandler>),
        ])
        .with_verbose(true);

        let scoped = manager.on_llm_start(json!({"name": "m"}), vec![]);
        scoped.on_llm_new_token("a");
        scoped.on_llm_new_token("b");

        assert_eq!(counting.tokens.load(Ordering::SeqCst), 2);
        assert_eq!(manager.state.errors.len(), 1);
    }

    #[test]
    fn noop_manager_dispatches_nothing() {
        let manager = CallbackManager::new();
        assert!(manager.is_empty());
        let scoped = manager.on_chain_start(json!({"name": "c"}), HashMap::new());
        scoped.on_text("quiet");
        let run = scoped.on_chain_end(HashMap::new());
        assert!(run.is_finished());
    }
}
