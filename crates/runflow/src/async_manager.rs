//! Asynchronous callback dispatch and run scoping
//!
//! # Overview
//!
//! - [`AsyncCallbackManager`] - Async counterpart of
//!   [`crate::manager::CallbackManager`]
//! - [`AsyncCallbackManagerForLlmRun`] and friends - Run-scoped async managers
//!
//! For each event, eligible handlers run concurrently: async handlers are
//! awaited as tasks, sync handlers are offloaded to the blocking pool so they
//! never stall the runtime. The dispatch future resolves only after every
//! handler settles, so an event never outlives its dispatch call.

use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::events::{AgentAction, AgentFinish, LlmResult};
use crate::handler::{AsyncCallbackHandler, CallbackHandler, Handler};
use crate::manager::{CallbackManager, EventGate, ManagerState};
use crate::run::{Run, RunType};

impl ManagerState {
    /// Concurrent counterpart of [`ManagerState::dispatch`].
    ///
    /// Every eligible handler is turned into a future first, then the whole
    /// batch is awaited as one barrier. Panics surface per handler (through
    /// the blocking pool's join error for sync handlers) and are settled the
    /// same way handler errors are.
    pub(crate) async fn dispatch_async<S, A>(
        &self,
        event: &'static str,
        gate: EventGate,
        sync_call: S,
        async_call: A,
    ) where
        S: Fn(Arc<dyn CallbackHandler>) -> Result<()> + Send + Sync + 'static,
        A: Fn(Arc<dyn AsyncCallbackHandler>) -> BoxFuture<'static, Result<()>>,
    {
        let sync_call = Arc::new(sync_call);
        let mut work: Vec<BoxFuture<'static, std::thread::Result<Result<()>>>> = Vec::new();
        for handler in &self.handlers {
            if !self.should_fire(handler, gate) {
                continue;
            }
            match handler {
                Handler::Sync(h) => {
                    let h = Arc::clone(h);
                    let call = Arc::clone(&sync_call);
                    work.push(
                        tokio::task::spawn_blocking(move || call(h))
                            .map(|joined| match joined {
                                Ok(result) => Ok(result),
                                Err(e) if e.is_panic() => Err(e.into_panic()),
                                Err(e) => {
                                    Ok(Err(Error::handler(format!("handler task failed: {e}"))))
                                }
                            })
                            .boxed(),
                    );
                }
                Handler::Async(h) => {
                    work.push(
                        AssertUnwindSafe(async_call(Arc::clone(h)))
                            .catch_unwind()
                            .boxed(),
                    );
                }
            }
        }
        for outcome in futures::future::join_all(work).await {
            self.settle(event, outcome);
        }
    }

    pub(crate) async fn emit_text_async(&self, run: &Run, text: &str) {
        let run = Arc::new(run.clone());
        let text: Arc<str> = Arc::from(text);
        let (sync_run, sync_text) = (Arc::clone(&run), Arc::clone(&text));
        self.dispatch_async(
            "on_text",
            EventGate::None,
            move |h| h.on_text(&sync_run, &sync_text),
            |h| {
                let run = Arc::clone(&run);
                let text = Arc::clone(&text);
                async move { h.on_text(&run, &text).await }.boxed()
            },
        )
        .await;
    }
}

/// Async callback manager that coordinates multiple callback handlers.
///
/// Same surface as [`CallbackManager`] with async event methods. Handlers of
/// either kind can be registered on either manager; the difference is purely
/// in how dispatch is driven.
#[derive(Clone)]
pub struct AsyncCallbackManager {
    pub(crate) state: ManagerState,
}

impl AsyncCallbackManager {
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

    /// The registered handlers, in registration order.
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
    pub async fn on_llm_start(
        &self,
        serialized: serde_json::Value,
        prompts: Vec<String>,
    ) -> AsyncCallbackManagerForLlmRun {
        let inputs = serde_json::json!({ "prompts": prompts });
        let run = self.state.start_run(RunType::Llm, serialized, inputs);
        let shared = Arc::new(run.clone());
        let prompts = Arc::new(prompts);
        let (sync_run, sync_prompts) = (Arc::clone(&shared), Arc::clone(&prompts));
        self.state
            .dispatch_async(
                "on_llm_start",
                EventGate::Llm,
                move |h| h.on_llm_start(&sync_run, &sync_prompts),
                |h| {
                    let run = Arc::clone(&shared);
                    let prompts = Arc::clone(&prompts);
                    async move { h.on_llm_start(&run, &prompts).await }.boxed()
                },
            )
            .await;
        AsyncCallbackManagerForLlmRun {
            state: self.state.clone(),
            run,
        }
    }

    /// Dispatch `on_chat_model_start` and scope a manager to the new run.
    pub async fn on_chat_model_start(
        &self,
        serialized: serde_json::Value,
        messages: serde_json::Value,
    ) -> AsyncCallbackManagerForLlmRun {
        let inputs = serde_json::json!({ "messages": messages });
        let run = self.state.start_run(RunType::ChatModel, serialized, inputs);
        let shared = Arc::new(run.clone());
        let messages = Arc::new(messages);
        let (sync_run, sync_messages) = (Arc::clone(&shared), Arc::clone(&messages));
        self.state
            .dispatch_async(
                "on_chat_model_start",
                EventGate::Llm,
                move |h| h.on_chat_model_start(&sync_run, &sync_messages),
                |h| {
                    let run = Arc::clone(&shared);
                    let messages = Arc::clone(&messages);
                    async move { h.on_chat_model_start(&run, &messages).await }.boxed()
                },
            )
            .await;
        AsyncCallbackManagerForLlmRun {
            state: self.state.clone(),
            run,
        }
    }

    /// Dispatch `on_chain_start` and scope a manager to the new chain run.
    pub async fn on_chain_start(
        &self,
        serialized: serde_json::Value,
        inputs: HashMap<String, serde_json::Value>,
    ) -> AsyncCallbackManagerForChainRun {
        let inputs_value = serde_json::to_value(&inputs).unwrap_or(serde_json::Value::Null);
        let run = self.state.start_run(RunType::Chain, serialized, inputs_value);
        let shared = Arc::new(run.clone());
        let inputs = Arc::new(inputs);
        let (sync_run, sync_inputs) = (Arc::clone(&shared), Arc::clone(&inputs));
        self.state
            .dispatch_async(
                "on_chain_start",
                EventGate::Chain,
                move |h| h.on_chain_start(&sync_run, &sync_inputs),
                |h| {
                    let run = Arc::clone(&shared);
                    let inputs = Arc::clone(&inputs);
                    async move { h.on_chain_start(&run, &inputs).await }.boxed()
                },
            )
            .await;
        AsyncCallbackManagerForChainRun {
            state: self.state.clone(),
            run,
        }
    }

    /// Dispatch `on_tool_start` and scope a manager to the new tool run.
    pub async fn on_tool_start(
        &self,
        serialized: serde_json::Value,
        input_str: String,
    ) -> AsyncCallbackManagerForToolRun {
        let inputs = serde_json::json!({ "input": input_str });
        let run = self.state.start_run(RunType::Tool, serialized, inputs);
        let shared = Arc::new(run.clone());
        let input_str: Arc<str> = Arc::from(input_str);
        let (sync_run, sync_input) = (Arc::clone(&shared), Arc::clone(&input_str));
        self.state
            .dispatch_async(
                "on_tool_start",
                EventGate::Agent,
                move |h| h.on_tool_start(&sync_run, &sync_input),
                |h| {
                    let run = Arc::clone(&shared);
                    let input = Arc::clone(&input_str);
                    async move { h.on_tool_start(&run, &input).await }.boxed()
                },
            )
            .await;
        AsyncCallbackManagerForToolRun {
            state: self.state.clone(),
            run,
        }
    }

    /// Dispatch `on_retriever_start` and scope a manager to the new run.
    pub async fn on_retriever_start(
        &self,
        serialized: serde_json::Value,
        query: String,
    ) -> AsyncCallbackManagerForRetrieverRun {
        let inputs = serde_json::json!({ "query": query });
        let run = self.state.start_run(RunType::Retriever, serialized, inputs);
        let shared = Arc::new(run.clone());
        let query: Arc<str> = Arc::from(query);
        let (sync_run, sync_query) = (Arc::clone(&shared), Arc::clone(&query));
        self.state
            .dispatch_async(
                "on_retriever_start",
                EventGate::None,
                move |h| h.on_retriever_start(&sync_run, &sync_query),
                |h| {
                    let run = Arc::clone(&shared);
                    let query = Arc::clone(&query);
                    async move { h.on_retriever_start(&run, &query).await }.boxed()
                },
            )
            .await;
        AsyncCallbackManagerForRetrieverRun {
            state: self.state.clone(),
            run,
        }
    }

    /// Dispatch `on_embedding_start` and scope a manager to the new run.
    pub async fn on_embedding_start(
        &self,
        serialized: serde_json::Value,
        texts: Vec<String>,
    ) -> AsyncCallbackManagerForEmbeddingRun {
        let inputs = serde_json::json!({ "texts": texts });
        let run = self.state.start_run(RunType::Embedding, serialized, inputs);
        let shared = Arc::new(run.clone());
        let texts = Arc::new(texts);
        let (sync_run, sync_texts) = (Arc::clone(&shared), Arc::clone(&texts));
        self.state
            .dispatch_async(
                "on_embedding_start",
                EventGate::None,
                move |h| h.on_embedding_start(&sync_run, &sync_texts),
                |h| {
                    let run = Arc::clone(&shared);
                    let texts = Arc::clone(&texts);
                    async move { h.on_embedding_start(&run, &texts).await }.boxed()
                },
            )
            .await;
        AsyncCallbackManagerForEmbeddingRun {
            state: self.state.clone(),
            run,
        }
    }
}

impl Default for AsyncCallbackManager {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for AsyncCallbackManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncCallbackManager")
            .field("handlers", &self.state.handlers.len())
            .field("verbose", &self.state.verbose)
            .field("parent_run_id", &self.state.parent_run_id)
            .finish()
    }
}

macro_rules! async_scoped_common {
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

        /// Derive an async manager for work nested under this run.
        #[must_use]
        pub fn get_child(&self, tag: Option<&str>) -> AsyncCallbackManager {
            AsyncCallbackManager::from_state(self.state.child(&self.run, tag))
        }

        /// Derive a sync manager for blocking work nested under this run.
        #[must_use]
        pub fn get_sync_child(&self, tag: Option<&str>) -> CallbackManager {
            CallbackManager::from_state(self.state.child(&self.run, tag))
        }

        /// Dispatch `on_text` for this run.
        pub async fn on_text(&self, text: &str) {
            self.state.emit_text_async(&self.run, text).await;
        }
    };
}

/// Async callback manager scoped to an LLM or chat-model run.
#[derive(Clone, Debug)]
pub struct AsyncCallbackManagerForLlmRun {
    state: ManagerState,
    run: Run,
}

impl AsyncCallbackManagerForLlmRun {
    async_scoped_common!(RunType::Llm);

    /// Dispatch `on_llm_new_token` for a streamed token.
    pub async fn on_llm_new_token(&self, token: &str) {
        let run = Arc::new(self.run.clone());
        let token: Arc<str> = Arc::from(token);
        let (sync_run, sync_token) = (Arc::clone(&run), Arc::clone(&token));
        self.state
            .dispatch_async(
                "on_llm_new_token",
                EventGate::Llm,
                move |h| h.on_llm_new_token(&sync_run, &sync_token),
                |h| {
                    let run = Arc::clone(&run);
                    let token = Arc::clone(&token);
                    async move { h.on_llm_new_token(&run, &token).await }.boxed()
                },
            )
            .await;
    }

    /// Finish the run with a result. Consumes the manager; a run ends at most
    /// once.
    pub async fn on_llm_end(self, result: LlmResult) -> Run {
        let Self { state, run } = self;
        let outputs = serde_json::to_value(&result).unwrap_or(serde_json::Value::Null);
        let run = run.end(outputs);
        let shared = Arc::new(run.clone());
        let result = Arc::new(result);
        let (sync_run, sync_result) = (Arc::clone(&shared), Arc::clone(&result));
        state
            .dispatch_async(
                "on_llm_end",
                EventGate::Llm,
                move |h| h.on_llm_end(&sync_run, &sync_result),
                |h| {
                    let run = Arc::clone(&shared);
                    let result = Arc::clone(&result);
                    async move { h.on_llm_end(&run, &result).await }.boxed()
                },
            )
            .await;
        run
    }

    /// Fail the run with an error. Consumes the manager.
    pub async fn on_llm_error(self, error: &str) -> Run {
        let Self { state, run } = self;
        let run = run.fail(error);
        let shared = Arc::new(run.clone());
        let error: Arc<str> = Arc::from(error);
        let (sync_run, sync_error) = (Arc::clone(&shared), Arc::clone(&error));
        state
            .dispatch_async(
                "on_llm_error",
                EventGate::Llm,
                move |h| h.on_llm_error(&sync_run, &sync_error),
                |h| {
                    let run = Arc::clone(&shared);
                    let error = Arc::clone(&error);
                    async move { h.on_llm_error(&run, &error).await }.boxed()
                },
            )
            .await;
        run
    }
}

/// Async callback manager scoped to a chain run.
#[derive(Clone, Debug)]
pub struct AsyncCallbackManagerForChainRun {
    state: ManagerState,
    run: Run,
}

impl AsyncCallbackManagerForChainRun {
    async_scoped_common!(RunType::Chain);

    /// Dispatch `on_agent_action` for an agent tool decision.
    pub async fn on_agent_action(&self, action: &AgentAction) {
        let run = Arc::new(self.run.clone());
        let action = Arc::new(action.clone());
        let (sync_run, sync_action) = (Arc::clone(&run), Arc::clone(&action));
        self.state
            .dispatch_async(
                "on_agent_action",
                EventGate::Agent,
                move |h| h.on_agent_action(&sync_run, &sync_action),
                |h| {
                    let run = Arc::clone(&run);
                    let action = Arc::clone(&action);
                    async move { h.on_agent_action(&run, &action).await }.boxed()
                },
            )
            .await;
    }

    /// Dispatch `on_agent_finish` when an agent loop completes.
    pub async fn on_agent_finish(&self, finish: &AgentFinish) {
        let run = Arc::new(self.run.clone());
        let finish = Arc::new(finish.clone());
        let (sync_run, sync_finish) = (Arc::clone(&run), Arc::clone(&finish));
        self.state
            .dispatch_async(
                "on_agent_finish",
                EventGate::Agent,
                move |h| h.on_agent_finish(&sync_run, &sync_finish),
                |h| {
                    let run = Arc::clone(&run);
                    let finish = Arc::clone(&finish);
                    async move { h.on_agent_finish(&run, &finish).await }.boxed()
                },
            )
            .await;
    }

    /// Finish the run with outputs. Consumes the manager.
    pub async fn on_chain_end(self, outputs: HashMap<String, serde_json::Value>) -> Run {
        let Self { state, run } = self;
        let outputs_value = serde_json::to_value(&outputs).unwrap_or(serde_json::Value::Null);
        let run = run.end(outputs_value);
        let shared = Arc::new(run.clone());
        let outputs = Arc::new(outputs);
        let (sync_run, sync_outputs) = (Arc::clone(&shared), Arc::clone(&outputs));
        state
            .dispatch_async(
                "on_chain_end",
                EventGate::Chain,
                move |h| h.on_chain_end(&sync_run, &sync_outputs),
                |h| {
                    let run = Arc::clone(&shared);
                    let outputs = Arc::clone(&outputs);
                    async move { h.on_chain_end(&run, &outputs).await }.boxed()
                },
            )
            .await;
        run
    }

    /// Fail the run with an error. Consumes the manager.
    pub async fn on_chain_error(self, error: &str) -> Run {
        let Self { state, run } = self;
        let run = run.fail(error);
        let shared = Arc::new(run.clone());
        let error: Arc<str> = Arc::from(error);
        let (sync_run, sync_error) = (Arc::clone(&shared), Arc::clone(&error));
        state
            .dispatch_async(
                "on_chain_error",
                EventGate::Chain,
                move |h| h.on_chain_error(&sync_run, &sync_error),
                |h| {
                    let run = Arc::clone(&shared);
                    let error = Arc::clone(&error);
                    async move { h.on_chain_error(&run, &error).await }.boxed()
                },
            )
            .await;
        run
    }
}

/// Async callback manager scoped to a tool run.
#[derive(Clone, Debug)]
pub struct AsyncCallbackManagerForToolRun {
    state: ManagerState,
    run: Run,
}

impl AsyncCallbackManagerForToolRun {
    async_scoped_common!(RunType::Tool);

    /// Finish the run with the tool output. Consumes the manager.
    pub async fn on_tool_end(self, output: &str) -> Run {
        let Self { state, run } = self;
        let run = run.end(serde_json::json!({ "output": output }));
        let shared = Arc::new(run.clone());
        let output: Arc<str> = Arc::from(output);
        let (sync_run, sync_output) = (Arc::clone(&shared), Arc::clone(&output));
        state
            .dispatch_async(
                "on_tool_end",
                EventGate::Agent,
                move |h| h.on_tool_end(&sync_run, &sync_output),
                |h| {
                    let run = Arc::clone(&shared);
                    let output = Arc::clone(&output);
                    async move { h.on_tool_end(&run, &output).await }.boxed()
                },
            )
            .await;
        run
    }

    /// Fail the run with an error. Consumes the manager.
    pub async fn on_tool_error(self, error: &str) -> Run {
        let Self { state, run } = self;
        let run = run.fail(error);
        let shared = Arc::new(run.clone());
        let error: Arc<str> = Arc::from(error);
        let (sync_run, sync_error) = (Arc::clone(&shared), Arc::clone(&error));
        state
            .dispatch_async(
                "on_tool_error",
                EventGate::Agent,
                move |h| h.on_tool_error(&sync_run, &sync_error),
                |h| {
                    let run = Arc::clone(&shared);
                    let error = Arc::clone(&error);
                    async move { h.on_tool_error(&run, &error).await }.boxed()
                },
            )
            .await;
        run
    }
}

/// Async callback manager scoped to a retriever run.
#[derive(Clone, Debug)]
pub struct AsyncCallbackManagerForRetrieverRun {
    state: ManagerState,
    run: Run,
}

impl AsyncCallbackManagerForRetrieverRun {
    async_scoped_common!(RunType::Retriever);

    /// Finish the run with the retrieved documents. Consumes the manager.
    pub async fn on_retriever_end(self, documents: Vec<serde_json::Value>) -> Run {
        let Self { state, run } = self;
        let run = run.end(serde_json::json!({ "documents": documents }));
        let shared = Arc::new(run.clone());
        let documents = Arc::new(documents);
        let (sync_run, sync_docs) = (Arc::clone(&shared), Arc::clone(&documents));
        state
            .dispatch_async(
                "on_retriever_end",
                EventGate::None,
                move |h| h.on_retriever_end(&sync_run, &sync_docs),
                |h| {
                    let run = Arc::clone(&shared);
                    let documents = Arc::clone(&documents);
                    async move { h.on_retriever_end(&run, &documents).await }.boxed()
                },
            )
            .await;
        run
    }

    /// Fail the run with an error. Consumes the manager.
    pub async fn on_retriever_error(self, error: &str) -> Run {
        let Self { state, run } = self;
        let run = run.fail(error);
        let shared = Arc::new(run.clone());
        let error: Arc<str> = Arc::from(error);
        let (sync_run, sync_error) = (Arc::clone(&shared), Arc::clone(&error));
        state
            .dispatch_async(
                "on_retriever_error",
                EventGate::None,
                move |h| h.on_retriever_error(&sync_run, &sync_error),
                |h| {
                    let run = Arc::clone(&shared);
                    let error = Arc::clone(&error);
                    async move { h.on_retriever_error(&run, &error).await }.boxed()
                },
            )
            .await;
        run
    }
}

/// Async callback manager scoped to an embedding run.
#[derive(Clone, Debug)]
pub struct AsyncCallbackManagerForEmbeddingRun {
    state: ManagerState,
    run: Run,
}

impl AsyncCallbackManagerForEmbeddingRun {
    async_scoped_common!(RunType::Embedding);

    /// Finish the run with the generated embeddings. Consumes the manager.
    pub async fn on_embedding_end(self, embeddings: Vec<Vec<f32>>) -> Run {
        let Self { state, run } = self;
        let outputs = serde_json::json!({
            "embedding_count": embeddings.len(),
            "dimensions": embeddings.first().map_or(0, Vec::len),
        });
        let run = run.end(outputs);
        let shared = Arc::new(run.clone());
        let embeddings = Arc::new(embeddings);
        let (sync_run, sync_embeddings) = (Arc::clone(&shared), Arc::clone(&embeddings));
        state
            .dispatch_async(
                "on_embedding_end",
                EventGate::None,
                move |h| h.on_embedding_end(&sync_run, &sync_embeddings),
                |h| {
                    let run = Arc::clone(&shared);
                    let embeddings = Arc::clone(&embeddings);
                    async move { h.on_embedding_end(&run, &embeddings).await }.boxed()
                },
            )
            .await;
        run
    }

    /// Fail the run with an error. Consumes the manager.
    pub async fn on_embedding_error(self, error: &str) -> Run {
        let Self { state, run } = self;
        let run = run.fail(error);
        let shared = Arc::new(run.clone());
        let error: Arc<str> = Arc::from(error);
        let (sync_run, sync_error) = (Arc::clone(&shared), Arc::clone(&error));
        state
            .dispatch_async(
                "on_embedding_error",
                EventGate::None,
                move |h| h.on_embedding_error(&sync_run, &sync_error),
                |h| {
                    let run = Arc::clone(&shared);
                    let error = Arc::clone(&error);
                    async move { h.on_embedding_error(&run, &error).await }.boxed()
                },
            )
            .await;
        run
    }
}
