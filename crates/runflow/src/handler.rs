//! Handler capability interface
//!
//! Event sinks implement either [`CallbackHandler`] (synchronous methods) or
//! [`AsyncCallbackHandler`] (asynchronous methods). Every method has a no-op
//! default, so a handler overrides only the events it cares about. The
//! [`Handler`] enum is the registration type the managers dispatch over; the
//! variant tells the dispatcher statically whether a handler needs an await
//! or a worker-thread offload, with no runtime introspection.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::events::{AgentAction, AgentFinish, LlmResult};
use crate::run::Run;

/// Synchronous callback handler.
///
/// All event methods receive the [`Run`] they belong to (run ID, parent run
/// ID, tags, metadata, and execution order ride along on every call) plus
/// the stage-specific payload. Returning an error never aborts dispatch to
/// sibling handlers; the manager logs it and continues.
pub trait CallbackHandler: Send + Sync {
    /// Whether to skip LLM and chat-model events for this handler.
    fn ignore_llm(&self) -> bool {
        false
    }

    /// Whether to skip chain events for this handler.
    fn ignore_chain(&self) -> bool {
        false
    }

    /// Whether to skip tool and agent events for this handler.
    fn ignore_agent(&self) -> bool {
        false
    }

    /// Whether this handler fires even when the manager is not verbose.
    fn always_verbose(&self) -> bool {
        false
    }

    /// Called when an LLM starts running.
    fn on_llm_start(&self, run: &Run, prompts: &[String]) -> Result<()> {
        let _ = (run, prompts);
        Ok(())
    }

    /// Called when a chat model starts running.
    fn on_chat_model_start(&self, run: &Run, messages: &serde_json::Value) -> Result<()> {
        // Default: fall back to on_llm_start with no prompts
        let _ = messages;
        self.on_llm_start(run, &[])
    }

    /// Called when an LLM generates a new token (streaming).
    fn on_llm_new_token(&self, run: &Run, token: &str) -> Result<()> {
        let _ = (run, token);
        Ok(())
    }

    /// Called when an LLM ends running.
    fn on_llm_end(&self, run: &Run, result: &LlmResult) -> Result<()> {
        let _ = (run, result);
        Ok(())
    }

    /// Called when an LLM errors.
    fn on_llm_error(&self, run: &Run, error: &str) -> Result<()> {
        let _ = (run, error);
        Ok(())
    }

    /// Called when a chain starts running.
    fn on_chain_start(&self, run: &Run, inputs: &HashMap<String, serde_json::Value>) -> Result<()> {
        let _ = (run, inputs);
        Ok(())
    }

    /// Called when a chain ends running.
    fn on_chain_end(&self, run: &Run, outputs: &HashMap<String, serde_json::Value>) -> Result<()> {
        let _ = (run, outputs);
        Ok(())
    }

    /// Called when a chain errors.
    fn on_chain_error(&self, run: &Run, error: &str) -> Result<()> {
        let _ = (run, error);
        Ok(())
    }

    /// Called when a tool starts running.
    fn on_tool_start(&self, run: &Run, input_str: &str) -> Result<()> {
        let _ = (run, input_str);
        Ok(())
    }

    /// Called when a tool ends running.
    fn on_tool_end(&self, run: &Run, output: &str) -> Result<()> {
        let _ = (run, output);
        Ok(())
    }

    /// Called when a tool errors.
    fn on_tool_error(&self, run: &Run, error: &str) -> Result<()> {
        let _ = (run, error);
        Ok(())
    }

    /// Called when a retriever starts running.
    fn on_retriever_start(&self, run: &Run, query: &str) -> Result<()> {
        let _ = (run, query);
        Ok(())
    }

    /// Called when a retriever ends running.
    fn on_retriever_end(&self, run: &Run, documents: &[serde_json::Value]) -> Result<()> {
        let _ = (run, documents);
        Ok(())
    }

    /// Called when a retriever errors.
    fn on_retriever_error(&self, run: &Run, error: &str) -> Result<()> {
        let _ = (run, error);
        Ok(())
    }

    /// Called when embedding generation starts.
    fn on_embedding_start(&self, run: &Run, texts: &[String]) -> Result<()> {
        let _ = (run, texts);
        Ok(())
    }

    /// Called when embedding generation ends.
    fn on_embedding_end(&self, run: &Run, embeddings: &[Vec<f32>]) -> Result<()> {
        let _ = (run, embeddings);
        Ok(())
    }

    /// Called when embedding generation errors.
    fn on_embedding_error(&self, run: &Run, error: &str) -> Result<()> {
        let _ = (run, error);
        Ok(())
    }

    /// Called when an agent decides on a tool invocation.
    fn on_agent_action(&self, run: &Run, action: &AgentAction) -> Result<()> {
        let _ = (run, action);
        Ok(())
    }

    /// Called when an agent finishes.
    fn on_agent_finish(&self, run: &Run, finish: &AgentFinish) -> Result<()> {
        let _ = (run, finish);
        Ok(())
    }

    /// Called on arbitrary narration text. Never gated by an ignore flag.
    fn on_text(&self, run: &Run, text: &str) -> Result<()> {
        let _ = (run, text);
        Ok(())
    }
}

/// Asynchronous callback handler.
///
/// Same contract as [`CallbackHandler`] with async methods. The async manager
/// awaits these directly; the sync manager drives them to completion on the
/// calling thread.
#[async_trait]
pub trait AsyncCallbackHandler: Send + Sync {
    /// Whether to skip LLM and chat-model events for this handler.
    fn ignore_llm(&self) -> bool {
        false
    }

    /// Whether to skip chain events for this handler.
    fn ignore_chain(&self) -> bool {
        false
    }

    /// Whether to skip tool and agent events for this handler.
    fn ignore_agent(&self) -> bool {
        false
    }

    /// Whether this handler fires even when the manager is not verbose.
    fn always_verbose(&self) -> bool {
        false
    }

    /// Called when an LLM starts running.
    async fn on_llm_start(&self, run: &Run, prompts: &[String]) -> Result<()> {
        let _ = (run, prompts);
        Ok(())
    }

    /// Called when a chat model starts running.
    async fn on_chat_model_start(&self, run: &Run, messages: &serde_json::Value) -> Result<()> {
        let _ = messages;
        self.on_llm_start(run, &[]).await
    }

    /// Called when an LLM generates a new token (streaming).
    async fn on_llm_new_token(&self, run: &Run, token: &str) -> Result<()> {
        let _ = (run, token);
        Ok(())
    }

    /// Called when an LLM ends running.
    async fn on_llm_end(&self, run: &Run, result: &LlmResult) -> Result<()> {
        let _ = (run, result);
        Ok(())
    }

    /// Called when an LLM errors.
    async fn on_llm_error(&self, run: &Run, error: &str) -> Result<()> {
        let _ = (run, error);
        Ok(())
    }

    /// Called when a chain starts running.
    async fn on_chain_start(
        &self,
        run: &Run,
        inputs: &HashMap<String, serde_json::Value>,
    ) -> Result<()> {
        let _ = (run, inputs);
        Ok(())
    }

    /// Called when a chain ends running.
    async fn on_chain_end(
        &self,
        run: &Run,
        outputs: &HashMap<String, serde_json::Value>,
    ) -> Result<()> {
        let _ = (run, outputs);
        Ok(())
    }

    /// Called when a chain errors.
    async fn on_chain_error(&self, run: &Run, error: &str) -> Result<()> {
        let _ = (run, error);
        Ok(())
    }

    /// Called when a tool starts running.
    async fn on_tool_start(&self, run: &Run, input_str: &str) -> Result<()> {
        let _ = (run, input_str);
        Ok(())
    }

    /// Called when a tool ends running.
    async fn on_tool_end(&self, run: &Run, output: &str) -> Result<()> {
        let _ = (run, output);
        Ok(())
    }

    /// Called when a tool errors.
    async fn on_tool_error(&self, run: &Run, error: &str) -> Result<()> {
        let _ = (run, error);
        Ok(())
    }

    /// Called when a retriever starts running.
    async fn on_retriever_start(&self, run: &Run, query: &str) -> Result<()> {
        let _ = (run, query);
        Ok(())
    }

    /// Called when a retriever ends running.
    async fn on_retriever_end(&self, run: &Run, documents: &[serde_json::Value]) -> Result<()> {
        let _ = (run, documents);
        Ok(())
    }

    /// Called when a retriever errors.
    async fn on_retriever_error(&self, run: &Run, error: &str) -> Result<()> {
        let _ = (run, error);
        Ok(())
    }

    /// Called when embedding generation starts.
    async fn on_embedding_start(&self, run: &Run, texts: &[String]) -> Result<()> {
        let _ = (run, texts);
        Ok(())
    }

    /// Called when embedding generation ends.
    async fn on_embedding_end(&self, run: &Run, embeddings: &[Vec<f32>]) -> Result<()> {
        let _ = (run, embeddings);
        Ok(())
    }

    /// Called when embedding generation errors.
    async fn on_embedding_error(&self, run: &Run, error: &str) -> Result<()> {
        let _ = (run, error);
        Ok(())
    }

    /// Called when an agent decides on a tool invocation.
    async fn on_agent_action(&self, run: &Run, action: &AgentAction) -> Result<()> {
        let _ = (run, action);
        Ok(())
    }

    /// Called when an agent finishes.
    async fn on_agent_finish(&self, run: &Run, finish: &AgentFinish) -> Result<()> {
        let _ = (run, finish);
        Ok(())
    }

    /// Called on arbitrary narration text. Never gated by an ignore flag.
    async fn on_text(&self, run: &Run, text: &str) -> Result<()> {
        let _ = (run, text);
        Ok(())
    }
}

/// A registered handler: either a synchronous or an asynchronous
/// implementation.
///
/// The variant is the static capability flag the dispatchers branch on.
/// Handlers are shared by reference; cloning a `Handler` (or the manager
/// holding it) clones the `Arc`, not the handler.
#[derive(Clone)]
pub enum Handler {
    /// Handler with synchronous event methods
    Sync(Arc<dyn CallbackHandler>),
    /// Handler with asynchronous event methods
    Async(Arc<dyn AsyncCallbackHandler>),
}

impl Handler {
    /// Register a synchronous handler.
    #[must_use]
    pub fn sync<H: CallbackHandler + 'static>(handler: H) -> Self {
        Self::Sync(Arc::new(handler))
    }

    /// Register an asynchronous handler.
    #[must_use]
    pub fn asynchronous<H: AsyncCallbackHandler + 'static>(handler: H) -> Self {
        Self::Async(Arc::new(handler))
    }

    /// Whether LLM and chat-model events are skipped.
    #[must_use]
    pub fn ignore_llm(&self) -> bool {
        match self {
            Self::Sync(h) => h.ignore_llm(),
            Self::Async(h) => h.ignore_llm(),
        }
    }

    /// Whether chain events are skipped.
    #[must_use]
    pub fn ignore_chain(&self) -> bool {
        match self {
            Self::Sync(h) => h.ignore_chain(),
            Self::Async(h) => h.ignore_chain(),
        }
    }

    /// Whether tool and agent events are skipped.
    #[must_use]
    pub fn ignore_agent(&self) -> bool {
        match self {
            Self::Sync(h) => h.ignore_agent(),
            Self::Async(h) => h.ignore_agent(),
        }
    }

    /// Whether the handler fires regardless of manager verbosity.
    #[must_use]
    pub fn always_verbose(&self) -> bool {
        match self {
            Self::Sync(h) => h.always_verbose(),
            Self::Async(h) => h.always_verbose(),
        }
    }

    /// Whether both registrations point at the same handler instance.
    #[must_use]
    pub fn same_handler(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Sync(a), Self::Sync(b)) => {
                std::ptr::eq(Arc::as_ptr(a).cast::<()>(), Arc::as_ptr(b).cast::<()>())
            }
            (Self::Async(a), Self::Async(b)) => {
                std::ptr::eq(Arc::as_ptr(a).cast::<()>(), Arc::as_ptr(b).cast::<()>())
            }
            _ => false,
        }
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sync(_) => f.write_str("Handler::Sync"),
            Self::Async(_) => f.write_str("Handler::Async"),
        }
    }
}

impl From<Arc<dyn CallbackHandler>> for Handler {
    fn from(handler: Arc<dyn CallbackHandler>) -> Self {
        Self::Sync(handler)
    }
}

impl From<Arc<dyn AsyncCallbackHandler>> for Handler {
    fn from(handler: Arc<dyn AsyncCallbackHandler>) -> Self {
        Self::Async(handler)
    }
}

/// Null callback handler that does nothing.
///
/// Useful for disabling callbacks without removing callback support.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullCallbackHandler;

impl CallbackHandler for NullCallbackHandler {
    // All methods use default implementations (no-ops)
}

#[async_trait]
impl AsyncCallbackHandler for NullCallbackHandler {
    // All methods use default implementations (no-ops)
}
