//! # Runflow
//!
//! Callback dispatch and hierarchical run tracking for LLM orchestration.
//!
//! ## Overview
//!
//! - [`CallbackManager`] / [`AsyncCallbackManager`] - Fan lifecycle events out
//!   to registered handlers and scope nested work into a run forest
//! - [`CallbackHandler`] / [`AsyncCallbackHandler`] - The sink interfaces, all
//!   methods defaulting to no-ops
//! - [`Run`] - One traced unit of work: an LLM call, chain, tool call,
//!   retrieval, or embedding request
//! - [`CallbackConfig`] - Merges inline and inherited callbacks at component
//!   boundaries
//! - [`tracers`] - Handlers that persist finished runs instead of reacting to
//!   individual events
//!
//! Handler failures and panics are contained per handler: the instrumented
//! computation and the remaining handlers are never affected by one
//! misbehaving observer.
//!
//! ## Example
//!
//! ```rust,no_run
//! use runflow::{CallbackManager, Handler, LlmResult};
//! use runflow::tracers::RunCollectorCallbackHandler;
//! use serde_json::json;
//!
//! let collector = RunCollectorCallbackHandler::new();
//! let manager = CallbackManager::with_handlers(vec![Handler::sync(collector.clone())]);
//!
//! let scoped = manager.on_llm_start(json!({"name": "model"}), vec!["hello".into()]);
//! scoped.on_llm_new_token("hi");
//! scoped.on_llm_end(LlmResult::from_generations(vec!["hi there".into()]));
//!
//! assert_eq!(collector.len(), 1);
//! ```

mod async_manager;
mod config;
mod error;
mod events;
mod handler;
mod handlers;
mod manager;
mod run;
pub mod tracers;

pub use async_manager::{
    AsyncCallbackManager, AsyncCallbackManagerForChainRun, AsyncCallbackManagerForEmbeddingRun,
    AsyncCallbackManagerForLlmRun, AsyncCallbackManagerForRetrieverRun,
    AsyncCallbackManagerForToolRun,
};
pub use config::{CallbackConfig, Callbacks};
pub use error::{Error, Result};
pub use events::{AgentAction, AgentFinish, LlmResult, TokenUsage};
pub use handler::{AsyncCallbackHandler, CallbackHandler, Handler, NullCallbackHandler};
pub use handlers::{ConsoleCallbackHandler, FileCallbackHandler};
pub use manager::{
    CallbackManager, CallbackManagerForChainRun, CallbackManagerForEmbeddingRun,
    CallbackManagerForLlmRun, CallbackManagerForRetrieverRun, CallbackManagerForToolRun,
};
pub use run::{Run, RunType};

#[cfg(test)]
pub(crate) mod test_prelude {
    pub(crate) use std::collections::HashMap;
    pub(crate) use std::sync::atomic::{AtomicUsize, Ordering};
    pub(crate) use std::sync::{Arc, Mutex};

    pub(crate) use serde_json::{json, Value};
    pub(crate) use uuid::Uuid;

    pub(crate) use crate::error::Result;
    pub(crate) use crate::events::LlmResult;
    pub(crate) use crate::handler::{AsyncCallbackHandler, CallbackHandler, Handler};
    pub(crate) use crate::run::{Run, RunType};
}
