//! Shared fixtures for callback integration tests.

// Not every test binary uses every fixture.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use runflow::{
    AgentAction, AgentFinish, AsyncCallbackHandler, CallbackHandler, LlmResult, Result, Run,
};
use serde_json::{json, Value};
use uuid::Uuid;

/// One observed event with the run context it arrived with.
#[derive(Debug, Clone)]
pub struct EventRecord {
    pub event: String,
    pub run_id: Uuid,
    pub parent_run_id: Option<Uuid>,
    pub execution_order: u32,
    pub payload: Value,
}

/// Handler that records every event it receives, with configurable flags.
///
/// Clones share the same record store. Implements both handler traits so the
/// same fixture exercises sync and async dispatch.
#[derive(Debug, Clone, Default)]
pub struct RecordingHandler {
    records: Arc<Mutex<Vec<EventRecord>>>,
    ignore_llm: bool,
    ignore_chain: bool,
    ignore_agent: bool,
    always_verbose: bool,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn always_verbose() -> Self {
        Self {
            always_verbose: true,
            ..Self::default()
        }
    }

    pub fn ignoring(ignore_llm: bool, ignore_chain: bool, ignore_agent: bool) -> Self {
        Self {
            ignore_llm,
            ignore_chain,
            ignore_agent,
            ..Self::default()
        }
    }

    fn record(&self, event: &str, run: &Run, payload: Value) {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(EventRecord {
                event: event.to_string(),
                run_id: run.id,
                parent_run_id: run.parent_run_id,
                execution_order: run.execution_order,
                payload,
            });
    }

    pub fn records(&self) -> Vec<EventRecord> {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn event_names(&self) -> Vec<String> {
        self.records().into_iter().map(|r| r.event).collect()
    }
}

impl CallbackHandler for RecordingHandler {
    fn ignore_llm(&self) -> bool {
        self.ignore_llm
    }

    fn ignore_chain(&self) -> bool {
        self.ignore_chain
    }

    fn ignore_agent(&self) -> bool {
        self.ignore_agent
    }

    fn always_verbose(&self) -> bool {
        self.always_verbose
    }

    fn on_llm_start(&self, run: &Run, prompts: &[String]) -> Result<()> {
        self.record("llm_start", run, json!({ "prompts": prompts }));
        Ok(())
    }

    fn on_chat_model_start(&self, run: &Run, messages: &Value) -> Result<()> {
        self.record("chat_model_start", run, json!({ "messages": messages }));
        Ok(())
    }

    fn on_llm_new_token(&self, run: &Run, token: &str) -> Result<()> {
        self.record("llm_new_token", run, json!({ "token": token }));
        Ok(())
    }

    fn on_llm_end(&self, run: &Run, result: &LlmResult) -> Result<()> {
        self.record(
            "llm_end",
            run,
            json!({ "generations": result.generations }),
        );
        Ok(())
    }

    fn on_llm_error(&self, run: &Run, error: &str) -> Result<()> {
        self.record("llm_error", run, json!({ "error": error }));
        Ok(())
    }

    fn on_chain_start(&self, run: &Run, inputs: &HashMap<String, Value>) -> Result<()> {
        self.record("chain_start", run, json!({ "inputs": inputs }));
        Ok(())
    }

    fn on_chain_end(&self, run: &Run, outputs: &HashMap<String, Value>) -> Result<()> {
        self.record("chain_end", run, json!({ "outputs": outputs }));
        Ok(())
    }

    fn on_chain_error(&self, run: &Run, error: &str) -> Result<()> {
        self.record("chain_error", run, json!({ "error": error }));
        Ok(())
    }

    fn on_tool_start(&self, run: &Run, input_str: &str) -> Result<()> {
        self.record("tool_start", run, json!({ "input": input_str }));
        Ok(())
    }

    fn on_tool_end(&self, run: &Run, output: &str) -> Result<()> {
        self.record("tool_end", run, json!({ "output": output }));
        Ok(())
    }

    fn on_tool_error(&self, run: &Run, error: &str) -> Result<()> {
        self.record("tool_error", run, json!({ "error": error }));
        Ok(())
    }

    fn on_retriever_start(&self, run: &Run, query: &str) -> Result<()> {
        self.record("retriever_start", run, json!({ "query": query }));
        Ok(())
    }

    fn on_retriever_end(&self, run: &Run, documents: &[Value]) -> Result<()> {
        self.record("retriever_end", run, json!({ "documents": documents }));
        Ok(())
    }

    fn on_embedding_start(&self, run: &Run, texts: &[String]) -> Result<()> {
        self.record("embedding_start", run, json!({ "texts": texts }));
        Ok(())
    }

    fn on_embedding_end(&self, run: &Run, embeddings: &[Vec<f32>]) -> Result<()> {
        self.record("embedding_end", run, json!({ "count": embeddings.len() }));
        Ok(())
    }

    fn on_agent_action(&self, run: &Run, action: &AgentAction) -> Result<()> {
        self.record("agent_action", run, json!({ "tool": action.tool }));
        Ok(())
    }

    fn on_agent_finish(&self, run: &Run, finish: &AgentFinish) -> Result<()> {
        self.record("agent_finish", run, json!({ "log": finish.log }));
        Ok(())
    }

    fn on_text(&self, run: &Run, text: &str) -> Result<()> {
        self.record("text", run, json!({ "text": text }));
        Ok(())
    }
}

#[async_trait]
impl AsyncCallbackHandler for RecordingHandler {
    async fn on_llm_start(&self, run: &Run, prompts: &[String]) -> Result<()> {
        self.record("llm_start", run, json!({ "prompts": prompts }));
        Ok(())
    }

    async fn on_llm_new_token(&self, run: &Run, token: &str) -> Result<()> {
        self.record("llm_new_token", run, json!({ "token": token }));
        Ok(())
    }

    async fn on_llm_end(&self, run: &Run, result: &LlmResult) -> Result<()> {
        self.record(
            "llm_end",
            run,
            json!({ "generations": result.generations }),
        );
        Ok(())
    }

    async fn on_chain_start(&self, run: &Run, inputs: &HashMap<String, Value>) -> Result<()> {
        self.record("chain_start", run, json!({ "inputs": inputs }));
        Ok(())
    }

    async fn on_chain_end(&self, run: &Run, outputs: &HashMap<String, Value>) -> Result<()> {
        self.record("chain_end", run, json!({ "outputs": outputs }));
        Ok(())
    }

    async fn on_tool_start(&self, run: &Run, input_str: &str) -> Result<()> {
        self.record("tool_start", run, json!({ "input": input_str }));
        Ok(())
    }

    async fn on_tool_end(&self, run: &Run, output: &str) -> Result<()> {
        self.record("tool_end", run, json!({ "output": output }));
        Ok(())
    }

    async fn on_text(&self, run: &Run, text: &str) -> Result<()> {
        self.record("text", run, json!({ "text": text }));
        Ok(())
    }
}
