//! Typed payloads carried by callback events

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Token consumption reported with an LLM result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// Result of an LLM or chat-model run, delivered with `on_llm_end`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LlmResult {
    /// Rendered output strings, one per generation
    pub generations: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_usage: Option<TokenUsage>,
}

impl LlmResult {
    /// Build a result from generations alone.
    #[must_use]
    pub fn from_generations(generations: Vec<String>) -> Self {
        Self {
            generations,
            ..Self::default()
        }
    }
}

/// A tool invocation decided by an agent, delivered with `on_agent_action`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentAction {
    /// Name of the tool the agent chose
    pub tool: String,
    /// Input handed to the tool
    pub tool_input: String,
    /// Raw reasoning text that produced the action
    pub log: String,
}

/// Final agent output, delivered with `on_agent_finish`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentFinish {
    /// Values the agent returns to its caller
    pub return_values: HashMap<String, serde_json::Value>,
    /// Raw reasoning text that produced the finish
    pub log: String,
}
