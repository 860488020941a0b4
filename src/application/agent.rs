use crate::application::memory::ThreadStore;
use crate::application::tooling::{INCORRECT_TOOL_NAME_MESSAGE, ToolKind, ToolRegistry};
use crate::domain::types::{ChatMessage, MessageRole, ToolCallRequest};
use crate::infrastructure::model::{ModelError, ModelProvider, ModelRequest};
use futures::future;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Prepended to every model invocation; never persisted to thread history.
pub const SYSTEM_INSTRUCTION: &str = "\
You are an assistant that answers questions strictly from retrieved sources.

1. Analyze the question to pick a retrieval strategy. Use search_documents for broad, \
semantic, or keyword-based questions; use fetch_graph_facts for specific questions about \
entities and their relationships. You may call both.
2. Call the tools you need with appropriate arguments before answering.
3. Synthesize the answer only from the information the tools return.
4. If the tools return nothing relevant, state that you could not find an answer in the \
indexed documents, and do not add any information of your own.";

/// Returned as the final answer when the step cap trips while the model still
/// wants tools.
const STEP_BUDGET_EXHAUSTED_MESSAGE: &str = "I could not finish answering within the allowed \
number of tool interactions. Please narrow the question and try again.";

const DEFAULT_MAX_STEPS: usize = 8;

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub model: String,
    /// Upper bound on Deciding/Acting cycles per turn; without one a
    /// confused model can loop forever.
    pub max_steps: usize,
}

impl AgentConfig {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            max_steps: DEFAULT_MAX_STEPS,
        }
    }

    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps;
        self
    }
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Model(#[from] ModelError),
}

/// Result of one turn: the final answer plus the tool messages generated
/// after the submitted user message, for display by outward callers.
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub thread_id: String,
    pub answer: String,
    pub tool_messages: Vec<ChatMessage>,
}

pub struct Agent {
    provider: Arc<dyn ModelProvider>,
    registry: Arc<ToolRegistry>,
    store: Arc<dyn ThreadStore>,
    config: AgentConfig,
}

impl Agent {
    pub fn new(
        provider: Arc<dyn ModelProvider>,
        registry: Arc<ToolRegistry>,
        store: Arc<dyn ThreadStore>,
        config: AgentConfig,
    ) -> Self {
        Self {
            provider,
            registry,
            store,
            config,
        }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// Drives one full Deciding/Acting cycle to completion: model invocation,
    /// tool execution, loop, terminate on an assistant message without tool
    /// calls. The whole turn is appended to the store atomically at the end;
    /// a model failure mid-turn leaves prior history untouched.
    pub async fn run_turn(
        &self,
        thread_id: &str,
        user_text: String,
    ) -> Result<TurnOutcome, AgentError> {
        let _turn = self.store.turn_lock(thread_id).await;
        info!(thread_id, "Turn started");

        let prior = self.store.load(thread_id).await;
        debug!(
            thread_id,
            history_count = prior.len(),
            "Loaded prior thread history"
        );

        let mut turn_messages = vec![ChatMessage::user(user_text)];
        let mut remaining_steps = self.config.max_steps;

        let answer = loop {
            let assistant = self.invoke_model(&prior, &turn_messages).await?;

            if !assistant.has_tool_calls() {
                let answer = assistant.content.clone();
                turn_messages.push(assistant);
                info!(thread_id, "Model produced final answer");
                break answer;
            }

            if remaining_steps == 0 {
                warn!(
                    thread_id,
                    max_steps = self.config.max_steps,
                    "Step budget exhausted while model still requests tools; forcing stop"
                );
                turn_messages.push(ChatMessage::assistant(STEP_BUDGET_EXHAUSTED_MESSAGE));
                break STEP_BUDGET_EXHAUSTED_MESSAGE.to_string();
            }
            remaining_steps -= 1;

            let calls = assistant.tool_calls.clone();
            turn_messages.push(assistant);
            let results = self.execute_tool_calls(&calls).await;
            turn_messages.extend(results);
            debug!(thread_id, remaining_steps, "Tool execution complete; back to the model");
        };

        let tool_messages: Vec<ChatMessage> = turn_messages
            .iter()
            .filter(|message| message.role == MessageRole::Tool)
            .cloned()
            .collect();

        let history = self.store.append(thread_id, turn_messages).await;
        info!(
            thread_id,
            total_messages = history.len(),
            tool_messages = tool_messages.len(),
            "Turn finished"
        );

        Ok(TurnOutcome {
            thread_id: thread_id.to_string(),
            answer,
            tool_messages,
        })
    }

    async fn invoke_model(
        &self,
        prior: &[ChatMessage],
        turn_messages: &[ChatMessage],
    ) -> Result<ChatMessage, AgentError> {
        let mut messages = Vec::with_capacity(prior.len() + turn_messages.len() + 1);
        messages.push(ChatMessage::system(SYSTEM_INSTRUCTION));
        messages.extend_from_slice(prior);
        messages.extend_from_slice(turn_messages);

        let assistant = self
            .provider
            .generate(ModelRequest {
                model: self.config.model.clone(),
                messages,
                tools: self.registry.descriptors(),
            })
            .await?;
        Ok(assistant)
    }

    /// The Acting state: every requested call runs, and each produces exactly
    /// one tool message. Calls execute concurrently but results come back in
    /// request order, so the persisted log is deterministic.
    async fn execute_tool_calls(&self, calls: &[ToolCallRequest]) -> Vec<ChatMessage> {
        future::join_all(calls.iter().map(|call| self.execute_one(call))).await
    }

    async fn execute_one(&self, call: &ToolCallRequest) -> ChatMessage {
        let query = call.query();
        info!(
            tool = call.name.as_str(),
            query = truncate(query, 80),
            "Executing tool call"
        );

        let content = match ToolKind::parse(&call.name) {
            None => {
                warn!(requested_tool = call.name.as_str(), "Unknown tool requested");
                INCORRECT_TOOL_NAME_MESSAGE.to_string()
            }
            Some(kind) => match self.registry.dispatch(kind, query, &call.arguments).await {
                Ok(value) => value.to_string(),
                Err(error) => {
                    // Captured instead of propagated so the model can recover
                    // on the next step.
                    warn!(tool = call.name.as_str(), %error, "Tool execution failed");
                    format!("Tool execution failed: {error}")
                }
            },
        };

        info!(
            tool = call.name.as_str(),
            result_bytes = content.len(),
            "Tool call finished"
        );
        ChatMessage::tool(call.id.clone(), call.name.clone(), content)
    }
}

fn truncate(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((index, _)) => &text[..index],
        None => text,
    }
}
