use crate::application::tooling::ToolDescriptor;
use crate::domain::types::{ChatMessage, MessageRole, ToolCallRequest};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct ModelRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolDescriptor>,
}

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("model provider returned invalid response: {0}")]
    InvalidResponse(String),
}

/// Single suspension point of the Deciding state: one call out to the hosted
/// model, returning exactly one assistant message. Retries, if any, live in
/// the transport, not here.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    async fn generate(&self, request: ModelRequest) -> Result<ChatMessage, ModelError>;
}

/// Client for OpenAI-compatible chat-completions endpoints with structured
/// tool calls (DeepInfra in the default configuration).
#[derive(Clone)]
pub struct OpenAiChatClient {
    http: Client,
    base_url: String,
    api_key: String,
    temperature: f32,
    max_tokens: u32,
}

impl OpenAiChatClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self::with_client(base_url, api_key, Client::new())
    }

    pub fn with_client(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        client: Client,
    ) -> Self {
        Self {
            http: client,
            base_url: base_url.into(),
            api_key: api_key.into(),
            temperature: 0.0,
            max_tokens: 1024,
        }
    }

    fn endpoint(&self, path: &str) -> String {
        let trimmed = self.base_url.trim_end_matches('/');
        let path = path.trim_start_matches('/');
        format!("{trimmed}/{path}")
    }
}

#[async_trait]
impl ModelProvider for OpenAiChatClient {
    async fn generate(&self, request: ModelRequest) -> Result<ChatMessage, ModelError> {
        let url = self.endpoint("/chat/completions");
        let payload = ChatCompletionRequest::build(&request, self.temperature, self.max_tokens);
        info!(
            model = request.model.as_str(),
            url = %url,
            messages = request.messages.len(),
            tools = request.tools.len(),
            "Sending request to model provider"
        );

        let response: ChatCompletionResponse = self
            .http
            .post(url)
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        debug!("Received response from model provider");

        let message = response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message)
            .ok_or_else(|| ModelError::InvalidResponse("missing message in choices".into()))?;

        Ok(message.into_chat_message())
    }
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<Value>>,
    temperature: f32,
    max_tokens: u32,
    stream: bool,
}

impl ChatCompletionRequest {
    fn build(request: &ModelRequest, temperature: f32, max_tokens: u32) -> Self {
        let tools = if request.tools.is_empty() {
            None
        } else {
            Some(
                request
                    .tools
                    .iter()
                    .map(|tool| {
                        json!({
                            "type": "function",
                            "function": {
                                "name": tool.name,
                                "description": tool.description,
                                "parameters": tool.parameters,
                            }
                        })
                    })
                    .collect(),
            )
        };
        Self {
            model: request.model.clone(),
            messages: request.messages.iter().map(WireMessage::from).collect(),
            tools,
            temperature,
            max_tokens,
            stream: false,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct WireMessage {
    role: String,
    #[serde(default)]
    content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<WireToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireToolCall {
    id: String,
    #[serde(rename = "type")]
    kind: String,
    function: WireFunction,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireFunction {
    name: String,
    /// The wire format carries arguments as a JSON-encoded string.
    arguments: String,
}

impl From<&ChatMessage> for WireMessage {
    fn from(message: &ChatMessage) -> Self {
        let tool_calls = if message.tool_calls.is_empty() {
            None
        } else {
            Some(
                message
                    .tool_calls
                    .iter()
                    .map(|call| WireToolCall {
                        id: call.id.clone(),
                        kind: "function".to_string(),
                        function: WireFunction {
                            name: call.name.clone(),
                            arguments: call.arguments.to_string(),
                        },
                    })
                    .collect(),
            )
        };
        Self {
            role: message.role.as_str().to_string(),
            content: Some(message.content.clone()),
            tool_calls,
            tool_call_id: message.tool_call_id.clone(),
            name: message.tool_name.clone(),
        }
    }
}

impl WireMessage {
    fn into_chat_message(self) -> ChatMessage {
        let tool_calls = self
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|call| {
                // Providers occasionally emit malformed argument strings;
                // an empty mapping lets query extraction degrade to "".
                let arguments =
                    serde_json::from_str(&call.function.arguments).unwrap_or_else(|_| json!({}));
                ToolCallRequest::new(call.id, call.function.name, arguments)
            })
            .collect();
        ChatMessage {
            role: MessageRole::Assistant,
            content: self.content.unwrap_or_default(),
            tool_calls,
            tool_call_id: None,
            tool_name: None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: Option<WireMessage>,
}
