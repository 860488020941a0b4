use crate::application::agent::{Agent, AgentError};
use crate::application::tooling::ToolDescriptor;
use crate::domain::types::ChatMessage;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::io;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::{error, info};
use utoipa::{OpenApi, ToSchema};
use utoipa_swagger_ui::SwaggerUi;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("server terminated: {0}")]
    Serve(#[source] io::Error),
}

#[derive(OpenApi)]
#[openapi(
    paths(ask, list_tools),
    components(schemas(AskRequest, AskResponse, ToolResult, ToolDescriptor, ErrorResponse)),
    info(
        title = "ragent",
        description = "Question answering over indexed documents and a knowledge graph"
    )
)]
struct ApiDoc;

#[derive(Clone)]
struct AppState {
    agent: Arc<Agent>,
}

pub fn router(agent: Arc<Agent>) -> Router {
    Router::new()
        .merge(SwaggerUi::new("/docs").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .route("/ask", post(ask))
        .route("/tools", get(list_tools))
        .layer(CorsLayer::permissive())
        .with_state(AppState { agent })
}

pub async fn serve(agent: Arc<Agent>, addr: &str) -> Result<(), ServerError> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| ServerError::Bind {
            addr: addr.to_string(),
            source,
        })?;
    info!(addr, "REST server listening");
    axum::serve(listener, router(agent))
        .await
        .map_err(ServerError::Serve)
}

#[derive(Debug, Deserialize, ToSchema)]
struct AskRequest {
    /// The question to answer.
    query: String,
    /// Conversation thread to continue; omitted starts a fresh thread.
    thread_id: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
struct AskResponse {
    thread_id: String,
    answer: String,
    /// Raw tool outputs produced while answering, in execution order.
    tool_results: Vec<ToolResult>,
}

#[derive(Debug, Serialize, ToSchema)]
struct ToolResult {
    name: String,
    content: String,
}

impl From<&ChatMessage> for ToolResult {
    fn from(message: &ChatMessage) -> Self {
        Self {
            name: message
                .tool_name
                .clone()
                .unwrap_or_else(|| "unknown_tool".to_string()),
            content: message.content.clone(),
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
struct ErrorResponse {
    error: String,
}

impl ErrorResponse {
    fn with_status(status: StatusCode, error: impl Into<String>) -> Response {
        (status, Json(Self { error: error.into() })).into_response()
    }
}

/// Ask a question, continuing the given thread's conversation.
#[utoipa::path(
    post,
    path = "/ask",
    request_body = AskRequest,
    responses(
        (status = 200, description = "Final answer with supporting tool output", body = AskResponse),
        (status = 400, description = "Empty query", body = ErrorResponse),
        (status = 502, description = "Model provider failure", body = ErrorResponse),
    )
)]
async fn ask(State(state): State<AppState>, Json(request): Json<AskRequest>) -> Response {
    if request.query.trim().is_empty() {
        return ErrorResponse::with_status(StatusCode::BAD_REQUEST, "query must not be empty");
    }
    let thread_id = request
        .thread_id
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    match state.agent.run_turn(&thread_id, request.query).await {
        Ok(outcome) => {
            let response = AskResponse {
                thread_id: outcome.thread_id,
                answer: outcome.answer,
                tool_results: outcome.tool_messages.iter().map(ToolResult::from).collect(),
            };
            (StatusCode::OK, Json(response)).into_response()
        }
        Err(AgentError::Model(source)) => {
            error!(thread_id, error = %source, "Turn aborted on model failure");
            ErrorResponse::with_status(StatusCode::BAD_GATEWAY, source.to_string())
        }
    }
}

/// List the tools the agent can call.
#[utoipa::path(
    get,
    path = "/tools",
    responses((status = 200, description = "Available tools", body = [ToolDescriptor]))
)]
async fn list_tools(State(state): State<AppState>) -> Json<Vec<ToolDescriptor>> {
    Json(state.agent.registry().descriptors())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::agent::AgentConfig;
    use crate::application::memory::InMemoryThreadStore;
    use crate::application::tooling::test_support::{StaticRetriever, registry_with};
    use crate::domain::types::ChatMessage;
    use crate::infrastructure::model::{ModelError, ModelProvider, ModelRequest};
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    struct FixedAnswerProvider;

    #[async_trait]
    impl ModelProvider for FixedAnswerProvider {
        async fn generate(&self, _request: ModelRequest) -> Result<ChatMessage, ModelError> {
            Ok(ChatMessage::assistant("Paris."))
        }
    }

    fn test_router() -> Router {
        let registry = registry_with(Arc::new(StaticRetriever::returning(Vec::new())), Vec::new());
        let agent = Agent::new(
            Arc::new(FixedAnswerProvider),
            Arc::new(registry),
            Arc::new(InMemoryThreadStore::new()),
            AgentConfig::new("test-model"),
        );
        router(Arc::new(agent))
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("read body");
        serde_json::from_slice(&bytes).expect("json body")
    }

    #[tokio::test]
    async fn ask_answers_and_assigns_thread_id() {
        let response = test_router()
            .oneshot(
                Request::post("/ask")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"query": "capital of France?"}"#))
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        assert_eq!(body["answer"], "Paris.");
        assert!(!body["thread_id"].as_str().expect("thread id").is_empty());
        assert!(body["tool_results"].as_array().expect("array").is_empty());
    }

    #[tokio::test]
    async fn ask_rejects_empty_query() {
        let response = test_router()
            .oneshot(
                Request::post("/ask")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"query": "  ", "thread_id": "t"}"#))
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn tools_lists_both_capabilities() {
        let response = test_router()
            .oneshot(Request::get("/tools").body(Body::empty()).expect("request"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        let names: Vec<&str> = body
            .as_array()
            .expect("array")
            .iter()
            .map(|tool| tool["name"].as_str().expect("name"))
            .collect();
        assert_eq!(names, vec!["search_documents", "fetch_graph_facts"]);
    }
}
