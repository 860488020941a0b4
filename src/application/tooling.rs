use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Value, json};
use std::sync::Arc;
use thiserror::Error;
use utoipa::ToSchema;

/// Surfaced to the model verbatim when it asks for a tool that is not
/// registered, so it can self-correct on the next step.
pub const INCORRECT_TOOL_NAME_MESSAGE: &str =
    "Incorrect Tool Name. Please retry and select a tool from the list of available tools.";

/// Interpolation weight between sparse and dense retrieval: 0 = sparse only,
/// 1 = dense only.
pub const DEFAULT_ALPHA: f32 = 0.7;
/// Candidates fetched from the index before the re-rank stage truncates them.
pub const DEFAULT_RETRIEVE_TOP_K: usize = 5;
pub const DEFAULT_TOP_NODES: usize = 3;
pub const DEFAULT_MAX_FACTS: usize = 3;

/// The capability set is closed: both tools are wired at startup and the
/// model can only pick between them by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolKind {
    SearchDocuments,
    FetchGraphFacts,
}

impl ToolKind {
    pub const ALL: [ToolKind; 2] = [ToolKind::SearchDocuments, ToolKind::FetchGraphFacts];

    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "search_documents" => Some(ToolKind::SearchDocuments),
            "fetch_graph_facts" => Some(ToolKind::FetchGraphFacts),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ToolKind::SearchDocuments => "search_documents",
            ToolKind::FetchGraphFacts => "fetch_graph_facts",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            ToolKind::SearchDocuments => {
                "Hybrid dense+sparse search over the indexed documents, re-ranked for relevance. \
                 Use for broad, semantic, or keyword-based questions."
            }
            ToolKind::FetchGraphFacts => {
                "Look up facts in the knowledge graph. Use for specific questions about entities \
                 and their relationships."
            }
        }
    }

    fn input_schema(self) -> Value {
        let mut properties = json!({
            "query": { "type": "string", "description": "Free-text query to run the tool with." }
        });
        match self {
            ToolKind::SearchDocuments => {
                properties["alpha"] = json!({
                    "type": "number",
                    "description": "Weight between sparse (0) and dense (1) retrieval."
                });
                properties["top_k"] = json!({
                    "type": "integer",
                    "description": "Candidates to fetch before re-ranking."
                });
            }
            ToolKind::FetchGraphFacts => {
                properties["top_nodes"] = json!({
                    "type": "integer",
                    "description": "Maximum candidate graph nodes to consider."
                });
                properties["max_facts"] = json!({
                    "type": "integer",
                    "description": "Maximum facts to return."
                });
            }
        }
        json!({
            "type": "object",
            "properties": properties,
            "required": ["query"]
        })
    }
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    #[schema(value_type = Object)]
    pub parameters: Value,
}

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("tool returned invalid response: {0}")]
    InvalidResponse(String),
    #[error("tool backend error: {0}")]
    Backend(String),
}

/// One ordered retrieval result: relevance score plus the chunk text.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrievedChunk {
    pub score: Option<f32>,
    pub content: String,
}

/// One fact row from the knowledge graph. Subject-only rows (isolated nodes)
/// leave relation and object null.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GraphFact {
    pub subject: Option<String>,
    pub relation: Option<String>,
    pub object: Option<String>,
    pub source: Option<String>,
    pub score: Option<f64>,
}

#[async_trait]
pub trait DocumentRetriever: Send + Sync {
    async fn retrieve(
        &self,
        query: &str,
        alpha: f32,
        top_k: usize,
    ) -> Result<Vec<RetrievedChunk>, ToolError>;
}

#[async_trait]
pub trait FactFetcher: Send + Sync {
    async fn fetch_facts(
        &self,
        query: &str,
        top_nodes: usize,
        max_facts: usize,
    ) -> Result<Vec<GraphFact>, ToolError>;
}

/// Process-wide capability table, read-only after construction.
pub struct ToolRegistry {
    retriever: Arc<dyn DocumentRetriever>,
    facts: Arc<dyn FactFetcher>,
}

impl ToolRegistry {
    pub fn new(retriever: Arc<dyn DocumentRetriever>, facts: Arc<dyn FactFetcher>) -> Self {
        Self { retriever, facts }
    }

    pub fn has(&self, name: &str) -> bool {
        ToolKind::parse(name).is_some()
    }

    pub fn descriptors(&self) -> Vec<ToolDescriptor> {
        ToolKind::ALL
            .iter()
            .map(|kind| ToolDescriptor {
                name: kind.name().to_string(),
                description: kind.description().to_string(),
                parameters: kind.input_schema(),
            })
            .collect()
    }

    /// Runs one capability. Numeric arguments beyond `query` fall back to the
    /// documented defaults when absent or malformed.
    pub async fn dispatch(
        &self,
        kind: ToolKind,
        query: &str,
        args: &Value,
    ) -> Result<Value, ToolError> {
        match kind {
            ToolKind::SearchDocuments => {
                let alpha = args
                    .get("alpha")
                    .and_then(Value::as_f64)
                    .map(|v| v as f32)
                    .unwrap_or(DEFAULT_ALPHA);
                let top_k = args
                    .get("top_k")
                    .and_then(Value::as_u64)
                    .map(|v| v as usize)
                    .unwrap_or(DEFAULT_RETRIEVE_TOP_K);
                let chunks = self.retriever.retrieve(query, alpha, top_k).await?;
                serde_json::to_value(chunks)
                    .map_err(|err| ToolError::InvalidResponse(err.to_string()))
            }
            ToolKind::FetchGraphFacts => {
                let top_nodes = args
                    .get("top_nodes")
                    .and_then(Value::as_u64)
                    .map(|v| v as usize)
                    .unwrap_or(DEFAULT_TOP_NODES);
                let max_facts = args
                    .get("max_facts")
                    .and_then(Value::as_u64)
                    .map(|v| v as usize)
                    .unwrap_or(DEFAULT_MAX_FACTS);
                let facts = self.facts.fetch_facts(query, top_nodes, max_facts).await?;
                serde_json::to_value(facts)
                    .map_err(|err| ToolError::InvalidResponse(err.to_string()))
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use tokio::sync::Mutex;

    /// Retriever double that records queries and replays a fixed outcome.
    pub struct StaticRetriever {
        pub chunks: Vec<RetrievedChunk>,
        pub fail_with: Option<String>,
        pub queries: Mutex<Vec<(String, f32, usize)>>,
    }

    impl StaticRetriever {
        pub fn returning(chunks: Vec<RetrievedChunk>) -> Self {
            Self {
                chunks,
                fail_with: None,
                queries: Mutex::new(Vec::new()),
            }
        }

        pub fn failing(message: impl Into<String>) -> Self {
            Self {
                chunks: Vec::new(),
                fail_with: Some(message.into()),
                queries: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl DocumentRetriever for StaticRetriever {
        async fn retrieve(
            &self,
            query: &str,
            alpha: f32,
            top_k: usize,
        ) -> Result<Vec<RetrievedChunk>, ToolError> {
            self.queries
                .lock()
                .await
                .push((query.to_string(), alpha, top_k));
            match &self.fail_with {
                Some(message) => Err(ToolError::Backend(message.clone())),
                None => Ok(self.chunks.clone()),
            }
        }
    }

    pub struct StaticFactFetcher {
        pub facts: Vec<GraphFact>,
    }

    #[async_trait]
    impl FactFetcher for StaticFactFetcher {
        async fn fetch_facts(
            &self,
            _query: &str,
            _top_nodes: usize,
            max_facts: usize,
        ) -> Result<Vec<GraphFact>, ToolError> {
            Ok(self.facts.iter().take(max_facts).cloned().collect())
        }
    }

    pub fn registry_with(
        retriever: Arc<dyn DocumentRetriever>,
        facts: Vec<GraphFact>,
    ) -> ToolRegistry {
        ToolRegistry::new(retriever, Arc::new(StaticFactFetcher { facts }))
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::{StaticRetriever, registry_with};
    use super::*;

    #[test]
    fn parse_accepts_only_registered_names() {
        assert_eq!(
            ToolKind::parse("search_documents"),
            Some(ToolKind::SearchDocuments)
        );
        assert_eq!(
            ToolKind::parse("fetch_graph_facts"),
            Some(ToolKind::FetchGraphFacts)
        );
        assert_eq!(ToolKind::parse("graph"), None);
        assert_eq!(ToolKind::parse("SEARCH_DOCUMENTS"), None);
    }

    #[test]
    fn descriptors_cover_the_full_set() {
        let registry = registry_with(Arc::new(StaticRetriever::returning(Vec::new())), Vec::new());
        let descriptors = registry.descriptors();
        assert_eq!(descriptors.len(), 2);
        assert!(registry.has("search_documents"));
        assert!(registry.has("fetch_graph_facts"));
        assert!(!registry.has("build_pinecone_retriever"));
        for descriptor in &descriptors {
            assert_eq!(
                descriptor.parameters["required"],
                serde_json::json!(["query"])
            );
        }
    }

    #[tokio::test]
    async fn dispatch_uses_defaults_for_missing_arguments() {
        let retriever = Arc::new(StaticRetriever::returning(vec![RetrievedChunk {
            score: Some(0.9),
            content: "Paris is the capital of France.".into(),
        }]));
        let registry = registry_with(retriever.clone(), Vec::new());

        let value = registry
            .dispatch(ToolKind::SearchDocuments, "capital of France", &json!({}))
            .await
            .expect("dispatch succeeds");
        assert_eq!(value.as_array().map(Vec::len), Some(1));

        let recorded = retriever.queries.lock().await;
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].0, "capital of France");
        assert_eq!(recorded[0].1, DEFAULT_ALPHA);
        assert_eq!(recorded[0].2, DEFAULT_RETRIEVE_TOP_K);
    }

    #[tokio::test]
    async fn dispatch_honours_explicit_arguments() {
        let retriever = Arc::new(StaticRetriever::returning(Vec::new()));
        let registry = registry_with(retriever.clone(), Vec::new());

        registry
            .dispatch(
                ToolKind::SearchDocuments,
                "q",
                &json!({"alpha": 0.2, "top_k": 10}),
            )
            .await
            .expect("dispatch succeeds");

        let recorded = retriever.queries.lock().await;
        assert!((recorded[0].1 - 0.2).abs() < f32::EPSILON);
        assert_eq!(recorded[0].2, 10);
    }

    #[tokio::test]
    async fn fact_dispatch_caps_results() {
        let facts: Vec<GraphFact> = (0..5)
            .map(|i| GraphFact {
                subject: Some(format!("node-{i}")),
                relation: None,
                object: None,
                source: None,
                score: Some(1.0),
            })
            .collect();
        let registry = registry_with(Arc::new(StaticRetriever::returning(Vec::new())), facts);

        let value = registry
            .dispatch(ToolKind::FetchGraphFacts, "who is discaya", &json!({}))
            .await
            .expect("dispatch succeeds");
        assert_eq!(value.as_array().map(Vec::len), Some(DEFAULT_MAX_FACTS));
    }
}
