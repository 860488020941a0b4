use crate::application::tooling::{FactFetcher, GraphFact, ToolError};
use crate::config::{AppConfig, ConfigError, require_env};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

/// Fulltext match over entity nodes, then a one-hop expansion into
/// relationship facts. Provenance edges to text chunks are excluded so the
/// model only sees entity-to-entity facts.
const FACTS_CYPHER: &str = r#"
CALL db.index.fulltext.queryNodes($index, $terms) YIELD node, score
WITH node, score ORDER BY score DESC LIMIT $top_nodes
OPTIONAL MATCH (node)-[rel]-(neighbour)
WHERE type(rel) <> 'MENTIONS'
  AND NOT any(label IN labels(neighbour) WHERE label IN ['Chunk', 'Paragraph', 'Page', 'Span'])
RETURN coalesce(node.name, node.id) AS subject,
       type(rel) AS relation,
       coalesce(neighbour.name, neighbour.id) AS object,
       coalesce(rel.source, node.source) AS source,
       score
ORDER BY score DESC
LIMIT $max_facts
"#;

const INDEX_STATE_CYPHER: &str =
    "SHOW INDEXES YIELD name, state WHERE name = $name RETURN state";

/// Fact fetcher backed by a Neo4j instance, reached over the HTTP Query API
/// rather than Bolt so the transport stack stays on reqwest.
pub struct Neo4jFactClient {
    http: Client,
    query_url: String,
    username: String,
    password: String,
    fulltext_index: String,
    index_checked: OnceCell<()>,
}

impl Neo4jFactClient {
    pub fn from_config(config: &AppConfig) -> Result<Self, ConfigError> {
        let [uri, username, password] =
            require_env(["NEO4J_HTTP_URI", "NEO4J_USERNAME", "NEO4J_PASSWORD"])?;
        Ok(Self::new(
            uri,
            config.graph.database.clone(),
            username,
            password,
            config.graph.fulltext_index.clone(),
        ))
    }

    pub fn new(
        uri: impl Into<String>,
        database: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
        fulltext_index: impl Into<String>,
    ) -> Self {
        let uri = uri.into();
        let database = database.into();
        Self {
            http: Client::new(),
            query_url: format!("{}/db/{database}/query/v2", uri.trim_end_matches('/')),
            username: username.into(),
            password: password.into(),
            fulltext_index: fulltext_index.into(),
            index_checked: OnceCell::new(),
        }
    }

    async fn run_statement(&self, statement: &str, parameters: Value) -> Result<QueryData, ToolError> {
        let response: QueryResponse = self
            .http
            .post(&self.query_url)
            .basic_auth(&self.username, Some(&self.password))
            .json(&QueryRequest {
                statement,
                parameters,
            })
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if let Some(error) = response.errors.into_iter().next() {
            return Err(ToolError::Backend(error.message));
        }
        response
            .data
            .ok_or_else(|| ToolError::InvalidResponse("query response had no data".into()))
    }

    /// The fulltext index is created at ingest time and populates
    /// asynchronously; queries against a missing or still-populating index
    /// return misleading empties, so refuse to serve until it is ONLINE.
    async fn ensure_index_online(&self) -> Result<(), ToolError> {
        self.index_checked
            .get_or_try_init(|| async {
                let data = self
                    .run_statement(INDEX_STATE_CYPHER, json!({ "name": self.fulltext_index }))
                    .await?;
                let state = data
                    .values
                    .first()
                    .and_then(|row| row.first())
                    .and_then(Value::as_str)
                    .unwrap_or("MISSING");
                if state != "ONLINE" {
                    return Err(ToolError::Backend(format!(
                        "fulltext index '{}' is not available (state: {state})",
                        self.fulltext_index
                    )));
                }
                debug!(index = self.fulltext_index.as_str(), "Fulltext index is online");
                Ok(())
            })
            .await
            .copied()
    }

    async fn query_facts(
        &self,
        terms: &str,
        top_nodes: usize,
        max_facts: usize,
    ) -> Result<Vec<GraphFact>, ToolError> {
        let data = self
            .run_statement(
                FACTS_CYPHER,
                json!({
                    "index": self.fulltext_index,
                    "terms": terms,
                    "top_nodes": top_nodes,
                    "max_facts": max_facts,
                }),
            )
            .await?;
        Ok(rows_to_facts(&data.fields, data.values))
    }
}

#[async_trait]
impl FactFetcher for Neo4jFactClient {
    async fn fetch_facts(
        &self,
        query: &str,
        top_nodes: usize,
        max_facts: usize,
    ) -> Result<Vec<GraphFact>, ToolError> {
        self.ensure_index_online().await?;

        let terms = normalize(query);
        let facts = self.query_facts(&terms, top_nodes, max_facts).await?;
        if !facts.is_empty() {
            info!(terms = terms.as_str(), facts = facts.len(), "Graph lookup matched");
            return Ok(facts);
        }

        // Loosen the match: any single term is enough to surface a node.
        let fallback = fallback_terms(&terms);
        if fallback.is_empty() || fallback == terms {
            return Ok(facts);
        }
        warn!(
            terms = terms.as_str(),
            "No graph facts for combined terms; retrying with OR fallback"
        );
        self.query_facts(&fallback, top_nodes, max_facts).await
    }
}

/// Strips question punctuation and short function words so the fulltext
/// query carries only meaningful terms. An all-short query falls back to the
/// raw lowered text rather than an empty match.
pub fn normalize(query: &str) -> String {
    let lowered = query.to_lowercase().replace('?', " ");
    let terms: Vec<&str> = lowered
        .split_whitespace()
        .filter(|token| token.chars().count() > 2)
        .collect();
    if terms.is_empty() {
        lowered.trim().to_string()
    } else {
        terms.join(" ")
    }
}

/// Rewrites space-separated terms into an explicit Lucene OR query,
/// de-duplicating repeated terms. Short tokens are filtered again here: when
/// normalization fell back to the raw lowered text there is nothing worth
/// an OR requery, and the result is empty.
pub fn fallback_terms(terms: &str) -> String {
    let mut seen = Vec::new();
    for term in terms.split_whitespace() {
        if term.chars().count() > 2 && !seen.contains(&term) {
            seen.push(term);
        }
    }
    seen.join(" OR ")
}

fn rows_to_facts(fields: &[String], values: Vec<Vec<Value>>) -> Vec<GraphFact> {
    let column = |name: &str| fields.iter().position(|field| field == name);
    let subject = column("subject");
    let relation = column("relation");
    let object = column("object");
    let source = column("source");
    let score = column("score");

    let cell_str = |row: &[Value], index: Option<usize>| {
        index
            .and_then(|i| row.get(i))
            .and_then(Value::as_str)
            .map(str::to_string)
    };

    values
        .into_iter()
        .map(|row| GraphFact {
            subject: cell_str(&row, subject),
            relation: cell_str(&row, relation),
            object: cell_str(&row, object),
            source: cell_str(&row, source),
            score: score.and_then(|i| row.get(i)).and_then(Value::as_f64),
        })
        .collect()
}

#[derive(Serialize)]
struct QueryRequest<'a> {
    statement: &'a str,
    parameters: Value,
}

#[derive(Deserialize)]
struct QueryResponse {
    data: Option<QueryData>,
    #[serde(default)]
    errors: Vec<QueryError>,
}

#[derive(Deserialize)]
struct QueryData {
    #[serde(default)]
    fields: Vec<String>,
    #[serde(default)]
    values: Vec<Vec<Value>>,
}

#[derive(Deserialize)]
struct QueryError {
    message: String,
}
