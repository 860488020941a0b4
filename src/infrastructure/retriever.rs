use crate::application::tooling::{DocumentRetriever, RetrievedChunk, ToolError};
use crate::config::{AppConfig, ConfigError, require_env};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tracing::{debug, info};

/// Sparse query vector in the index's (term hash -> weight) space.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SparseVector {
    pub indices: Vec<u32>,
    pub values: Vec<f32>,
}

impl SparseVector {
    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }
}

/// BM25 statistics dumped at ingest time. Query-side encoding only needs the
/// per-term document frequencies and the corpus size.
#[derive(Debug, Deserialize)]
struct Bm25Dump {
    n_docs: u32,
    terms: HashMap<String, Bm25Term>,
}

#[derive(Debug, Deserialize)]
struct Bm25Term {
    index: u32,
    doc_freq: u32,
}

#[derive(Debug)]
pub struct Bm25QueryEncoder {
    n_docs: u32,
    terms: HashMap<String, Bm25Term>,
}

impl Bm25QueryEncoder {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let dump: Bm25Dump = serde_json::from_str(&content).map_err(|source| ConfigError::Json {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self {
            n_docs: dump.n_docs,
            terms: dump.terms,
        })
    }

    #[cfg(test)]
    fn from_terms(n_docs: u32, terms: Vec<(&str, u32, u32)>) -> Self {
        Self {
            n_docs,
            terms: terms
                .into_iter()
                .map(|(term, index, doc_freq)| (term.to_string(), Bm25Term { index, doc_freq }))
                .collect(),
        }
    }

    /// Query-side BM25: each known term contributes its idf, scaled by how
    /// often it occurs in the query. Unknown terms are dropped.
    pub fn encode_query(&self, query: &str) -> SparseVector {
        let mut counts: HashMap<&str, u32> = HashMap::new();
        let tokens = tokenize(query);
        for token in &tokens {
            *counts.entry(token.as_str()).or_default() += 1;
        }

        let mut weighted: Vec<(u32, f32)> = counts
            .into_iter()
            .filter_map(|(token, count)| {
                self.terms.get(token).map(|term| {
                    let idf = self.idf(term.doc_freq);
                    (term.index, count as f32 * idf)
                })
            })
            .collect();
        weighted.sort_by_key(|(index, _)| *index);

        SparseVector {
            indices: weighted.iter().map(|(index, _)| *index).collect(),
            values: weighted.iter().map(|(_, value)| *value).collect(),
        }
    }

    fn idf(&self, doc_freq: u32) -> f32 {
        let n = self.n_docs as f32;
        let df = doc_freq as f32;
        (1.0 + (n - df + 0.5) / (df + 0.5)).ln()
    }
}

fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|token| !token.is_empty())
        .map(str::to_string)
        .collect()
}

/// Convex interpolation between dense and sparse: alpha 1 keeps only the
/// dense signal, alpha 0 only the sparse one. Alpha is clamped to [0, 1].
pub fn hybrid_convex_scale(dense: &mut [f32], sparse: &mut SparseVector, alpha: f32) {
    let alpha = alpha.clamp(0.0, 1.0);
    for value in dense.iter_mut() {
        *value *= alpha;
    }
    for value in sparse.values.iter_mut() {
        *value *= 1.0 - alpha;
    }
}

/// Hybrid retriever over a managed vector index, with a hosted re-rank stage
/// truncating the candidates to a small top-N.
pub struct HybridSearchClient {
    http: Client,
    embeddings_url: String,
    embed_model: String,
    llm_api_key: String,
    index_host: String,
    index_api_key: String,
    namespace: String,
    rerank_url: String,
    rerank_api_key: String,
    rerank_model: String,
    rerank_top_n: usize,
    bm25: Bm25QueryEncoder,
}

impl HybridSearchClient {
    pub fn from_config(config: &AppConfig) -> Result<Self, ConfigError> {
        let [llm_api_key, index_api_key, rerank_api_key] =
            require_env(["DEEPINFRA_API_KEY", "PINECONE_API_KEY", "COHERE_API_KEY"])?;
        let bm25 = Bm25QueryEncoder::load(&config.retrieval.bm25_path)?;

        let base = config.llm_base_url.trim_end_matches('/');
        Ok(Self {
            http: Client::new(),
            embeddings_url: format!("{base}/embeddings"),
            embed_model: config.retrieval.embed_model.clone(),
            llm_api_key,
            index_host: config.retrieval.index_host.trim_end_matches('/').to_string(),
            index_api_key,
            namespace: config.retrieval.namespace.clone(),
            rerank_url: config.retrieval.rerank_url.clone(),
            rerank_api_key,
            rerank_model: config.retrieval.rerank_model.clone(),
            rerank_top_n: config.retrieval.rerank_top_n,
            bm25,
        })
    }

    async fn embed(&self, query: &str) -> Result<Vec<f32>, ToolError> {
        let response: EmbeddingResponse = self
            .http
            .post(&self.embeddings_url)
            .bearer_auth(&self.llm_api_key)
            .json(&EmbeddingRequest {
                model: &self.embed_model,
                input: vec![query],
            })
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        response
            .data
            .into_iter()
            .next()
            .map(|item| item.embedding)
            .ok_or_else(|| ToolError::InvalidResponse("embedding response had no data".into()))
    }

    async fn query_index(
        &self,
        dense: Vec<f32>,
        sparse: SparseVector,
        top_k: usize,
    ) -> Result<Vec<IndexMatch>, ToolError> {
        let payload = IndexQueryRequest {
            vector: dense,
            sparse_vector: if sparse.is_empty() { None } else { Some(sparse) },
            top_k,
            namespace: &self.namespace,
            include_metadata: true,
        };
        let response: IndexQueryResponse = self
            .http
            .post(format!("{}/query", self.index_host))
            .header("Api-Key", &self.index_api_key)
            .json(&payload)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(response.matches)
    }

    async fn rerank(
        &self,
        query: &str,
        matches: &[IndexMatch],
    ) -> Result<Vec<RerankResult>, ToolError> {
        let documents: Vec<&str> = matches.iter().map(|m| m.text()).collect();
        let response: RerankResponse = self
            .http
            .post(&self.rerank_url)
            .bearer_auth(&self.rerank_api_key)
            .json(&RerankRequest {
                model: &self.rerank_model,
                query,
                documents,
                top_n: self.rerank_top_n,
            })
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(response.results)
    }
}

#[async_trait]
impl DocumentRetriever for HybridSearchClient {
    async fn retrieve(
        &self,
        query: &str,
        alpha: f32,
        top_k: usize,
    ) -> Result<Vec<RetrievedChunk>, ToolError> {
        let mut dense = self.embed(query).await?;
        let mut sparse = self.bm25.encode_query(query);
        hybrid_convex_scale(&mut dense, &mut sparse, alpha);
        debug!(
            sparse_terms = sparse.indices.len(),
            alpha, top_k, "Running hybrid index query"
        );

        let matches = self.query_index(dense, sparse, top_k).await?;
        if matches.is_empty() {
            // A valid result: the model is expected to say it found nothing.
            info!("Hybrid query returned no candidates");
            return Ok(Vec::new());
        }

        let reranked = self.rerank(query, &matches).await?;
        Ok(apply_rerank(&matches, &reranked))
    }
}

/// Maps the re-ranker's ordering back onto the candidate texts. Out-of-range
/// indices from the service are skipped rather than trusted.
fn apply_rerank(matches: &[IndexMatch], reranked: &[RerankResult]) -> Vec<RetrievedChunk> {
    reranked
        .iter()
        .filter_map(|result| {
            matches.get(result.index).map(|m| RetrievedChunk {
                score: Some(result.relevance_score),
                content: m.text().to_string(),
            })
        })
        .collect()
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: Vec<&'a str>,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingItem>,
}

#[derive(Deserialize)]
struct EmbeddingItem {
    embedding: Vec<f32>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct IndexQueryRequest<'a> {
    vector: Vec<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    sparse_vector: Option<SparseVector>,
    top_k: usize,
    namespace: &'a str,
    include_metadata: bool,
}

#[derive(Debug, Deserialize)]
struct IndexQueryResponse {
    #[serde(default)]
    matches: Vec<IndexMatch>,
}

#[derive(Debug, Deserialize)]
struct IndexMatch {
    #[serde(default)]
    metadata: IndexMetadata,
}

impl IndexMatch {
    /// Chunk text lives under the `context` metadata key, with `text` as a
    /// fallback for indexes written by other tooling.
    fn text(&self) -> &str {
        self.metadata
            .context
            .as_deref()
            .or(self.metadata.text.as_deref())
            .unwrap_or_default()
    }
}

#[derive(Debug, Default, Deserialize)]
struct IndexMetadata {
    context: Option<String>,
    text: Option<String>,
}

#[derive(Serialize)]
struct RerankRequest<'a> {
    model: &'a str,
    query: &'a str,
    documents: Vec<&'a str>,
    top_n: usize,
}

#[derive(Deserialize)]
struct RerankResponse {
    results: Vec<RerankResult>,
}

#[derive(Debug, Deserialize)]
struct RerankResult {
    index: usize,
    relevance_score: f32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoder() -> Bm25QueryEncoder {
        // "discaya" is rare, "the" is everywhere.
        Bm25QueryEncoder::from_terms(1000, vec![("discaya", 7, 2), ("capital", 3, 40), ("the", 1, 990)])
    }

    #[test]
    fn tokenize_lowercases_and_splits_punctuation() {
        assert_eq!(
            tokenize("What is the Capital, of France?"),
            vec!["what", "is", "the", "capital", "of", "france"]
        );
        assert!(tokenize("??!").is_empty());
    }

    #[test]
    fn rare_terms_weigh_more_than_common_ones() {
        let sparse = encoder().encode_query("the discaya capital");
        assert_eq!(sparse.indices, vec![1, 3, 7]);
        let weight = |index: u32| {
            let pos = sparse.indices.iter().position(|i| *i == index).unwrap();
            sparse.values[pos]
        };
        assert!(weight(7) > weight(3));
        assert!(weight(3) > weight(1));
    }

    #[test]
    fn unknown_terms_produce_empty_sparse_vector() {
        let sparse = encoder().encode_query("zanzibar flamingo");
        assert!(sparse.is_empty());
    }

    #[test]
    fn repeated_query_terms_scale_linearly() {
        let once = encoder().encode_query("discaya");
        let twice = encoder().encode_query("discaya discaya");
        assert!((twice.values[0] - 2.0 * once.values[0]).abs() < 1e-6);
    }

    #[test]
    fn convex_scale_splits_weight_between_spaces() {
        let mut dense = vec![1.0, 1.0];
        let mut sparse = SparseVector {
            indices: vec![0],
            values: vec![1.0],
        };
        hybrid_convex_scale(&mut dense, &mut sparse, 0.7);
        assert!((dense[0] - 0.7).abs() < 1e-6);
        assert!((sparse.values[0] - 0.3).abs() < 1e-6);
    }

    #[test]
    fn convex_scale_clamps_alpha() {
        let mut dense = vec![1.0];
        let mut sparse = SparseVector {
            indices: vec![0],
            values: vec![1.0],
        };
        hybrid_convex_scale(&mut dense, &mut sparse, 1.5);
        assert_eq!(dense[0], 1.0);
        assert_eq!(sparse.values[0], 0.0);
    }

    #[test]
    fn apply_rerank_follows_reranker_order_and_skips_bad_indices() {
        let raw = r#"{"matches": [
            {"metadata": {"context": "chunk zero"}},
            {"metadata": {"context": "chunk one"}},
            {"metadata": {"text": "chunk two"}}
        ]}"#;
        let response: IndexQueryResponse = serde_json::from_str(raw).expect("parses");
        let reranked = vec![
            RerankResult { index: 2, relevance_score: 0.9 },
            RerankResult { index: 0, relevance_score: 0.4 },
            RerankResult { index: 9, relevance_score: 0.1 },
        ];

        let chunks = apply_rerank(&response.matches, &reranked);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].content, "chunk two");
        assert_eq!(chunks[0].score, Some(0.9));
        assert_eq!(chunks[1].content, "chunk zero");
    }

    #[test]
    fn load_reads_dumped_statistics() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("bm25_values.json");
        std::fs::write(
            &path,
            r#"{"avgdl": 40.2, "n_docs": 1000, "k1": 1.5, "b": 0.75,
                "terms": {"discaya": {"index": 7, "doc_freq": 2}}}"#,
        )
        .expect("write dump");

        let encoder = Bm25QueryEncoder::load(&path).expect("load succeeds");
        let sparse = encoder.encode_query("discaya");
        assert_eq!(sparse.indices, vec![7]);
    }

    #[test]
    fn malformed_dump_is_a_parse_error_naming_the_path() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("bm25_values.json");
        std::fs::write(&path, "{not json").expect("write dump");

        let error = Bm25QueryEncoder::load(&path).expect_err("parse fails");
        match error {
            ConfigError::Json { path: seen, .. } => assert_eq!(seen, path),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn match_without_metadata_yields_empty_text() {
        let response: IndexQueryResponse =
            serde_json::from_str(r#"{"matches": [{}]}"#).expect("parses");
        assert_eq!(response.matches[0].text(), "");
    }
}
