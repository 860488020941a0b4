use serde::Deserialize;
use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

const DEFAULT_CONFIG_PATH: &str = "config/ragent.toml";

const DEFAULT_MODEL: &str = "meta-llama/Meta-Llama-3.1-70B-Instruct";
const DEFAULT_EMBED_MODEL: &str = "BAAI/bge-large-en-v1.5";
const DEFAULT_LLM_BASE_URL: &str = "https://api.deepinfra.com/v1/openai";
const DEFAULT_RERANK_URL: &str = "https://api.cohere.com/v2/rerank";
const DEFAULT_RERANK_MODEL: &str = "rerank-v3.5";
const DEFAULT_NAMESPACE: &str = "docs";
const DEFAULT_FULLTEXT_INDEX: &str = "entity_fulltext";
const DEFAULT_BIND: &str = "127.0.0.1:8080";

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub model: String,
    pub llm_base_url: String,
    pub max_tool_steps: Option<usize>,
    pub retrieval: RetrievalConfig,
    pub graph: GraphConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Clone)]
pub struct RetrievalConfig {
    pub embed_model: String,
    /// Host URL of the vector index (the managed service assigns one per index).
    pub index_host: String,
    pub namespace: String,
    pub rerank_url: String,
    pub rerank_model: String,
    pub rerank_top_n: usize,
    /// BM25 statistics dumped at ingest time; required for sparse encoding.
    pub bm25_path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct GraphConfig {
    pub database: String,
    pub fulltext_index: String,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: String,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config from {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse config from {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("failed to parse {path:?}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("missing required environment variables: {keys}")]
    MissingEnv { keys: String },
}

#[derive(Debug, Deserialize, Default)]
struct RawConfig {
    model: Option<String>,
    llm_base_url: Option<String>,
    max_tool_steps: Option<usize>,
    #[serde(default)]
    retrieval: RawRetrieval,
    #[serde(default)]
    graph: RawGraph,
    #[serde(default)]
    server: RawServer,
}

#[derive(Debug, Deserialize, Default)]
struct RawRetrieval {
    embed_model: Option<String>,
    index_host: Option<String>,
    namespace: Option<String>,
    rerank_url: Option<String>,
    rerank_model: Option<String>,
    rerank_top_n: Option<usize>,
    bm25_path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
struct RawGraph {
    database: Option<String>,
    fulltext_index: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct RawServer {
    bind: Option<String>,
}

impl AppConfig {
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = path {
            return read_config(path);
        }
        let default_path = Path::new(DEFAULT_CONFIG_PATH);
        match read_config(default_path) {
            Ok(config) => Ok(config),
            Err(ConfigError::Io { source, .. }) if source.kind() == io::ErrorKind::NotFound => {
                info!("Configuration file not found; using defaults");
                Ok(Self::default())
            }
            Err(other) => Err(other),
        }
    }

    pub fn default() -> Self {
        RawConfig::default().into()
    }
}

fn read_config(path: &Path) -> Result<AppConfig, ConfigError> {
    debug!(path = %path.display(), "Reading configuration file");
    let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let parsed: RawConfig = toml::from_str(&content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(parsed.into())
}

impl From<RawConfig> for AppConfig {
    fn from(raw: RawConfig) -> Self {
        Self {
            model: raw.model.unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            llm_base_url: raw
                .llm_base_url
                .unwrap_or_else(|| DEFAULT_LLM_BASE_URL.to_string()),
            max_tool_steps: raw.max_tool_steps,
            retrieval: RetrievalConfig {
                embed_model: raw
                    .retrieval
                    .embed_model
                    .unwrap_or_else(|| DEFAULT_EMBED_MODEL.to_string()),
                index_host: raw.retrieval.index_host.unwrap_or_default(),
                namespace: raw
                    .retrieval
                    .namespace
                    .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string()),
                rerank_url: raw
                    .retrieval
                    .rerank_url
                    .unwrap_or_else(|| DEFAULT_RERANK_URL.to_string()),
                rerank_model: raw
                    .retrieval
                    .rerank_model
                    .unwrap_or_else(|| DEFAULT_RERANK_MODEL.to_string()),
                rerank_top_n: raw.retrieval.rerank_top_n.unwrap_or(3),
                bm25_path: raw
                    .retrieval
                    .bm25_path
                    .unwrap_or_else(|| PathBuf::from("bm25_values.json")),
            },
            graph: GraphConfig {
                database: raw.graph.database.unwrap_or_else(|| "neo4j".to_string()),
                fulltext_index: raw
                    .graph
                    .fulltext_index
                    .unwrap_or_else(|| DEFAULT_FULLTEXT_INDEX.to_string()),
            },
            server: ServerConfig {
                bind: raw.server.bind.unwrap_or_else(|| DEFAULT_BIND.to_string()),
            },
        }
    }
}

/// Secrets stay out of the TOML file; collaborator clients pull them from the
/// environment at construction and fail fast when absent, reporting every
/// missing key at once.
pub fn require_env<const N: usize>(keys: [&str; N]) -> Result<[String; N], ConfigError> {
    let mut values = Vec::with_capacity(N);
    let mut missing = Vec::new();
    for key in keys {
        match env::var(key) {
            Ok(value) if !value.is_empty() => values.push(value),
            _ => missing.push(key),
        }
    }
    values.try_into().map_err(|_| ConfigError::MissingEnv {
        keys: missing.join(", "),
    })
}
