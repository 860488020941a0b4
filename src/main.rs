use clap::Parser;
use ragent::agent::{Agent, AgentConfig};
use ragent::cli::{Cli, RunMode};
use ragent::config::{AppConfig, require_env};
use ragent::graph::Neo4jFactClient;
use ragent::memory::InMemoryThreadStore;
use ragent::model::OpenAiChatClient;
use ragent::retriever::HybridSearchClient;
use ragent::server;
use ragent::tooling::ToolRegistry;
use serde_json::json;
use std::error::Error;
use std::sync::Arc;
use tracing::{debug, info};
use tracing_subscriber::{EnvFilter, fmt};
use uuid::Uuid;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    init_tracing();
    dotenvy::dotenv().ok();
    info!("Starting ragent");

    let cli = Cli::parse();
    debug!(?cli.mode, config = ?cli.config, thread = ?cli.thread, "CLI arguments parsed");
    let config = AppConfig::load(cli.config.as_deref())?;

    let [llm_api_key] = require_env(["DEEPINFRA_API_KEY"])?;
    let provider = Arc::new(OpenAiChatClient::new(
        config.llm_base_url.clone(),
        llm_api_key,
    ));
    let retriever = Arc::new(HybridSearchClient::from_config(&config)?);
    let facts = Arc::new(Neo4jFactClient::from_config(&config)?);
    let registry = Arc::new(ToolRegistry::new(retriever, facts));
    let store = Arc::new(InMemoryThreadStore::new());

    let mut agent_config = AgentConfig::new(config.model.clone());
    if let Some(max_steps) = config.max_tool_steps {
        agent_config = agent_config.with_max_steps(max_steps);
    }
    let agent = Arc::new(Agent::new(provider, registry, store, agent_config));

    info!(mode = ?cli.mode, "Running in selected mode");
    match cli.mode {
        RunMode::Cli => {
            if cli.query.is_empty() {
                return Err("query required in cli mode".into());
            }
            let query = cli.query.join(" ");
            let thread_id = cli
                .thread
                .clone()
                .unwrap_or_else(|| Uuid::new_v4().to_string());

            let outcome = agent.run_turn(&thread_id, query).await?;
            let output = json!({
                "thread_id": outcome.thread_id,
                "answer": outcome.answer,
                "tool_results": outcome
                    .tool_messages
                    .iter()
                    .map(|message| json!({
                        "name": message.tool_name,
                        "content": message.content,
                    }))
                    .collect::<Vec<_>>(),
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        RunMode::Rest => {
            server::serve(agent, &config.server.bind).await?;
        }
    }
    info!("Execution finished");
    Ok(())
}

fn init_tracing() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_level(true)
            .init();
    });
}
