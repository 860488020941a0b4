use clap::{Parser, ValueEnum};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "ragent",
    version,
    about = "Question answering over indexed documents and a knowledge graph"
)]
pub struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Conversation thread to continue; omitted starts a fresh thread.
    #[arg(long)]
    pub thread: Option<String>,
    #[arg(long, value_enum, default_value_t = RunMode::Cli)]
    pub mode: RunMode,
    /// The question to ask (cli mode).
    #[arg()]
    pub query: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum RunMode {
    Cli,
    Rest,
}
