pub mod application;
pub mod cli;
pub mod config;
pub mod domain;
pub mod infrastructure;

pub use application::{agent, memory, tooling};
pub use domain::types;
pub use infrastructure::{graph, model, retriever, server};
