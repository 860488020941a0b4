pub mod graph;
pub mod model;
pub mod retriever;
pub mod server;
