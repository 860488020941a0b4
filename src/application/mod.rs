pub mod agent;
pub mod memory;
pub mod tooling;
