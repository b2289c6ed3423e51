pub mod engine;
pub mod targets;
pub mod types;
