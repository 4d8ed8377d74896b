pub mod artifact;
pub mod config;
pub mod crucible_config;
pub mod errors;
pub mod executor;
pub mod feedback;
pub mod gate;
pub mod journal;
pub mod orchestrator;
pub mod pipeline;
pub mod tracker;
pub mod ui;
