pub mod runner;
pub mod service;
pub mod state;

pub use runner::WorkflowRunner;
pub use service::WorkflowService;
pub use state::{PhaseState, RunId, RunOptions, RunState, TerminalReason};
