// ABOUTME: Main library module for the trailhead workflow execution core
// ABOUTME: Exports the definition model, the engine, built-in activities, the YAML parser and the CLI

pub mod activities;
pub mod cli;
pub mod definition;
pub mod engine;
pub mod parser;

// Re-export commonly used types
pub use cli::{App, Args, Config};
pub use definition::{ActivityBuilder, Body, WorkflowDefinition};
pub use engine::{
    BookmarkResumptionResult, ExecutionError, Fault, InstanceTree, PersistedState, RunOutcome,
    WorkflowCompletion, WorkflowEngine,
};
pub use parser::{WorkflowDocument, WorkflowParser, WorkflowValidator};

// Error handling
pub type Result<T> = anyhow::Result<T>;

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
