// ABOUTME: Error types for workflow document parsing and validation
// ABOUTME: Wraps YAML, activity construction and definition freezing failures

use thiserror::Error;

use crate::activities::ActivityError;
use crate::definition::DefinitionError;

#[derive(Error, Debug)]
pub enum ParserError {
    #[error("Failed to read workflow file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("Invalid workflow format: {0}")]
    InvalidFormat(String),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Validation failed: {0}")]
    ValidationError(#[from] ValidationError),

    #[error("Failed to build activity: {0}")]
    ActivityError(#[from] ActivityError),

    #[error("Invalid definition: {0}")]
    DefinitionError(#[from] DefinitionError),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("Unsupported activity type '{kind}' at {path}. Supported types: {supported:?}")]
    UnsupportedActivityType {
        path: String,
        kind: String,
        supported: Vec<String>,
    },

    #[error("Invalid configuration for {path}: {reason}")]
    InvalidActivityConfig { path: String, reason: String },

    #[error("Activity {path} has no argument named '{slot}'")]
    UnknownArgument { path: String, slot: String },

    #[error("Invalid workflow argument '{name}': {reason}")]
    InvalidArgument { name: String, reason: String },

    #[error("Reference to undeclared symbol '{symbol}' at {path}")]
    UnknownSymbol { path: String, symbol: String },

    #[error("Bookmark '{bookmark}' is waited on by more than one activity: {paths:?}")]
    DuplicateBookmark { bookmark: String, paths: Vec<String> },

    #[error("Workflow cannot be built: {reason}")]
    InvalidDefinition { reason: String },
}

pub type Result<T> = std::result::Result<T, ParserError>;
