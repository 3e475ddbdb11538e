// ABOUTME: Error types for building built-in activities from document nodes
// ABOUTME: Reports unknown kinds, malformed configuration and unknown argument bindings

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ActivityError {
    #[error("Activity type not supported: {kind}")]
    UnsupportedKind { kind: String, supported: Vec<String> },

    #[error("Invalid configuration for {activity}: {reason}")]
    InvalidConfig { activity: String, reason: String },

    #[error("Activity {activity} has no argument named '{slot}'")]
    UnknownArgument { activity: String, slot: String },

    #[error("Invalid expression in {activity}: {reason}")]
    InvalidExpression { activity: String, reason: String },
}

pub type Result<T> = std::result::Result<T, ActivityError>;
