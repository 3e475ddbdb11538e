// ABOUTME: Error types for the execution engine
// ABOUTME: Protocol misuse errors for hosts and activities, plus business faults raised by bodies

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use super::instance::InstanceId;
use crate::definition::{EvaluationError, Value, ValueType};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExecutionError {
    #[error("Instance not found: {0}")]
    InstanceNotFound(InstanceId),

    #[error("Instance {0} is not executing")]
    InstanceNotExecuting(InstanceId),

    #[error("Duplicate slot '{slot}' in environment of {environment}")]
    DuplicateSlot { environment: InstanceId, slot: String },

    #[error("Slot not found: {slot}")]
    SlotNotFound { slot: String },

    #[error("Type mismatch for '{slot}': expected {expected}, got {actual}")]
    TypeMismatch {
        slot: String,
        expected: ValueType,
        actual: String,
    },

    #[error("Instance {0} has no environment")]
    NoEnvironment(InstanceId),

    #[error("Bookmark already registered: {name}")]
    DuplicateBookmark { name: String },

    #[error("Bookmark not found: {name}")]
    BookmarkNotFound { name: String },

    #[error("Bookmark scope {scope} is not visible to exclusive handle {handle}")]
    ScopeNotVisible { handle: u64, scope: String },

    #[error("Exclusive handle already initialized under property '{name}'")]
    HandleAlreadyInitialized { name: String },

    #[error("Exclusive handle not found: {0}")]
    HandleNotFound(String),

    #[error("Property '{name}' already registered in this scope")]
    DuplicateProperty { name: String },

    #[error("Property not found: {name}")]
    PropertyNotFound { name: String },

    #[error("Property '{name}' cannot be removed while children are executing")]
    PropertyInUse { name: String },

    #[error("Delegate not found: {name}")]
    DelegateNotFound { name: String },

    #[error("Child definition not found: {0}")]
    ChildNotFound(String),

    #[error("An isolation scope is already active (owner {0})")]
    IsolationActive(InstanceId),

    #[error("No isolation scope owned by {0}")]
    NoIsolation(InstanceId),

    #[error("Workflow is not quiescent: {reason}")]
    NotQuiescent { reason: String },

    #[error("Version mismatch: expected {expected}, found {actual}")]
    VersionMismatch { expected: String, actual: String },

    #[error("Identity mismatch: expected {expected}, found {actual}")]
    IdentityMismatch { expected: String, actual: String },

    #[error("Workflow has no root instance")]
    NoRoot,

    #[error("Workflow execution aborted: {reason}")]
    WorkflowAborted { reason: String },

    #[error("Host inbox is closed")]
    InboxClosed,

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for ExecutionError {
    fn from(err: serde_json::Error) -> Self {
        ExecutionError::Serialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ExecutionError>;

/// A business fault raised by an activity body or callback. Faults travel up
/// the instance tree to the nearest fault handler instead of returning to the
/// host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fault {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl Fault {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for Fault {}

impl From<ExecutionError> for Fault {
    fn from(err: ExecutionError) -> Self {
        Fault::new(err.to_string())
    }
}

impl From<EvaluationError> for Fault {
    fn from(err: EvaluationError) -> Self {
        Fault::new(err.to_string())
    }
}

pub type FaultResult<T> = std::result::Result<T, Fault>;
