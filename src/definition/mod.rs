// ABOUTME: Frozen activity definition model consumed by the execution engine
// ABOUTME: Provides slots, expressions, bodies and the freezing builder

pub mod activity;
pub mod error;
pub mod expression;

pub use activity::{
    ActivityBuilder, ActivityDefinition, ArgumentDirection, ArgumentSlot, Body, CodeFn,
    DefinitionRef, DelegateSlot, ParameterSlot, QualifiedId, ValueType, VariableScope,
    VariableSlot, WorkflowDefinition, RESULT_SLOT,
};
pub use error::{DefinitionError, Result};
pub use expression::{BinaryOp, EvaluationError, Expression, SymbolLookup};

/// Runtime values carried by locations, bookmarks and outputs.
pub type Value = serde_json::Value;
