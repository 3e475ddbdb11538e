// ABOUTME: Parser module for YAML workflow documents
// ABOUTME: Exports the document model, the definition builder and validation

pub mod document;
pub mod error;
pub mod validation;
pub mod workflow;

pub use document::{ActivityNode, ArgumentDoc, ExpressionDoc, VariableDoc, WorkflowDocument};
pub use error::{ParserError, ValidationError};
pub use validation::{ValidationReport, WorkflowValidator};
pub use workflow::WorkflowParser;
