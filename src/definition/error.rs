// ABOUTME: Error types for activity definition building and freezing
// ABOUTME: Covers malformed slot declarations and expression shape problems

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DefinitionError {
    #[error("Duplicate slot '{name}' on activity {activity}")]
    DuplicateSlot { activity: String, name: String },

    #[error("Invalid binding for '{slot}' on activity {activity}: {reason}")]
    InvalidBinding {
        activity: String,
        slot: String,
        reason: String,
    },

    #[error("Expression activity {activity} does not declare a Result argument")]
    MissingResult { activity: String },

    #[error("Activity expressions may only appear at the top of a binding ({activity})")]
    NestedActivityExpression { activity: String },

    #[error("Duplicate delegate '{name}' on activity {activity}")]
    DuplicateDelegate { activity: String, name: String },
}

pub type Result<T> = std::result::Result<T, DefinitionError>;
