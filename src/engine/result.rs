// ABOUTME: Run outcomes reported to the host after each pulse
// ABOUTME: Captures the root's terminal state, gathered outputs and any unhandled fault

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;

use super::error::Fault;
use super::instance::ActivityState;
use crate::definition::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowCompletion {
    pub state: ActivityState,
    /// Out and in-out root arguments; only gathered when the root closes.
    pub outputs: IndexMap<String, Value>,
    pub fault: Option<Fault>,
    pub completed_at: DateTime<Utc>,
}

impl WorkflowCompletion {
    pub fn new(state: ActivityState, outputs: IndexMap<String, Value>, fault: Option<Fault>) -> Self {
        Self {
            state,
            outputs,
            fault,
            completed_at: Utc::now(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.state == ActivityState::Closed
    }

    pub fn output(&self, name: &str) -> Option<&Value> {
        self.outputs.get(name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// Nothing left to run until an external stimulus arrives.
    Idle,
    Completed(WorkflowCompletion),
}

impl RunOutcome {
    pub fn completion(&self) -> Option<&WorkflowCompletion> {
        match self {
            RunOutcome::Idle => None,
            RunOutcome::Completed(completion) => Some(completion),
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self, RunOutcome::Idle)
    }
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunOutcome::Idle => write!(f, "Idle"),
            RunOutcome::Completed(c) => match &c.fault {
                Some(fault) => write!(f, "Completed ({}): {}", c.state, fault),
                None => write!(f, "Completed ({})", c.state),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_completion_accessors() {
        let mut outputs = IndexMap::new();
        outputs.insert("total".to_string(), json!(3));
        let completion = WorkflowCompletion::new(ActivityState::Closed, outputs, None);
        assert!(completion.is_success());
        assert_eq!(completion.output("total"), Some(&json!(3)));

        let outcome = RunOutcome::Completed(completion);
        assert!(!outcome.is_idle());
        assert_eq!(outcome.to_string(), "Completed (Closed)");
    }

    #[test]
    fn test_faulted_display() {
        let completion = WorkflowCompletion::new(
            ActivityState::Faulted,
            IndexMap::new(),
            Some(Fault::new("boom")),
        );
        assert_eq!(
            RunOutcome::Completed(completion).to_string(),
            "Completed (Faulted): boom"
        );
    }
}
